//! Run-level statistics over assessed evals

use evalkit_core::{BuildErrorType, EvalError, Result, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ratings::AssessmentResult;

/// `(name, id, min, max)` of every score bucket, best first
pub const BUCKET_CONFIG: &[(&str, &str, u32, u32)] = &[
    ("Excellent", "excellent", 98, 100),
    ("Great", "great", 85, 97),
    ("Good", "good", 71, 84),
    ("Poor", "poor", 0, 70),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBucket {
    pub name: String,
    /// Name plus its range, e.g. `Great (85-97%)`
    pub name_with_labels: String,
    pub id: String,
    pub min: u32,
    pub max: u32,
    pub apps_count: usize,
}

impl ScoreBucket {
    fn new(name: &str, id: &str, min: u32, max: u32) -> Self {
        let range = if min == max {
            max.to_string()
        } else {
            format!("{}-{}", min, max)
        };
        Self {
            name: name.to_string(),
            name_with_labels: format!("{} ({}%)", name, range),
            id: id.to_string(),
            min,
            max,
            apps_count: 0,
        }
    }

    fn contains(&self, percentage: u32) -> bool {
        percentage >= self.min && percentage <= self.max
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub successful_initial_builds: usize,
    pub successful_builds_after_repair: usize,
    pub failed_builds: usize,
    /// Builds that never got a worker; not counted as failures
    #[serde(default)]
    pub not_scheduled_builds: usize,
    /// Failed builds per error type; `None` when no failure was classified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_distribution: Option<BTreeMap<BuildErrorType, usize>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStats {
    pub successful_initial_tests: usize,
    pub successful_tests_after_repair: usize,
    pub failed_tests: usize,
    pub no_tests_run: usize,
    /// Test runs that never got a worker
    #[serde(default)]
    pub not_scheduled_tests: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub apps_with_errors: usize,
    pub apps_without_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibilityStats {
    pub apps_with_errors: usize,
    pub apps_without_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStats {
    pub apps_with_errors: usize,
    pub apps_without_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRunStats {
    pub builds: BuildStats,
    pub tests: TestStats,
    pub buckets: Vec<ScoreBucket>,
    /// Present once any app was served
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility: Option<AccessibilityStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityStats>,
}

/// Fold assessments into run-level statistics.
///
/// Fails with [`EvalError::Internal`] if a score percentage fits no bucket.
pub fn calculate_build_and_check_stats(assessments: &[AssessmentResult]) -> Result<AggregatedRunStats> {
    let mut builds = BuildStats::default();
    let mut error_distribution: BTreeMap<BuildErrorType, usize> = BTreeMap::new();
    let mut tests = TestStats::default();
    let mut runtime: Option<RuntimeStats> = None;
    let mut accessibility: Option<AccessibilityStats> = None;
    let mut security: Option<SecurityStats> = None;
    let mut buckets: Vec<ScoreBucket> = BUCKET_CONFIG
        .iter()
        .map(|(name, id, min, max)| ScoreBucket::new(name, id, *min, *max))
        .collect();

    for result in assessments {
        let outcome = &result.outcome;

        if outcome.not_scheduled == Some(Stage::Build) {
            builds.not_scheduled_builds += 1;
        } else if outcome.build_result.is_success() {
            if outcome.repair_attempts == 0 {
                builds.successful_initial_builds += 1;
            } else {
                builds.successful_builds_after_repair += 1;
            }
        } else {
            builds.failed_builds += 1;
            if let Some(error_type) = outcome.build_result.error_type {
                *error_distribution.entry(error_type).or_default() += 1;
            }
        }

        match &outcome.test_result {
            _ if outcome.not_scheduled == Some(Stage::Test) => tests.not_scheduled_tests += 1,
            Some(test) if test.passed => {
                if outcome.test_repair_attempts == 0 {
                    tests.successful_initial_tests += 1;
                } else {
                    tests.successful_tests_after_repair += 1;
                }
            }
            Some(_) => tests.failed_tests += 1,
            None => tests.no_tests_run += 1,
        }

        let serve = outcome.serve_testing_result.as_ref();

        if let Some(errors) = serve.and_then(|s| s.runtime_errors.as_deref()) {
            let stats = runtime.get_or_insert_with(RuntimeStats::default);
            if !errors.trim().is_empty() {
                stats.apps_with_errors += 1;
            }
        } else if serve.is_some() {
            runtime.get_or_insert_with(RuntimeStats::default);
        }

        if let Some(violations) = serve.and_then(|s| s.axe_violations.as_ref()) {
            let stats = accessibility.get_or_insert_with(AccessibilityStats::default);
            if violations.is_empty() {
                stats.apps_without_errors += 1;
            } else {
                stats.apps_with_errors += 1;
            }
        }

        let safety = outcome.build_result.safety_violations.as_ref();
        let csp = serve.and_then(|s| s.csp_violations.as_ref());
        if safety.is_some() || csp.is_some() {
            let stats = security.get_or_insert_with(SecurityStats::default);
            let csp_violations = csp
                .map(|v| v.iter().filter(|v| !v.is_trusted_types()).count())
                .unwrap_or(0);
            let safety_violations = safety.map(Vec::len).unwrap_or(0);
            if csp_violations > 0 || safety_violations > 0 {
                stats.apps_with_errors += 1;
            } else {
                stats.apps_without_errors += 1;
            }
        }

        let percentage = result.score.percentage();
        let bucket = buckets
            .iter_mut()
            .find(|b| b.contains(percentage))
            .ok_or_else(|| EvalError::Internal(format!("Score {} did not fit into any bucket", percentage)))?;
        bucket.apps_count += 1;
    }

    if !error_distribution.is_empty() {
        builds.error_distribution = Some(error_distribution);
    }

    // Apps without runtime errors are counted among the successful builds
    if let Some(stats) = runtime.as_mut() {
        let built = builds.successful_initial_builds + builds.successful_builds_after_repair;
        stats.apps_without_errors = built.saturating_sub(stats.apps_with_errors);
    }

    Ok(AggregatedRunStats {
        builds,
        tests,
        buckets,
        runtime,
        accessibility,
        security,
    })
}

/// Whether apps in `bucket` count as a good result
pub fn is_positive_score(bucket: &ScoreBucket) -> bool {
    bucket.min >= 50
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratings::tests::outcome;
    use crate::ratings::{assess, built_in_rules, Score};
    use evalkit_core::{BuildResult, CspViolation, ServeTestingResult, TestExecutionResult};

    fn scored(total: f64, max: f64) -> AssessmentResult {
        AssessmentResult {
            outcome: outcome(true, 0),
            score: Score {
                total_points: total,
                max_overall_points: max,
            },
            rule_results: Vec::new(),
        }
    }

    fn bucket_counts(stats: &AggregatedRunStats) -> Vec<usize> {
        stats.buckets.iter().map(|b| b.apps_count).collect()
    }

    #[test]
    fn test_bucket_edges() {
        let stats = calculate_build_and_check_stats(&[
            scored(98.0, 100.0),
            scored(97.9, 100.0),
            scored(85.0, 100.0),
            scored(84.99, 100.0),
            scored(71.0, 100.0),
            scored(70.0, 100.0),
            scored(0.0, 100.0),
        ])
        .unwrap();
        assert_eq!(bucket_counts(&stats), vec![1, 2, 2, 2]);
        assert_eq!(stats.buckets[1].name_with_labels, "Great (85-97%)");
    }

    #[test]
    fn test_zero_max_points_is_poor() {
        let stats = calculate_build_and_check_stats(&[scored(0.0, 0.0)]).unwrap();
        assert_eq!(bucket_counts(&stats), vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_score_above_range_is_an_error() {
        let err = calculate_build_and_check_stats(&[scored(150.0, 100.0)]).unwrap_err();
        assert!(matches!(err, EvalError::Internal(_)));
        assert!(err.to_string().contains("150"));
    }

    #[test]
    fn test_build_and_test_counts() {
        let rules = built_in_rules();
        let mut failed = outcome(false, 2);
        failed.build_result = BuildResult::error("TS2304", Some(BuildErrorType::TypeScript));

        let mut tested = outcome(true, 1);
        tested.test_result = Some(TestExecutionResult {
            passed: true,
            output: String::new(),
        });
        tested.test_repair_attempts = 1;

        let mut failing_tests = outcome(true, 0);
        failing_tests.test_result = Some(TestExecutionResult {
            passed: false,
            output: String::new(),
        });

        let stats = calculate_build_and_check_stats(&[
            assess(outcome(true, 0), &rules),
            assess(failed, &rules),
            assess(tested, &rules),
            assess(failing_tests, &rules),
        ])
        .unwrap();

        assert_eq!(stats.builds.successful_initial_builds, 2);
        assert_eq!(stats.builds.successful_builds_after_repair, 1);
        assert_eq!(stats.builds.failed_builds, 1);
        assert_eq!(
            stats.builds.error_distribution.unwrap().get(&BuildErrorType::TypeScript),
            Some(&1)
        );
        assert_eq!(stats.tests.successful_initial_tests, 0);
        assert_eq!(stats.tests.successful_tests_after_repair, 1);
        assert_eq!(stats.tests.failed_tests, 1);
        assert_eq!(stats.tests.no_tests_run, 2);
        assert!(stats.runtime.is_none());
        assert!(stats.security.is_none());
    }

    #[test]
    fn test_unscheduled_work_is_not_a_failure() {
        let rules = built_in_rules();
        let mut no_build = outcome(false, 0);
        no_build.not_scheduled = Some(Stage::Build);
        let mut no_tests = outcome(true, 0);
        no_tests.not_scheduled = Some(Stage::Test);

        let stats = calculate_build_and_check_stats(&[
            assess(no_build, &rules),
            assess(no_tests, &rules),
        ])
        .unwrap();

        assert_eq!(stats.builds.not_scheduled_builds, 1);
        assert_eq!(stats.builds.failed_builds, 0);
        assert_eq!(stats.builds.successful_initial_builds, 1);
        assert_eq!(stats.tests.not_scheduled_tests, 1);
        assert_eq!(stats.tests.failed_tests, 0);
        assert_eq!(stats.tests.no_tests_run, 1);
    }

    #[test]
    fn test_runtime_and_security_tallies() {
        let rules = built_in_rules();
        let mut broken = outcome(true, 0);
        broken.serve_testing_result = Some(ServeTestingResult {
            runtime_errors: Some("ReferenceError".to_string()),
            csp_violations: Some(vec![CspViolation {
                blocked_uri: "inline".to_string(),
                violated_directive: "script-src".to_string(),
            }]),
            ..Default::default()
        });

        let mut clean = outcome(true, 0);
        clean.serve_testing_result = Some(ServeTestingResult {
            csp_violations: Some(vec![CspViolation {
                blocked_uri: "trusted-types-sink".to_string(),
                violated_directive: "require-trusted-types-for".to_string(),
            }]),
            ..Default::default()
        });

        let stats = calculate_build_and_check_stats(&[
            assess(broken, &rules),
            assess(clean, &rules),
            assess(outcome(true, 0), &rules),
        ])
        .unwrap();

        let runtime = stats.runtime.unwrap();
        assert_eq!(runtime.apps_with_errors, 1);
        assert_eq!(runtime.apps_without_errors, 2);

        let security = stats.security.unwrap();
        assert_eq!(security.apps_with_errors, 1);
        assert_eq!(security.apps_without_errors, 1);
        assert!(stats.accessibility.is_none());
    }

    #[test]
    fn test_positive_buckets() {
        let stats = calculate_build_and_check_stats(&[]).unwrap();
        let positive: Vec<_> = stats
            .buckets
            .iter()
            .filter(|b| is_positive_score(b))
            .map(|b| b.id.as_str())
            .collect();
        assert_eq!(positive, vec!["excellent", "great", "good"]);
    }
}
