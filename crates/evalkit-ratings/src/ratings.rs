//! Rating rules and scoring
//!
//! A rule looks at a finished [`EvalOutcome`] and returns a coefficient in
//! `[0, 1]`; the rule's points are scaled by it. Skipped rules count towards
//! neither the total nor the maximum.

use evalkit_core::Stage;
use evalkit_orchestrator::EvalOutcome;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatingState {
    Executed,
    Skipped,
}

/// What one rule made of an outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingOutcome {
    pub state: RatingState,
    /// Share of the rule's points awarded, in `[0, 1]`
    pub coefficient: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RatingOutcome {
    pub fn executed(coefficient: f64) -> Self {
        Self {
            state: RatingState::Executed,
            coefficient,
            message: None,
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            state: RatingState::Skipped,
            coefficient: 0.0,
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A check scored against every finished eval
pub trait RatingRule: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Points awarded for a coefficient of 1
    fn max_points(&self) -> f64;

    fn rate(&self, outcome: &EvalOutcome) -> RatingOutcome;
}

/// Build succeeded; each repair divides the points
pub struct SuccessfulBuildRating;

impl RatingRule for SuccessfulBuildRating {
    fn id(&self) -> &str {
        "common-successful-build"
    }

    fn name(&self) -> &str {
        "Build succeeds"
    }

    fn max_points(&self) -> f64 {
        50.0
    }

    fn rate(&self, outcome: &EvalOutcome) -> RatingOutcome {
        if outcome.not_scheduled == Some(Stage::Build) {
            return RatingOutcome::skipped("The build was never scheduled.");
        }
        if outcome.build_result.is_success() {
            RatingOutcome::executed(1.0 / (outcome.repair_attempts as f64 + 1.0))
        } else {
            RatingOutcome::executed(0.0).with_message("The build failed.")
        }
    }
}

/// Tests ran and passed
pub struct SuccessfulTestsRating;

impl RatingRule for SuccessfulTestsRating {
    fn id(&self) -> &str {
        "common-successful-tests"
    }

    fn name(&self) -> &str {
        "Tests pass successfully"
    }

    fn max_points(&self) -> f64 {
        30.0
    }

    fn rate(&self, outcome: &EvalOutcome) -> RatingOutcome {
        if outcome.not_scheduled == Some(Stage::Test) {
            return RatingOutcome::skipped("Unit tests were never scheduled.");
        }
        let Some(test) = &outcome.test_result else {
            return RatingOutcome::skipped("Unit tests were not run.");
        };
        if test.passed {
            RatingOutcome::executed(1.0 / (outcome.test_repair_attempts as f64 + 1.0))
        } else {
            RatingOutcome::executed(0.0).with_message("Unit tests failed.")
        }
    }
}

/// The served app reported no runtime errors
pub struct NoRuntimeErrorsRating;

impl RatingRule for NoRuntimeErrorsRating {
    fn id(&self) -> &str {
        "common-no-runtime-errors"
    }

    fn name(&self) -> &str {
        "No runtime errors"
    }

    fn max_points(&self) -> f64 {
        20.0
    }

    fn rate(&self, outcome: &EvalOutcome) -> RatingOutcome {
        let Some(serve) = &outcome.serve_testing_result else {
            return RatingOutcome::skipped("The app was not served.");
        };
        match serve.runtime_errors.as_deref().map(str::trim) {
            Some(errors) if !errors.is_empty() => {
                RatingOutcome::executed(0.0).with_message(errors.to_string())
            }
            _ => RatingOutcome::executed(1.0),
        }
    }
}

/// Rules applied when nothing else is configured
pub fn built_in_rules() -> Vec<Box<dyn RatingRule>> {
    vec![
        Box::new(SuccessfulBuildRating),
        Box::new(SuccessfulTestsRating),
        Box::new(NoRuntimeErrorsRating),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub total_points: f64,
    pub max_overall_points: f64,
}

impl Score {
    /// Whole-number percentage, rounded down; 0 when nothing could be scored
    pub fn percentage(&self) -> u32 {
        if self.max_overall_points <= 0.0 {
            return 0;
        }
        (self.total_points / self.max_overall_points * 100.0).floor() as u32
    }
}

/// Result of one rule within an assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub id: String,
    pub name: String,
    pub points: f64,
    pub max_points: f64,
    #[serde(flatten)]
    pub outcome: RatingOutcome,
}

/// A scored eval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub outcome: EvalOutcome,
    pub score: Score,
    pub rule_results: Vec<RuleResult>,
}

fn rate_all(outcome: &EvalOutcome, rules: &[Box<dyn RatingRule>]) -> Vec<RuleResult> {
    rules
        .iter()
        .map(|rule| {
            let mut rating = rule.rate(outcome);
            if !rating.coefficient.is_finite() {
                rating.coefficient = 0.0;
            }
            rating.coefficient = rating.coefficient.clamp(0.0, 1.0);

            let points = match rating.state {
                RatingState::Executed => rule.max_points() * rating.coefficient,
                RatingState::Skipped => 0.0,
            };
            debug!("{}: {} -> {:.1}/{}", outcome.prompt.name, rule.id(), points, rule.max_points());
            RuleResult {
                id: rule.id().to_string(),
                name: rule.name().to_string(),
                points,
                max_points: rule.max_points(),
                outcome: rating,
            }
        })
        .collect()
}

fn total(results: &[RuleResult]) -> Score {
    results
        .iter()
        .filter(|r| r.outcome.state == RatingState::Executed)
        .fold(Score::default(), |score, r| Score {
            total_points: score.total_points + r.points,
            max_overall_points: score.max_overall_points + r.max_points,
        })
}

/// Score an outcome against `rules`
pub fn score_outcome(outcome: &EvalOutcome, rules: &[Box<dyn RatingRule>]) -> Score {
    total(&rate_all(outcome, rules))
}

/// Score an outcome and keep the per-rule breakdown
pub fn assess(outcome: EvalOutcome, rules: &[Box<dyn RatingRule>]) -> AssessmentResult {
    let rule_results = rate_all(&outcome, rules);
    AssessmentResult {
        score: total(&rule_results),
        rule_results,
        outcome,
    }
}
