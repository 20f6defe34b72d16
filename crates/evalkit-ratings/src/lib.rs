//! # evalkit-ratings
//!
//! Scoring and run-level statistics for evalkit.
//!
//! This crate provides:
//! - Rating rules and the built-in rule set
//! - Assessment of finished evals
//! - Aggregated statistics and score buckets
//! - Saved run reports

mod ratings;
mod report;
mod stats;

pub use ratings::{
    assess, built_in_rules, score_outcome, AssessmentResult, NoRuntimeErrorsRating, RatingOutcome,
    RatingRule, RatingState, RuleResult, Score, SuccessfulBuildRating, SuccessfulTestsRating,
};
pub use report::RunReport;
pub use stats::{
    calculate_build_and_check_stats, is_positive_score, AccessibilityStats, AggregatedRunStats,
    BuildStats, RuntimeStats, ScoreBucket, SecurityStats, TestStats, BUCKET_CONFIG,
};
