//! Saved run reports
//!
//! A report is the JSON file written at the end of `evalkit run`. It keeps
//! every assessment so statistics can be recomputed later.

use chrono::{DateTime, Utc};
use evalkit_core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::ratings::AssessmentResult;
use crate::stats::{calculate_build_and_check_stats, AggregatedRunStats};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub created_at: DateTime<Utc>,
    /// Display name of the environment
    pub environment: String,
    pub runner: String,
    pub model: String,
    pub assessments: Vec<AssessmentResult>,
    pub stats: AggregatedRunStats,
}

impl RunReport {
    /// Build a report, computing statistics from `assessments`
    pub fn new(
        environment: impl Into<String>,
        runner: impl Into<String>,
        model: impl Into<String>,
        assessments: Vec<AssessmentResult>,
    ) -> Result<Self> {
        let stats = calculate_build_and_check_stats(&assessments)?;
        Ok(Self {
            created_at: Utc::now(),
            environment: environment.into(),
            runner: runner.into(),
            model: model.into(),
            assessments,
            stats,
        })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).await?;
        debug!("Saved report with {} assessment(s) to {:?}", self.assessments.len(), path);
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Recompute statistics from the stored assessments
    pub fn recompute_stats(&self) -> Result<AggregatedRunStats> {
        calculate_build_and_check_stats(&self.assessments)
    }
}
