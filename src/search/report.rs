//! Best-trial report: written as JSON and logged as a trial table.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};
use crate::metric::MetricDefinition;
use crate::search::controller::{BestResult, SearchOutcome};
use crate::search::space::TrialConfig;

/// One row of the trial table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRow {
    pub trial_id: usize,
    pub status: String,
    pub config: TrialConfig,
    pub loss: Option<f64>,
    pub accuracy: Option<f64>,
    pub training_iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchReport {
    pub metric: String,
    pub num_samples: usize,
    pub num_classes: usize,
    pub best: BestResult,
    pub completed: usize,
    pub pruned: usize,
    pub failed: usize,
    pub trials: Vec<TrialRow>,
}

impl SearchReport {
    pub fn new(
        metric: &MetricDefinition,
        num_samples: usize,
        num_classes: usize,
        outcome: &SearchOutcome,
    ) -> Self {
        let trials = outcome
            .trials
            .iter()
            .map(|t| TrialRow {
                trial_id: t.trial_id,
                status: match &t.phase {
                    phase if phase.is_failed() => "Failed".to_string(),
                    phase => phase.to_string(),
                },
                config: t.config,
                loss: t.last_result.as_ref().map(|r| r.validation_loss),
                accuracy: t.last_result.as_ref().map(|r| r.validation_accuracy),
                training_iteration: t.epochs(),
            })
            .collect();

        Self {
            metric: metric.name.clone(),
            num_samples,
            num_classes,
            best: outcome.best.clone(),
            completed: outcome.completed(),
            pruned: outcome.pruned(),
            failed: outcome.failed(),
            trials,
        }
    }

    /// Write as pretty JSON.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|e| TunerError::Serialization {
            what: "search report".to_string(),
            message: e.to_string(),
        })?;
        fs::write(path, json).map_err(|e| TunerError::io(path, e))?;
        log::info!("Wrote report to {}", path.display());
        Ok(())
    }

    pub fn log_table(&self) {
        log::info!(
            "{:>5}  {:<10} {:>12} {:>9} {:>5}  config",
            "trial",
            "status",
            "loss",
            "accuracy",
            "iter"
        );
        for row in &self.trials {
            log::info!(
                "{:>5}  {:<10} {:>12} {:>9} {:>5}  {}",
                row.trial_id,
                row.status,
                row.loss.map_or("-".to_string(), |l| format!("{:.6}", l)),
                row.accuracy.map_or("-".to_string(), |a| format!("{:.4}", a)),
                row.training_iteration,
                row.config
            );
        }
        log::info!(
            "{}: {} completed, {} pruned, {} failed",
            self.metric,
            self.completed,
            self.pruned,
            self.failed
        );
    }
}
