//! Asynchronous successive halving (ASHA).
//!
//! Rungs sit at `grace_period * reduction_factor^k` epochs, below
//! `max_epochs`. When a trial reaches a rung its loss is compared with the
//! losses already recorded there; only the best `1 / reduction_factor` keep
//! going. The first trial to reach a rung has nothing to compare against and
//! always continues.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};

/// What the scheduler tells a trial after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Prune,
}

/// Early-stopping policy consulted by the controller after every epoch.
pub trait TrialScheduler: Send {
    fn on_result(&mut self, trial_id: usize, epoch: u32, loss: f64) -> Decision;
}

/// Lets every trial run to its epoch budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoScheduler;

impl TrialScheduler for FifoScheduler {
    fn on_result(&mut self, _trial_id: usize, _epoch: u32, _loss: f64) -> Decision {
        Decision::Continue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AshaConfig {
    pub max_epochs: u32,
    pub grace_period: u32,
    pub reduction_factor: u32,
}

impl Default for AshaConfig {
    fn default() -> Self {
        Self {
            max_epochs: 50,
            grace_period: 10,
            reduction_factor: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct Rung {
    milestone: u32,
    recorded: HashMap<usize, f64>,
}

/// Pruning policy state shared by every trial of one search.
#[derive(Debug, Clone)]
pub struct AshaScheduler {
    config: AshaConfig,
    /// Highest milestone first.
    rungs: Vec<Rung>,
}

impl AshaScheduler {
    pub fn new(config: AshaConfig) -> Result<Self> {
        if config.grace_period == 0 {
            return Err(TunerError::config("grace period must be at least one epoch"));
        }
        if config.reduction_factor < 2 {
            return Err(TunerError::config("reduction factor must be at least 2"));
        }

        let mut milestones = Vec::new();
        let mut milestone = config.grace_period as u64;
        while milestone < config.max_epochs as u64 {
            milestones.push(milestone as u32);
            milestone *= config.reduction_factor as u64;
        }

        let rungs = milestones
            .into_iter()
            .rev()
            .map(|milestone| Rung {
                milestone,
                recorded: HashMap::new(),
            })
            .collect();

        Ok(Self { config, rungs })
    }

    pub fn config(&self) -> &AshaConfig {
        &self.config
    }

    /// Rung milestones in ascending order.
    pub fn milestones(&self) -> Vec<u32> {
        self.rungs.iter().rev().map(|r| r.milestone).collect()
    }
}

impl TrialScheduler for AshaScheduler {
    /// Record a trial's loss after `epoch` (1-based) and decide its fate.
    fn on_result(&mut self, trial_id: usize, epoch: u32, loss: f64) -> Decision {
        if !loss.is_finite() {
            return Decision::Prune;
        }
        if epoch >= self.config.max_epochs {
            return Decision::Continue;
        }

        let quantile = 1.0 / self.config.reduction_factor as f64;
        for rung in self.rungs.iter_mut() {
            if epoch < rung.milestone || rung.recorded.contains_key(&trial_id) {
                continue;
            }
            let cutoff = cutoff(&rung.recorded, quantile);
            rung.recorded.insert(trial_id, loss);
            return match cutoff {
                Some(c) if loss > c => Decision::Prune,
                _ => Decision::Continue,
            };
        }
        Decision::Continue
    }
}

/// Loss at the `quantile` of recorded losses, linearly interpolated.
fn cutoff(recorded: &HashMap<usize, f64>, quantile: f64) -> Option<f64> {
    if recorded.is_empty() {
        return None;
    }
    let mut values: Vec<f64> = recorded.values().copied().collect();
    values.sort_by(|a, b| a.total_cmp(b));
    Some(percentile(&values, quantile))
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    let pos = quantile * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
