//! Run configuration.
//!
//! Loaded from a JSON file; every field is optional and falls back to the
//! defaults below. The value is passed explicitly to whatever needs it, there
//! is no process-wide copy.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dataset::DEFAULT_DIM;
use crate::error::{Result, TunerError};
use crate::metric::{Direction, MetricDefinition, COMPRESSION_RATE};
use crate::search::{AshaConfig, AshaScheduler, ResourceBudget, SearchBudget, SearchSpace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metric_name: String,
    /// Overrides the direction of a known metric; unknown metrics default to
    /// maximize.
    pub metric_direction: Option<Direction>,
    /// Trace rows must be strictly larger than this to qualify.
    pub min_size: u64,
    pub num_trials: usize,
    pub max_epochs: u32,
    /// `None` leaves concurrency to the resource budget alone.
    pub max_concurrent: Option<usize>,
    pub cpu_per_trial: u32,
    pub accelerator_per_trial: u32,
    /// Defaults to the machine's available parallelism.
    pub total_cpus: Option<u32>,
    pub total_accelerators: u32,
    pub feature_dim: usize,
    pub validation_fraction: f64,
    pub seed: u64,
    pub grace_period: u32,
    pub reduction_factor: u32,
    pub decision_timeout_ms: u64,
    pub search_space: SearchSpace,
    pub paths: PathsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metric_name: COMPRESSION_RATE.to_string(),
            metric_direction: None,
            min_size: 8,
            num_trials: 60,
            max_epochs: 50,
            max_concurrent: None,
            cpu_per_trial: 6,
            accelerator_per_trial: 0,
            total_cpus: None,
            total_accelerators: 0,
            feature_dim: DEFAULT_DIM,
            validation_fraction: 0.2,
            seed: 0,
            grace_period: 10,
            reduction_factor: 3,
            decision_timeout_ms: 60_000,
            search_space: SearchSpace::default(),
            paths: PathsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// JSON Lines trace store.
    pub trace: PathBuf,
    /// Directory holding one file per chunk.
    pub chunks: PathBuf,
    pub output_dir: PathBuf,
    /// A label file from an earlier run. When set, its class order is reused
    /// instead of building a new vocabulary.
    pub vocabulary: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            trace: PathBuf::from("meta.jsonl"),
            chunks: PathBuf::from("chunks"),
            output_dir: PathBuf::from("."),
            vocabulary: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| TunerError::io(path, e))?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            TunerError::config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Reject anything that would fail only after expensive work started.
    pub fn validate(&self) -> Result<()> {
        if self.metric_name.trim().is_empty() {
            return Err(TunerError::config("metric_name is empty"));
        }
        if self.num_trials == 0 {
            return Err(TunerError::config("num_trials must be at least 1"));
        }
        if self.max_epochs == 0 {
            return Err(TunerError::config("max_epochs must be at least 1"));
        }
        if self.max_concurrent == Some(0) {
            return Err(TunerError::config("max_concurrent must be at least 1"));
        }
        if self.feature_dim == 0 {
            return Err(TunerError::config("feature_dim must be at least 1"));
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(TunerError::config("validation_fraction must lie in (0, 1)"));
        }
        if self.decision_timeout_ms == 0 {
            return Err(TunerError::config("decision_timeout_ms must be positive"));
        }
        AshaScheduler::new(self.asha())?;
        self.search_space.validate()?;
        if self.resources().max_concurrent_trials() == 0 {
            return Err(TunerError::config(format!(
                "{} CPUs and {} accelerators cannot fit one trial needing {} CPUs and {} accelerators",
                self.total_cpus(),
                self.total_accelerators,
                self.cpu_per_trial,
                self.accelerator_per_trial
            )));
        }
        Ok(())
    }

    pub fn metric(&self) -> MetricDefinition {
        MetricDefinition::resolve(&self.metric_name, self.metric_direction)
    }

    /// Metrics to run. With `all`, every tracer metric, where the configured
    /// one keeps its declared direction.
    pub fn metrics(&self, all: bool) -> Vec<MetricDefinition> {
        let configured = self.metric();
        if !all {
            return vec![configured];
        }
        MetricDefinition::all_known()
            .into_iter()
            .map(|m| if m.name == configured.name { configured.clone() } else { m })
            .collect()
    }

    pub fn total_cpus(&self) -> u32 {
        self.total_cpus.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, |n| n.get() as u32)
        })
    }

    pub fn asha(&self) -> AshaConfig {
        AshaConfig {
            max_epochs: self.max_epochs,
            grace_period: self.grace_period,
            reduction_factor: self.reduction_factor,
        }
    }

    pub fn budget(&self) -> SearchBudget {
        SearchBudget {
            num_trials: self.num_trials,
            max_epochs_per_trial: self.max_epochs,
            max_concurrent: self.max_concurrent.unwrap_or(usize::MAX),
        }
    }

    pub fn resources(&self) -> ResourceBudget {
        ResourceBudget {
            total_cpus: self.total_cpus(),
            total_accelerators: self.total_accelerators,
            cpu_per_trial: self.cpu_per_trial,
            accelerator_per_trial: self.accelerator_per_trial,
        }
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn label_path(&self, metric: &MetricDefinition) -> PathBuf {
        self.paths.output_dir.join(format!("{}.labels", metric.slug()))
    }

    pub fn report_path(&self, metric: &MetricDefinition) -> PathBuf {
        self.paths.output_dir.join(format!("{}.report.json", metric.slug()))
    }

    pub fn model_path(&self, metric: &MetricDefinition) -> PathBuf {
        self.paths.output_dir.join(format!("{}.model.json", metric.slug()))
    }
}
