//! Trainable model interface and the execution context trials run in.
//!
//! The search never touches network internals. A trial asks a
//! [`ModelBuilder`] for a fresh [`TrainableModel`] and then only calls
//! `forward` and `update` on it.

pub mod loss;
pub mod mlp;

pub use mlp::{Mlp, MlpBuilder};

use thiserror::Error;

use crate::search::TrialConfig;

/// Failures inside a model. The trial runner turns these into `TrialFailed`.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("cannot allocate {elements} parameters")]
    OutOfMemory { elements: usize },
    #[error("non-finite loss ({0})")]
    NonFinite(f64),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("unsupported device {0}")]
    UnsupportedDevice(Device),
    #[error("snapshot failed: {0}")]
    Snapshot(String),
}

/// A model that maps feature vectors to per-class scores and learns from a
/// weighted loss.
pub trait TrainableModel: Send {
    fn num_classes(&self) -> usize;

    /// Per-class scores, one row per input.
    fn forward(&mut self, batch: &[&[f32]]) -> Vec<Vec<f32>>;

    /// One optimisation step on the batch last passed to `forward`.
    /// Returns the batch loss.
    fn update(
        &mut self,
        scores: &[Vec<f32>],
        targets: &[usize],
        class_weights: &[f32],
    ) -> Result<f64, ModelError>;

    /// Serializable view of the learned parameters.
    fn snapshot(&self) -> Result<serde_json::Value, ModelError>;
}

/// Input and output sizes for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub input_dim: usize,
    pub num_classes: usize,
}

/// Creates one model per trial.
pub trait ModelBuilder: Send + Sync {
    fn build(
        &self,
        config: &TrialConfig,
        shape: ModelShape,
        ctx: &ExecutionContext,
        seed: u64,
    ) -> Result<Box<dyn TrainableModel>, ModelError>;
}

impl<F> ModelBuilder for F
where
    F: Fn(&TrialConfig, ModelShape, &ExecutionContext, u64) -> Result<Box<dyn TrainableModel>, ModelError>
        + Send
        + Sync,
{
    fn build(
        &self,
        config: &TrialConfig,
        shape: ModelShape,
        ctx: &ExecutionContext,
        seed: u64,
    ) -> Result<Box<dyn TrainableModel>, ModelError> {
        self(config, shape, ctx, seed)
    }
}

// --- Execution context ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Accelerator { ordinal: u32 },
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator { ordinal } => write!(f, "accelerator:{}", ordinal),
        }
    }
}

/// Where trials compute. Chosen once when the search starts and handed to
/// every trial; never changed mid-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub device: Device,
}

impl ExecutionContext {
    pub fn cpu() -> Self {
        Self { device: Device::Cpu }
    }

    /// Pick the device for this run. Only the CPU back end exists, so a request
    /// for accelerators falls back to it.
    pub fn select(accelerators_per_trial: u32) -> Self {
        if accelerators_per_trial > 0 {
            log::warn!(
                "{} accelerator(s) per trial requested but only the CPU back end is available",
                accelerators_per_trial
            );
        }
        let ctx = Self::cpu();
        log::info!("Using {} device", ctx.device);
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_falls_back_to_cpu() {
        assert_eq!(ExecutionContext::select(2).device, Device::Cpu);
        assert_eq!(ExecutionContext::select(0), ExecutionContext::cpu());
    }

    #[test]
    fn device_display() {
        assert_eq!(Device::Accelerator { ordinal: 1 }.to_string(), "accelerator:1");
    }
}
