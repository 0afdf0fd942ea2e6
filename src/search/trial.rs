//! Trial runner: trains one model under one fixed configuration.
//!
//! ```text
//! Initialized ──► Running(1) ──► Reporting(1) ──► Running(2) ──► ... ──► Completed
//!                     │               └──────────────────────────────────► Pruned
//!                     └──────────────────────────────────────────────────► Failed(msg)
//! ```
//!
//! Every epoch is one pass over the training subset followed by one pass over
//! the validation subset. The runner then hands the epoch's [`TrialResult`] to
//! an [`EpochObserver`] and waits for its [`Decision`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::dataset::{self, ChunkDataset, DatasetSplit};
use crate::error::{Result, TunerError};
use crate::model::loss::{argmax, weighted_cross_entropy};
use crate::model::{ExecutionContext, ModelBuilder, ModelError, ModelShape, TrainableModel};
use crate::search::scheduler::Decision;
use crate::search::space::TrialConfig;
use crate::weights::ClassWeights;

/// Where a trial is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialPhase {
    /// Model built, no epoch run yet.
    Initialized,
    /// Training or validating the given epoch (1-based).
    Running { epoch: u32 },
    /// Waiting for the scheduler's verdict on the given epoch.
    Reporting { epoch: u32 },
    /// Ran its full epoch budget.
    Completed,
    /// Stopped early by the scheduler.
    Pruned,
    /// Diverged or ran out of memory.
    Failed(String),
}

impl TrialPhase {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, TrialPhase::Failed(_))
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, TrialPhase::Completed)
    }

    #[must_use]
    pub fn is_pruned(&self) -> bool {
        matches!(self, TrialPhase::Pruned)
    }

    /// Completed, pruned and failed are final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrialPhase::Completed | TrialPhase::Pruned | TrialPhase::Failed(_)
        )
    }
}

impl std::fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialPhase::Initialized => write!(f, "Initialized"),
            TrialPhase::Running { epoch } => write!(f, "Running({epoch})"),
            TrialPhase::Reporting { epoch } => write!(f, "Reporting({epoch})"),
            TrialPhase::Completed => write!(f, "Completed"),
            TrialPhase::Pruned => write!(f, "Pruned"),
            TrialPhase::Failed(msg) => write!(f, "Failed({msg})"),
        }
    }
}

/// What a trial reports after each epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: usize,
    pub config: TrialConfig,
    /// 1-based; the training iteration count.
    pub epoch: u32,
    pub validation_loss: f64,
    pub validation_accuracy: f64,
}

/// Receives each epoch's result and decides whether the trial goes on.
pub trait EpochObserver {
    fn on_epoch(&mut self, result: &TrialResult) -> Decision;
}

impl<F> EpochObserver for F
where
    F: FnMut(&TrialResult) -> Decision,
{
    fn on_epoch(&mut self, result: &TrialResult) -> Decision {
        self(result)
    }
}

/// Dataset, split and loss weights, computed once and shared read-only by
/// every trial of a search.
#[derive(Debug)]
pub struct TrainingData {
    dataset: ChunkDataset,
    split: DatasetSplit,
    class_weights: Vec<f32>,
}

impl TrainingData {
    pub fn prepare(dataset: ChunkDataset, validation_fraction: f64, seed: u64) -> Result<Self> {
        if dataset.num_classes() == 0 {
            return Err(TunerError::config("no classes to train on"));
        }
        if dataset.len() < 2 {
            return Err(TunerError::config(format!(
                "need at least two samples to train and validate, have {}",
                dataset.len()
            )));
        }

        let labels = dataset.labels();
        let split = dataset::split(&labels, validation_fraction, seed)?;
        let weights = ClassWeights::from_labels(labels.iter().copied());
        for (label, weight) in weights.iter() {
            log::debug!("Class {} weight {:.6}", label, weight);
        }
        log::info!(
            "Split {} samples into {} train / {} validation",
            dataset.len(),
            split.train.len(),
            split.validation.len()
        );

        let class_weights = weights.to_dense(dataset.num_classes());
        Ok(Self {
            dataset,
            split,
            class_weights,
        })
    }

    pub fn dataset(&self) -> &ChunkDataset {
        &self.dataset
    }

    pub fn split(&self) -> &DatasetSplit {
        &self.split
    }

    pub fn class_weights(&self) -> &[f32] {
        &self.class_weights
    }

    pub fn shape(&self) -> ModelShape {
        ModelShape {
            input_dim: self.dataset.dim(),
            num_classes: self.dataset.num_classes(),
        }
    }

    fn batch(&self, indices: &[usize]) -> (Vec<&[f32]>, Vec<usize>) {
        indices
            .iter()
            .filter_map(|&i| self.dataset.get(i))
            .map(|s| (s.features.as_slice(), s.label_index))
            .unzip()
    }
}

/// Seed of a trial's private random stream.
pub fn trial_seed(seed: u64, trial_id: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(trial_id as u64)
}

/// Everything a finished trial leaves behind.
pub struct TrialOutcome {
    pub trial_id: usize,
    pub config: TrialConfig,
    pub phase: TrialPhase,
    /// Epoch-ordered.
    pub results: Vec<TrialResult>,
    pub model: Option<Box<dyn TrainableModel>>,
}

impl TrialOutcome {
    /// Drop results past `epoch` and mark the trial pruned there.
    pub fn truncate_at(&mut self, epoch: u32) {
        self.results.retain(|r| r.epoch <= epoch);
        if !self.phase.is_failed() {
            self.phase = TrialPhase::Pruned;
        }
    }

    pub fn last_result(&self) -> Option<&TrialResult> {
        self.results.last()
    }

    /// Final validation loss; failed trials rank as infinitely bad.
    pub fn ranking_loss(&self) -> f64 {
        if self.phase.is_failed() {
            return f64::INFINITY;
        }
        self.last_result()
            .map_or(f64::INFINITY, |r| r.validation_loss)
    }

    pub fn failure(&self) -> Option<TunerError> {
        match &self.phase {
            TrialPhase::Failed(reason) => Some(TunerError::TrialFailed {
                trial_id: self.trial_id,
                config: self.config,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Debug for TrialOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialOutcome")
            .field("trial_id", &self.trial_id)
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("results", &self.results.len())
            .finish()
    }
}

pub struct TrialRunner {
    trial_id: usize,
    config: TrialConfig,
    data: Arc<TrainingData>,
    model: Option<Box<dyn TrainableModel>>,
    rng: StdRng,
    phase: TrialPhase,
    results: Vec<TrialResult>,
}

impl TrialRunner {
    /// Build the trial's model. A build failure leaves the runner `Failed`.
    pub fn new(
        trial_id: usize,
        config: TrialConfig,
        data: Arc<TrainingData>,
        builder: &dyn ModelBuilder,
        ctx: &ExecutionContext,
        seed: u64,
    ) -> Self {
        let seed = trial_seed(seed, trial_id);
        let (model, phase) = match builder.build(&config, data.shape(), ctx, seed) {
            Ok(model) => (Some(model), TrialPhase::Initialized),
            Err(e) => (None, TrialPhase::Failed(e.to_string())),
        };
        Self {
            trial_id,
            config,
            data,
            model,
            rng: StdRng::seed_from_u64(seed),
            phase,
            results: Vec::new(),
        }
    }

    pub fn phase(&self) -> &TrialPhase {
        &self.phase
    }

    /// Train for up to `max_epochs`, reporting after each one.
    ///
    /// The trial stops without reporting again once the observer answers
    /// [`Decision::Prune`] or `cancel` is raised.
    pub fn run(
        mut self,
        max_epochs: u32,
        observer: &mut dyn EpochObserver,
        cancel: &AtomicBool,
    ) -> TrialOutcome {
        if let Some(mut model) = self.model.take() {
            for epoch in 1..=max_epochs {
                if cancel.load(Ordering::Acquire) {
                    self.phase = TrialPhase::Pruned;
                    break;
                }

                self.phase = TrialPhase::Running { epoch };
                let result = match self.run_epoch(model.as_mut(), epoch) {
                    Ok(result) => result,
                    Err(e) => {
                        self.phase = TrialPhase::Failed(e.to_string());
                        break;
                    }
                };

                // Pruned while this epoch ran: its result is not reported.
                if cancel.load(Ordering::Acquire) {
                    self.phase = TrialPhase::Pruned;
                    break;
                }

                self.phase = TrialPhase::Reporting { epoch };
                self.results.push(result.clone());
                if observer.on_epoch(&result) == Decision::Prune {
                    self.phase = TrialPhase::Pruned;
                    break;
                }
            }

            if matches!(
                self.phase,
                TrialPhase::Initialized | TrialPhase::Reporting { .. }
            ) {
                self.phase = TrialPhase::Completed;
            }
            if !self.phase.is_failed() {
                self.model = Some(model);
            }
        }

        TrialOutcome {
            trial_id: self.trial_id,
            config: self.config,
            phase: self.phase,
            results: self.results,
            model: self.model,
        }
    }

    fn run_epoch(
        &mut self,
        model: &mut dyn TrainableModel,
        epoch: u32,
    ) -> std::result::Result<TrialResult, ModelError> {
        let batch_size = self.config.batch_size.max(1);
        let weights = self.data.class_weights();

        let mut order = self.data.split().train.clone();
        order.shuffle(&mut self.rng);
        for indices in order.chunks(batch_size) {
            let (features, targets) = self.data.batch(indices);
            let scores = model.forward(&features);
            model.update(&scores, &targets, weights)?;
        }

        let validation = &self.data.split().validation;
        let mut loss_sum = 0.0;
        let mut batches = 0usize;
        let mut correct = 0usize;
        for indices in validation.chunks(batch_size) {
            let (features, targets) = self.data.batch(indices);
            let scores = model.forward(&features);
            loss_sum += weighted_cross_entropy(&scores, &targets, weights).loss;
            batches += 1;
            correct += scores
                .iter()
                .zip(&targets)
                .filter(|(row, target)| argmax(row) == Some(**target))
                .count();
        }

        let validation_loss = loss_sum / batches.max(1) as f64;
        if !validation_loss.is_finite() {
            return Err(ModelError::NonFinite(validation_loss));
        }
        let validation_accuracy = correct as f64 / validation.len().max(1) as f64;

        log::debug!(
            "Trial {} epoch {}: loss {:.6}, accuracy {:.4}",
            self.trial_id,
            epoch,
            validation_loss,
            validation_accuracy
        );

        Ok(TrialResult {
            trial_id: self.trial_id,
            config: self.config,
            epoch,
            validation_loss,
            validation_accuracy,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dataset::Sample;
    use crate::model::MlpBuilder;

    /// Two well-separated classes in four dimensions.
    pub(crate) fn separable_data(per_class: usize) -> Arc<TrainingData> {
        let mut samples = Vec::new();
        for i in 0..per_class {
            let jitter = i as f32 * 0.01;
            samples.push(Sample {
                features: vec![1.0 + jitter, 0.1, 0.0, 0.0],
                label_index: 0,
            });
            samples.push(Sample {
                features: vec![0.0, 0.1, 1.0 + jitter, 0.0],
                label_index: 1,
            });
        }
        let dataset = ChunkDataset::from_samples(samples, 4, 2).unwrap();
        Arc::new(TrainingData::prepare(dataset, 0.25, 7).unwrap())
    }

    pub(crate) fn config() -> TrialConfig {
        TrialConfig {
            hidden_width: 8,
            learning_rate: 0.05,
            momentum: 0.5,
            batch_size: 4,
        }
    }

    /// Reports a fixed loss and never learns.
    pub(crate) struct FixedModel {
        pub num_classes: usize,
        pub loss: f64,
    }

    impl TrainableModel for FixedModel {
        fn num_classes(&self) -> usize {
            self.num_classes
        }

        fn forward(&mut self, batch: &[&[f32]]) -> Vec<Vec<f32>> {
            batch.iter().map(|_| vec![0.0; self.num_classes]).collect()
        }

        fn update(&mut self, _: &[Vec<f32>], _: &[usize], _: &[f32]) -> std::result::Result<f64, ModelError> {
            if self.loss.is_finite() {
                Ok(self.loss)
            } else {
                Err(ModelError::NonFinite(self.loss))
            }
        }

        fn snapshot(&self) -> std::result::Result<serde_json::Value, ModelError> {
            Ok(serde_json::json!({ "loss": self.loss }))
        }
    }

    fn continue_always(_: &TrialResult) -> Decision {
        Decision::Continue
    }

    #[test]
    fn completes_full_budget_with_ordered_results() {
        let data = separable_data(8);
        let runner = TrialRunner::new(0, config(), data, &MlpBuilder, &ExecutionContext::cpu(), 1);
        assert_eq!(runner.phase(), &TrialPhase::Initialized);

        let outcome = runner.run(5, &mut continue_always, &AtomicBool::new(false));
        assert!(outcome.phase.is_completed());
        let epochs: Vec<u32> = outcome.results.iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3, 4, 5]);
        assert!(outcome.model.is_some());
        for r in &outcome.results {
            assert!((0.0..=1.0).contains(&r.validation_accuracy));
            assert!(r.validation_loss.is_finite());
        }
    }

    #[test]
    fn learns_separable_classes() {
        let data = separable_data(16);
        let mut cfg = config();
        cfg.learning_rate = 0.1;
        let outcome = TrialRunner::new(0, cfg, data, &MlpBuilder, &ExecutionContext::cpu(), 3)
            .run(60, &mut continue_always, &AtomicBool::new(false));
        let first = &outcome.results[0];
        let last = outcome.last_result().unwrap();
        assert!(last.validation_loss < first.validation_loss);
        assert!(last.validation_accuracy > 0.5);
    }

    #[test]
    fn same_seed_same_results() {
        let data = separable_data(8);
        let run = |data: Arc<TrainingData>| {
            TrialRunner::new(2, config(), data, &MlpBuilder, &ExecutionContext::cpu(), 9)
                .run(3, &mut continue_always, &AtomicBool::new(false))
                .results
        };
        assert_eq!(run(Arc::clone(&data)), run(data));
    }

    #[test]
    fn prune_stops_without_further_results() {
        let data = separable_data(4);
        let mut observer = |r: &TrialResult| {
            if r.epoch == 2 {
                Decision::Prune
            } else {
                Decision::Continue
            }
        };
        let outcome = TrialRunner::new(0, config(), data, &MlpBuilder, &ExecutionContext::cpu(), 0)
            .run(10, &mut observer, &AtomicBool::new(false));
        assert!(outcome.phase.is_pruned());
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.ranking_loss().is_finite());
    }

    #[test]
    fn cancel_flag_is_seen_at_epoch_boundary() {
        let data = separable_data(4);
        let cancel = AtomicBool::new(false);
        let mut observer = |_: &TrialResult| {
            cancel.store(true, Ordering::Release);
            Decision::Continue
        };
        let outcome = TrialRunner::new(0, config(), data, &MlpBuilder, &ExecutionContext::cpu(), 0)
            .run(10, &mut observer, &cancel);
        assert!(outcome.phase.is_pruned());
        assert_eq!(outcome.results.len(), 1);
    }

    /// Raises the cancel flag from inside the first training pass.
    struct CancelsMidEpoch {
        inner: FixedModel,
        cancel: Arc<AtomicBool>,
    }

    impl TrainableModel for CancelsMidEpoch {
        fn num_classes(&self) -> usize {
            self.inner.num_classes
        }

        fn forward(&mut self, batch: &[&[f32]]) -> Vec<Vec<f32>> {
            self.cancel.store(true, Ordering::Release);
            self.inner.forward(batch)
        }

        fn update(&mut self, scores: &[Vec<f32>], targets: &[usize], weights: &[f32]) -> std::result::Result<f64, ModelError> {
            self.inner.update(scores, targets, weights)
        }

        fn snapshot(&self) -> std::result::Result<serde_json::Value, ModelError> {
            self.inner.snapshot()
        }
    }

    #[test]
    fn cancel_during_an_epoch_drops_its_result() {
        let data = separable_data(4);
        let cancel = Arc::new(AtomicBool::new(false));
        let builder = |_: &TrialConfig, shape: ModelShape, _: &ExecutionContext, _: u64| {
            Ok::<_, ModelError>(Box::new(CancelsMidEpoch {
                inner: FixedModel {
                    num_classes: shape.num_classes,
                    loss: 0.5,
                },
                cancel: Arc::clone(&cancel),
            }) as Box<dyn TrainableModel>)
        };
        let mut reports = 0;
        let mut observer = |_: &TrialResult| {
            reports += 1;
            Decision::Continue
        };
        let outcome = TrialRunner::new(0, config(), data, &builder, &ExecutionContext::cpu(), 0)
            .run(5, &mut observer, &cancel);

        assert!(outcome.phase.is_pruned());
        assert!(outcome.results.is_empty());
        assert_eq!(reports, 0);
    }

    #[test]
    fn divergence_fails_the_trial() {
        let data = separable_data(4);
        let builder = |_: &TrialConfig, shape: ModelShape, _: &ExecutionContext, _: u64| {
            Ok::<_, ModelError>(Box::new(FixedModel {
                num_classes: shape.num_classes,
                loss: f64::NAN,
            }) as Box<dyn TrainableModel>)
        };
        let outcome = TrialRunner::new(4, config(), data, &builder, &ExecutionContext::cpu(), 0)
            .run(3, &mut continue_always, &AtomicBool::new(false));
        assert!(outcome.phase.is_failed());
        assert!(outcome.results.is_empty());
        assert!(outcome.model.is_none());
        assert_eq!(outcome.ranking_loss(), f64::INFINITY);
        match outcome.failure() {
            Some(TunerError::TrialFailed { trial_id, config: c, .. }) => {
                assert_eq!(trial_id, 4);
                assert_eq!(c, config());
            }
            other => panic!("expected TrialFailed, got {:?}", other),
        }
    }

    #[test]
    fn build_failure_fails_the_trial() {
        let data = separable_data(4);
        let builder = |_: &TrialConfig, _: ModelShape, _: &ExecutionContext, _: u64| {
            Err::<Box<dyn TrainableModel>, _>(ModelError::OutOfMemory { elements: usize::MAX })
        };
        let runner = TrialRunner::new(0, config(), data, &builder, &ExecutionContext::cpu(), 0);
        assert!(runner.phase().is_failed());
        let outcome = runner.run(3, &mut continue_always, &AtomicBool::new(false));
        assert!(outcome.phase.is_failed());
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn prepare_rejects_tiny_datasets() {
        let one = ChunkDataset::from_samples(
            vec![Sample {
                features: vec![1.0],
                label_index: 0,
            }],
            1,
            1,
        )
        .unwrap();
        assert!(TrainingData::prepare(one, 0.2, 0).is_err());

        let empty = ChunkDataset::from_samples(vec![], 1, 0).unwrap();
        assert!(TrainingData::prepare(empty, 0.2, 0).is_err());
    }

    #[test]
    fn prepared_weights_are_dense() {
        let data = separable_data(3);
        for w in data.class_weights() {
            assert!((w - 1.0 / 3.0).abs() < 1e-6);
        }
        assert_eq!(data.split().train.len() + data.split().validation.len(), 6);
    }

    #[test]
    fn phase_display() {
        assert_eq!(TrialPhase::Running { epoch: 3 }.to_string(), "Running(3)");
        assert_eq!(TrialPhase::Failed("nan".into()).to_string(), "Failed(nan)");
        assert!(TrialPhase::Pruned.is_terminal());
        assert!(!TrialPhase::Reporting { epoch: 1 }.is_terminal());
    }
}
