//! Search controller.
//!
//! Samples every configuration up front, queues one job per trial on a
//! [`WorkerPool`] sized to the resource budget, and then serves the event
//! channel: each epoch report goes through the scheduler and its decision is
//! sent back to the waiting trial. The controller is the only place that
//! admits trials and the only owner of the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};
use crate::model::{ExecutionContext, ModelBuilder, TrainableModel};
use crate::search::pool::{WorkerPool, WorkerPoolConfig};
use crate::search::scheduler::{Decision, TrialScheduler};
use crate::search::space::{SearchSpace, TrialConfig};
use crate::search::trial::{
    EpochObserver, TrainingData, TrialOutcome, TrialPhase, TrialResult, TrialRunner,
};

pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchBudget {
    pub num_trials: usize,
    pub max_epochs_per_trial: u32,
    pub max_concurrent: usize,
}

/// Total compute and what each trial claims from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub total_cpus: u32,
    pub total_accelerators: u32,
    pub cpu_per_trial: u32,
    pub accelerator_per_trial: u32,
}

impl ResourceBudget {
    /// How many trials fit side by side without over-subscribing.
    pub fn max_concurrent_trials(&self) -> usize {
        let mut slots = match self.cpu_per_trial {
            0 => usize::MAX,
            per => (self.total_cpus / per) as usize,
        };
        if self.accelerator_per_trial > 0 {
            slots = slots.min((self.total_accelerators / self.accelerator_per_trial) as usize);
        }
        slots
    }
}

/// The winning trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub trial_id: usize,
    pub config: TrialConfig,
    pub validation_loss: f64,
    pub validation_accuracy: f64,
    pub epochs: u32,
}

/// Final state of one trial, without its model.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSummary {
    pub trial_id: usize,
    pub config: TrialConfig,
    pub phase: TrialPhase,
    pub last_result: Option<TrialResult>,
}

impl TrialSummary {
    pub fn epochs(&self) -> u32 {
        self.last_result.as_ref().map_or(0, |r| r.epoch)
    }
}

pub struct SearchOutcome {
    pub best: BestResult,
    /// Ordered by trial id.
    pub trials: Vec<TrialSummary>,
    /// The best trial's trained model.
    pub model: Option<Box<dyn TrainableModel>>,
}

impl SearchOutcome {
    pub fn completed(&self) -> usize {
        self.trials.iter().filter(|t| t.phase.is_completed()).count()
    }

    pub fn pruned(&self) -> usize {
        self.trials.iter().filter(|t| t.phase.is_pruned()).count()
    }

    pub fn failed(&self) -> usize {
        self.trials.iter().filter(|t| t.phase.is_failed()).count()
    }
}

impl std::fmt::Debug for SearchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchOutcome")
            .field("best", &self.best)
            .field("trials", &self.trials)
            .field("model", &self.model.is_some())
            .finish()
    }
}

// --- Controller <-> trial messages ---

enum TrialEvent {
    Report {
        result: TrialResult,
        reply: SyncSender<Decision>,
    },
    Finished(TrialOutcome),
}

struct TrialJob {
    trial_id: usize,
    config: TrialConfig,
    cancel: Arc<AtomicBool>,
    events: Sender<TrialEvent>,
}

/// Forwards epoch results to the controller and waits, bounded, for the
/// verdict.
struct ChannelObserver<'a> {
    events: &'a Sender<TrialEvent>,
    timeout: Duration,
}

impl EpochObserver for ChannelObserver<'_> {
    fn on_epoch(&mut self, result: &TrialResult) -> Decision {
        let (reply, decision) = mpsc::sync_channel(1);
        let report = TrialEvent::Report {
            result: result.clone(),
            reply,
        };
        if self.events.send(report).is_err() {
            return Decision::Prune;
        }
        match decision.recv_timeout(self.timeout) {
            Ok(decision) => decision,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Trial {}: no scheduler decision for epoch {} within {:?}, continuing",
                    result.trial_id,
                    result.epoch,
                    self.timeout
                );
                Decision::Continue
            }
            Err(RecvTimeoutError::Disconnected) => Decision::Prune,
        }
    }
}

/// Collects finished trials and keeps only the best model alive.
struct Leaderboard {
    summaries: Vec<Option<TrialSummary>>,
    best: Option<BestResult>,
    model: Option<Box<dyn TrainableModel>>,
}

impl Leaderboard {
    fn new(num_trials: usize) -> Self {
        Self {
            summaries: vec![None; num_trials],
            best: None,
            model: None,
        }
    }

    fn record(&mut self, mut outcome: TrialOutcome) {
        let epochs = outcome.last_result().map_or(0, |r| r.epoch);
        match &outcome.phase {
            TrialPhase::Failed(_) => {
                if let Some(err) = outcome.failure() {
                    log::error!("{}", err);
                }
            }
            phase => log::info!(
                "Trial {} {} after {} epochs (loss {:.6})",
                outcome.trial_id,
                phase,
                epochs,
                outcome.ranking_loss()
            ),
        }

        let loss = outcome.ranking_loss();
        if loss.is_finite() {
            let better = self.best.as_ref().map_or(true, |b| {
                loss < b.validation_loss
                    || (loss == b.validation_loss && outcome.trial_id < b.trial_id)
            });
            if let Some(last) = outcome.last_result().filter(|_| better).cloned() {
                self.best = Some(BestResult {
                    trial_id: outcome.trial_id,
                    config: outcome.config,
                    validation_loss: last.validation_loss,
                    validation_accuracy: last.validation_accuracy,
                    epochs,
                });
                self.model = outcome.model.take();
            }
        }

        let summary = TrialSummary {
            trial_id: outcome.trial_id,
            config: outcome.config,
            last_result: outcome.results.pop(),
            phase: outcome.phase,
        };
        if let Some(slot) = self.summaries.get_mut(summary.trial_id) {
            *slot = Some(summary);
        }
    }
}

/// Runs a hyperparameter search over a fixed [`TrainingData`].
pub struct SearchController {
    space: SearchSpace,
    budget: SearchBudget,
    resources: ResourceBudget,
    scheduler: Box<dyn TrialScheduler>,
    builder: Arc<dyn ModelBuilder>,
    ctx: ExecutionContext,
    seed: u64,
    decision_timeout: Duration,
}

impl SearchController {
    pub fn new(
        space: SearchSpace,
        budget: SearchBudget,
        resources: ResourceBudget,
        scheduler: Box<dyn TrialScheduler>,
        builder: Arc<dyn ModelBuilder>,
    ) -> Self {
        Self {
            space,
            budget,
            resources,
            scheduler,
            builder,
            ctx: ExecutionContext::cpu(),
            seed: 0,
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_context(mut self, ctx: ExecutionContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    /// Number of trials that may run at once.
    pub fn concurrency(&self) -> Result<usize> {
        if self.budget.max_concurrent == 0 {
            return Err(TunerError::config("max_concurrent must be at least 1"));
        }
        let slots = self
            .resources
            .max_concurrent_trials()
            .min(self.budget.max_concurrent);
        if slots == 0 {
            let r = &self.resources;
            return Err(TunerError::config(format!(
                "resource budget of {} CPUs and {} accelerators cannot fit one trial needing {} CPUs and {} accelerators",
                r.total_cpus, r.total_accelerators, r.cpu_per_trial, r.accelerator_per_trial
            )));
        }
        Ok(slots)
    }

    pub fn search(self, data: Arc<TrainingData>) -> Result<SearchOutcome> {
        if self.budget.num_trials == 0 {
            return Err(TunerError::config("num_trials must be at least 1"));
        }
        if self.budget.max_epochs_per_trial == 0 {
            return Err(TunerError::config("max_epochs must be at least 1"));
        }
        if data.shape().num_classes == 0 {
            return Err(TunerError::config("no classes to train on"));
        }
        let slots = self.concurrency()?;

        let configs = self.space.sample_unexplored(self.budget.num_trials, self.seed)?;
        if configs.is_empty() {
            return Err(TunerError::config("search space yielded no configurations"));
        }
        let num_workers = slots.min(configs.len());
        let max_epochs = self.budget.max_epochs_per_trial;

        log::info!(
            "Searching {} configurations, {} at a time, up to {} epochs each on {}",
            configs.len(),
            num_workers,
            max_epochs,
            self.ctx.device
        );

        let SearchController {
            builder,
            ctx,
            seed,
            decision_timeout,
            mut scheduler,
            ..
        } = self;

        let pool = {
            let data = Arc::clone(&data);
            WorkerPool::new(
                WorkerPoolConfig {
                    num_workers,
                    thread_name_prefix: "trial".to_string(),
                },
                move |job: TrialJob| {
                    log::info!("Trial {} started with {}", job.trial_id, job.config);
                    let runner = TrialRunner::new(
                        job.trial_id,
                        job.config,
                        Arc::clone(&data),
                        builder.as_ref(),
                        &ctx,
                        seed,
                    );
                    let mut observer = ChannelObserver {
                        events: &job.events,
                        timeout: decision_timeout,
                    };
                    let outcome = runner.run(max_epochs, &mut observer, &job.cancel);
                    let _ = job.events.send(TrialEvent::Finished(outcome));
                },
            )?
        };

        let (events_tx, events_rx) = mpsc::channel();
        let cancels: Vec<Arc<AtomicBool>> = configs
            .iter()
            .map(|_| Arc::new(AtomicBool::new(false)))
            .collect();
        for (trial_id, config) in configs.iter().enumerate() {
            pool.submit(TrialJob {
                trial_id,
                config: *config,
                cancel: Arc::clone(&cancels[trial_id]),
                events: events_tx.clone(),
            })?;
        }
        drop(events_tx);

        let mut board = Leaderboard::new(configs.len());
        let mut pruned_at: Vec<Option<u32>> = vec![None; configs.len()];
        let mut pending = configs.len();
        while pending > 0 {
            match events_rx.recv() {
                Ok(TrialEvent::Report { result, reply }) => {
                    // A trial that gave up waiting can report once more before
                    // it sees its cancel flag. The scheduler never hears of it.
                    if let Some(epoch) = pruned_at.get(result.trial_id).copied().flatten() {
                        log::debug!(
                            "Trial {} reported epoch {} after being pruned at epoch {}",
                            result.trial_id,
                            result.epoch,
                            epoch
                        );
                        let _ = reply.send(Decision::Prune);
                        continue;
                    }

                    let decision =
                        scheduler.on_result(result.trial_id, result.epoch, result.validation_loss);
                    if decision == Decision::Prune {
                        if let Some(slot) = pruned_at.get_mut(result.trial_id) {
                            *slot = Some(result.epoch);
                        }
                        if let Some(flag) = cancels.get(result.trial_id) {
                            flag.store(true, Ordering::Release);
                        }
                        log::info!(
                            "Pruning trial {} at epoch {} (loss {:.6})",
                            result.trial_id,
                            result.epoch,
                            result.validation_loss
                        );
                    }
                    // The trial may have timed out waiting.
                    let _ = reply.send(decision);
                }
                Ok(TrialEvent::Finished(mut outcome)) => {
                    pending -= 1;
                    if let Some(epoch) = pruned_at.get(outcome.trial_id).copied().flatten() {
                        outcome.truncate_at(epoch);
                    }
                    board.record(outcome);
                }
                Err(_) => {
                    log::error!("{} trials ended without a result", pending);
                    break;
                }
            }
        }
        pool.join();

        let trials: Vec<TrialSummary> = board
            .summaries
            .into_iter()
            .zip(configs)
            .enumerate()
            .map(|(trial_id, (summary, config))| {
                summary.unwrap_or_else(|| TrialSummary {
                    trial_id,
                    config,
                    phase: TrialPhase::Failed("worker exited without a result".to_string()),
                    last_result: None,
                })
            })
            .collect();

        let best = board.best.ok_or(TunerError::NoViableTrial {
            attempted: trials.len(),
        })?;

        log::info!("Best trial config: {}", best.config);
        log::info!("Best trial final validation loss: {}", best.validation_loss);
        log::info!(
            "Best trial final validation accuracy: {}",
            best.validation_accuracy
        );

        Ok(SearchOutcome {
            best,
            trials,
            model: board.model,
        })
    }
}
