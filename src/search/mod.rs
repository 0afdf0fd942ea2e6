//! Hyperparameter search: configurations, trials, pruning and the controller
//! that ties them together.

pub mod controller;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod space;
pub mod trial;

pub use controller::{
    BestResult, ResourceBudget, SearchBudget, SearchController, SearchOutcome, TrialSummary,
};
pub use report::SearchReport;
pub use scheduler::{AshaConfig, AshaScheduler, Decision, FifoScheduler, TrialScheduler};
pub use space::{ParamDomain, SearchSpace, TrialConfig};
pub use trial::{TrainingData, TrialOutcome, TrialPhase, TrialResult, TrialRunner};
