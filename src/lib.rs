//! Learns which compressor configuration wins on a data chunk.
//!
//! A benchmark trace records how every compressor and level performed on
//! every chunk. For a chosen metric the best configuration per chunk becomes
//! that chunk's label, and a small classifier is trained to predict the label
//! from the chunk's raw contents. Classifier hyperparameters are found with a
//! concurrent random search pruned by asynchronous successive halving.
//!
//! ```text
//! trace ──► winners ──► vocabulary ──► dataset ──► weights ──► search ──► report
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod metric;
pub mod model;
pub mod pipeline;
pub mod search;
pub mod trace;
pub mod vocab;
pub mod weights;
pub mod winners;

pub use config::Config;
pub use error::{ErrorKind, Result, TunerError};
pub use metric::{Direction, MetricDefinition};
pub use pipeline::{run, RunOptions, RunReport};
