//! Metric definitions.
//!
//! The trace stores a bare metric name per record. Whether a larger or a
//! smaller measurement wins is declared here, next to the name, so the winner
//! selector never has to guess.

use serde::{Deserialize, Serialize};

/// Which way a measurement improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

impl Direction {
    /// `true` if `candidate` strictly beats `incumbent`. Equal values never win.
    #[inline]
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Maximize => candidate > incumbent,
            Direction::Minimize => candidate < incumbent,
        }
    }
}

/// Metric names written by the benchmark tracer.
pub const COMPRESSION_RATE: &str = "Compression Rate";
pub const COMPRESSION_RATE_PER_TIME: &str = "Compression Rate per Time";
pub const COMPRESSION_SPEED: &str = "Compression Speed";
pub const DECOMPRESSION_SPEED: &str = "Decompression Speed";

/// All metrics the tracer knows about. Speeds are throughputs (bytes per
/// second), so every one of them is larger-is-better.
pub const KNOWN_METRICS: [&str; 4] = [
    COMPRESSION_RATE,
    COMPRESSION_RATE_PER_TIME,
    COMPRESSION_SPEED,
    DECOMPRESSION_SPEED,
];

/// A metric name together with its comparison direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub direction: Direction,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }

    /// Resolve a metric by name. Unknown names are accepted as larger-is-better
    /// unless `direction` overrides it.
    pub fn resolve(name: &str, direction: Option<Direction>) -> Self {
        if !KNOWN_METRICS.contains(&name) {
            log::debug!("Metric '{}' is not a tracer metric; using declared direction", name);
        }
        Self::new(name, direction.unwrap_or_default())
    }

    pub fn is_known(&self) -> bool {
        KNOWN_METRICS.contains(&self.name.as_str())
    }

    /// All tracer metrics with their default direction.
    pub fn all_known() -> Vec<MetricDefinition> {
        KNOWN_METRICS
            .iter()
            .map(|name| MetricDefinition::new(*name, Direction::Maximize))
            .collect()
    }

    /// Filesystem-friendly form of the name ("Compression Rate" -> "compression-rate").
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.name.len());
        let mut last_dash = true;
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
                last_dash = false;
            } else if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        if slug.is_empty() {
            slug.push_str("metric");
        }
        slug
    }
}

impl std::fmt::Display for MetricDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
