//! Search space descriptor and trial configurations.

use std::collections::HashSet;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};

/// Hyperparameters of one trial. Fixed once the trial is created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub hidden_width: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub batch_size: usize,
}

impl TrialConfig {
    /// Exact identity, used to avoid running the same configuration twice.
    fn key(&self) -> (usize, u64, u64, usize) {
        (
            self.hidden_width,
            self.learning_rate.to_bits(),
            self.momentum.to_bits(),
            self.batch_size,
        )
    }
}

impl fmt::Display for TrialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{hidden_width={}, lr={:.6e}, momentum={:.4}, batch_size={}}}",
            self.hidden_width, self.learning_rate, self.momentum, self.batch_size
        )
    }
}

/// Distribution of a single hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamDomain {
    /// Uniform pick among discrete values.
    Choice { values: Vec<f64> },
    /// Uniform in `[low, high)`.
    Uniform { low: f64, high: f64 },
    /// Log-uniform in `[low, high)`; `low` must be positive.
    LogUniform { low: f64, high: f64 },
}

impl ParamDomain {
    pub fn choice<I: IntoIterator<Item = f64>>(values: I) -> Self {
        ParamDomain::Choice {
            values: values.into_iter().collect(),
        }
    }

    /// Panics on an empty choice set; only called on a validated space.
    pub(crate) fn sample(&self, rng: &mut impl Rng) -> f64 {
        match self {
            ParamDomain::Choice { values } => values[rng.gen_range(0..values.len())],
            ParamDomain::Uniform { low, high } => {
                if low >= high {
                    *low
                } else {
                    rng.gen_range(*low..*high)
                }
            }
            ParamDomain::LogUniform { low, high } => {
                if low >= high {
                    *low
                } else {
                    rng.gen_range(low.ln()..high.ln()).exp()
                }
            }
        }
    }

    /// Number of distinct values, `None` for continuous domains.
    pub fn cardinality(&self) -> Option<usize> {
        match self {
            ParamDomain::Choice { values } => {
                let distinct: HashSet<u64> = values.iter().map(|v| v.to_bits()).collect();
                Some(distinct.len())
            }
            ParamDomain::Uniform { low, high } | ParamDomain::LogUniform { low, high } => {
                if low == high {
                    Some(1)
                } else {
                    None
                }
            }
        }
    }

    fn validate(&self, name: &str, integral: bool) -> Result<()> {
        let bad = |why: &str| Err(TunerError::config(format!("search space '{}': {}", name, why)));
        match self {
            ParamDomain::Choice { values } => {
                if values.is_empty() {
                    return bad("empty choice set");
                }
                if values.iter().any(|v| !v.is_finite()) {
                    return bad("non-finite choice");
                }
                if integral && values.iter().any(|v| *v < 1.0 || v.fract() != 0.0) {
                    return bad("choices must be positive integers");
                }
            }
            ParamDomain::Uniform { low, high } => {
                if integral {
                    return bad("integer parameters need a choice set");
                }
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return bad("bounds must be finite with low <= high");
                }
            }
            ParamDomain::LogUniform { low, high } => {
                if integral {
                    return bad("integer parameters need a choice set");
                }
                if !(low.is_finite() && high.is_finite()) || *low <= 0.0 || low > high {
                    return bad("log bounds must be positive with low <= high");
                }
            }
        }
        Ok(())
    }

    fn bounds(&self) -> (f64, f64) {
        match self {
            ParamDomain::Choice { values } => values
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v))),
            ParamDomain::Uniform { low, high } | ParamDomain::LogUniform { low, high } => {
                (*low, *high)
            }
        }
    }
}

/// Per-hyperparameter domains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpace {
    pub hidden_width: ParamDomain,
    pub learning_rate: ParamDomain,
    pub momentum: ParamDomain,
    pub batch_size: ParamDomain,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            hidden_width: ParamDomain::choice([64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0]),
            learning_rate: ParamDomain::LogUniform { low: 1e-4, high: 1e-1 },
            momentum: ParamDomain::Uniform { low: 0.0, high: 0.9 },
            batch_size: ParamDomain::choice([16.0, 32.0, 64.0, 128.0]),
        }
    }
}

impl SearchSpace {
    /// A space holding exactly one configuration.
    pub fn single(config: TrialConfig) -> Self {
        Self {
            hidden_width: ParamDomain::choice([config.hidden_width as f64]),
            learning_rate: ParamDomain::choice([config.learning_rate]),
            momentum: ParamDomain::choice([config.momentum]),
            batch_size: ParamDomain::choice([config.batch_size as f64]),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.hidden_width.validate("hidden_width", true)?;
        self.batch_size.validate("batch_size", true)?;
        self.learning_rate.validate("learning_rate", false)?;
        self.momentum.validate("momentum", false)?;

        let (lr_low, _) = self.learning_rate.bounds();
        if lr_low <= 0.0 {
            return Err(TunerError::config("search space 'learning_rate': must be positive"));
        }
        let (m_low, m_high) = self.momentum.bounds();
        if m_low < 0.0 || m_high >= 1.0 {
            return Err(TunerError::config("search space 'momentum': must lie in [0, 1)"));
        }
        Ok(())
    }

    /// Number of distinct configurations, `None` if any domain is continuous.
    pub fn cardinality(&self) -> Option<usize> {
        [
            &self.hidden_width,
            &self.learning_rate,
            &self.momentum,
            &self.batch_size,
        ]
        .iter()
        .try_fold(1usize, |acc, d| d.cardinality().map(|c| acc.saturating_mul(c)))
    }

    pub(crate) fn sample(&self, rng: &mut impl Rng) -> TrialConfig {
        TrialConfig {
            hidden_width: self.hidden_width.sample(rng).round() as usize,
            learning_rate: self.learning_rate.sample(rng),
            momentum: self.momentum.sample(rng),
            batch_size: self.batch_size.sample(rng).round() as usize,
        }
    }

    /// Draw `count` distinct configurations from a stream seeded with `seed`.
    ///
    /// A finite space smaller than `count` yields every configuration it has.
    pub fn sample_unexplored(&self, count: usize, seed: u64) -> Result<Vec<TrialConfig>> {
        self.validate()?;

        let target = match self.cardinality() {
            Some(card) if card < count => {
                log::warn!(
                    "Search space has only {} distinct configurations; running {} trials instead of {}",
                    card,
                    card,
                    count
                );
                card
            }
            _ => count,
        };

        let mut rng = StdRng::seed_from_u64(seed);
        let mut seen = HashSet::with_capacity(target);
        let mut configs = Vec::with_capacity(target);
        let max_draws = target.saturating_mul(1000).max(1000);
        let mut draws = 0usize;

        while configs.len() < target && draws < max_draws {
            draws += 1;
            let config = self.sample(&mut rng);
            if seen.insert(config.key()) {
                configs.push(config);
            }
        }

        if configs.len() < target {
            log::warn!(
                "Only found {} unexplored configurations after {} draws",
                configs.len(),
                draws
            );
        }
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_space_matches_bounds() {
        let space = SearchSpace::default();
        space.validate().unwrap();
        let configs = space.sample_unexplored(200, 11).unwrap();
        assert_eq!(configs.len(), 200);
        for c in &configs {
            assert!([64, 128, 256, 512, 1024, 2048].contains(&c.hidden_width));
            assert!([16, 32, 64, 128].contains(&c.batch_size));
            assert!(c.learning_rate >= 1e-4 && c.learning_rate < 1e-1);
            assert!(c.momentum >= 0.0 && c.momentum < 0.9);
        }
    }

    #[test]
    fn sampling_is_seeded() {
        let space = SearchSpace::default();
        assert_eq!(
            space.sample_unexplored(10, 5).unwrap(),
            space.sample_unexplored(10, 5).unwrap()
        );
    }

    #[test]
    fn single_space_yields_one_config() {
        let config = TrialConfig {
            hidden_width: 32,
            learning_rate: 0.01,
            momentum: 0.5,
            batch_size: 8,
        };
        let space = SearchSpace::single(config);
        assert_eq!(space.cardinality(), Some(1));
        assert_eq!(space.sample_unexplored(5, 0).unwrap(), vec![config]);
    }

    #[test]
    fn finite_space_is_exhausted_without_repeats() {
        let space = SearchSpace {
            hidden_width: ParamDomain::choice([8.0, 16.0]),
            learning_rate: ParamDomain::choice([0.1]),
            momentum: ParamDomain::choice([0.0, 0.5]),
            batch_size: ParamDomain::choice([4.0]),
        };
        let configs = space.sample_unexplored(10, 1).unwrap();
        assert_eq!(configs.len(), 4);
        let keys: HashSet<_> = configs.iter().map(TrialConfig::key).collect();
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn invalid_spaces_are_rejected() {
        let mut space = SearchSpace::default();
        space.batch_size = ParamDomain::Choice { values: vec![] };
        assert!(space.validate().is_err());

        let mut space = SearchSpace::default();
        space.hidden_width = ParamDomain::choice([12.5]);
        assert!(space.validate().is_err());

        let mut space = SearchSpace::default();
        space.learning_rate = ParamDomain::LogUniform { low: 0.0, high: 0.1 };
        assert!(space.validate().is_err());

        let mut space = SearchSpace::default();
        space.momentum = ParamDomain::Uniform { low: 0.0, high: 1.0 };
        assert!(space.validate().is_err());
    }

    #[test]
    fn empty_choice_is_an_error_not_a_panic() {
        let mut space = SearchSpace::default();
        space.hidden_width = ParamDomain::Choice { values: vec![] };
        let err = space.sample_unexplored(3, 0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn space_reads_from_json() {
        let json = r#"{
            "hidden_width": {"kind": "choice", "values": [64, 128]},
            "learning_rate": {"kind": "log_uniform", "low": 0.0001, "high": 0.1}
        }"#;
        let space: SearchSpace = serde_json::from_str(json).unwrap();
        assert_eq!(space.hidden_width.cardinality(), Some(2));
        assert_eq!(space.batch_size, SearchSpace::default().batch_size);
    }
}
