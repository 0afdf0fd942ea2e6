//! Label vocabulary and the label file.
//!
//! Class indices are assigned in first-encounter order over the winners'
//! iteration order, so the same winners always give the same indices. A
//! different trace can reassign them, which is why the vocabulary is written
//! out next to every trained model and can be loaded back instead of rebuilt.
//!
//! Label file layout (read by the inference side):
//!
//! ```text
//! Compression Rate      <- metric name
//! 4096                  <- model input size
//! zstd:3                <- class 0
//! lz4:1                 <- class 1
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, TunerError};
use crate::winners::Winners;

// --- Compressor choice ---

/// A `compressor:level` pair, the string form used as a class label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompressorChoice {
    pub compressor: String,
    pub level: i32,
}

impl CompressorChoice {
    pub fn new(compressor: impl Into<String>, level: i32) -> Self {
        Self {
            compressor: compressor.into(),
            level,
        }
    }
}

impl fmt::Display for CompressorChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.compressor, self.level)
    }
}

impl FromStr for CompressorChoice {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        // Level is after the last ':' so compressor names may contain colons.
        let (name, level) = s
            .rsplit_once(':')
            .ok_or_else(|| TunerError::config(format!("label '{}' is not compressor:level", s)))?;
        let level = level
            .trim()
            .parse::<i32>()
            .map_err(|e| TunerError::config(format!("label '{}' has a bad level: {}", s, e)))?;
        if name.is_empty() {
            return Err(TunerError::config(format!("label '{}' has no compressor", s)));
        }
        Ok(CompressorChoice::new(name, level))
    }
}

// --- Vocabulary ---

/// Bijection between label strings and dense class indices `0..K`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelVocabulary {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelVocabulary {
    /// Collect distinct labels in the winners' iteration order.
    pub fn build(winners: &Winners) -> Self {
        Self::from_labels(winners.iter().map(|w| w.label.as_str()))
    }

    /// Build from labels in the given order; duplicates keep their first index.
    pub fn from_labels<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut vocab = LabelVocabulary::default();
        for label in labels {
            if !vocab.index.contains_key(label) {
                vocab.index.insert(label.to_string(), vocab.labels.len());
                vocab.labels.push(label.to_string());
            }
        }
        vocab
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Write the label file: metric name, input size, then one label per line.
    pub fn export(&self, path: impl AsRef<Path>, metric_name: &str, input_dim: usize) -> Result<()> {
        let path = path.as_ref();
        let mut out = String::new();
        out.push_str(metric_name);
        out.push('\n');
        out.push_str(&input_dim.to_string());
        out.push('\n');
        for label in &self.labels {
            out.push_str(label);
            out.push('\n');
        }
        fs::write(path, out).map_err(|e| TunerError::io(path, e))?;
        log::info!("Exported {} labels to {}", self.len(), path.display());
        Ok(())
    }
}

/// A label file read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFile {
    pub metric_name: String,
    pub input_dim: usize,
    pub vocabulary: LabelVocabulary,
}

impl LabelFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| TunerError::io(path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines();
        let metric_name = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| TunerError::config("label file has no metric name"))?
            .to_string();
        let input_dim = lines
            .next()
            .and_then(|l| l.trim().parse::<usize>().ok())
            .ok_or_else(|| TunerError::config("label file has no input size on line 2"))?;

        let mut labels = Vec::new();
        for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
            line.parse::<CompressorChoice>()?;
            labels.push(line);
        }

        let vocabulary = LabelVocabulary::from_labels(labels.iter().copied());
        if vocabulary.len() != labels.len() {
            return Err(TunerError::config("label file repeats a label"));
        }

        Ok(Self {
            metric_name,
            input_dim,
            vocabulary,
        })
    }

    /// Parsed `compressor:level` pairs in class-index order.
    pub fn choices(&self) -> Vec<CompressorChoice> {
        self.vocabulary
            .labels()
            .iter()
            .filter_map(|l| l.parse().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{MetricDefinition, COMPRESSION_RATE};
    use crate::trace::TraceRecord;

    fn winners() -> Winners {
        let rows = [
            ("a", "zstd", 3, 2.1, 100),
            ("a", "lz4", 1, 1.5, 100),
            ("b", "zstd", 9, 3.0, 50),
            ("c", "zstd", 3, 1.1, 50),
        ];
        let records: Vec<TraceRecord> = rows
            .iter()
            .map(|(c, n, l, v, s)| TraceRecord {
                chunk_name: c.to_string(),
                compressor_name: n.to_string(),
                compressor_level: *l,
                metric_name: COMPRESSION_RATE.into(),
                metric_value: *v,
                size: *s,
            })
            .collect();
        Winners::select(&records, &MetricDefinition::resolve(COMPRESSION_RATE, None), 10)
    }

    #[test]
    fn first_encounter_order() {
        let vocab = LabelVocabulary::build(&winners());
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.index_of("zstd:3"), Some(0));
        assert_eq!(vocab.index_of("zstd:9"), Some(1));
        assert_eq!(vocab.label(1), Some("zstd:9"));
        assert_eq!(vocab.index_of("lz4:1"), None);
    }

    #[test]
    fn build_is_idempotent() {
        let w = winners();
        assert_eq!(LabelVocabulary::build(&w), LabelVocabulary::build(&w));
    }

    #[test]
    fn empty_winners_give_empty_vocabulary() {
        assert!(LabelVocabulary::build(&Winners::default()).is_empty());
    }

    #[test]
    fn label_file_survives_a_trip_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        let vocab = LabelVocabulary::build(&winners());
        vocab.export(&path, COMPRESSION_RATE, 4096).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Compression Rate\n4096\nzstd:3\nzstd:9\n");

        let loaded = LabelFile::load(&path).unwrap();
        assert_eq!(loaded.metric_name, COMPRESSION_RATE);
        assert_eq!(loaded.input_dim, 4096);
        assert_eq!(loaded.vocabulary, vocab);
        assert_eq!(loaded.choices()[1], CompressorChoice::new("zstd", 9));
    }

    #[test]
    fn label_file_rejects_garbage() {
        assert!(LabelFile::parse("").is_err());
        assert!(LabelFile::parse("Compression Rate\nnot-a-number\n").is_err());
        assert!(LabelFile::parse("Compression Rate\n16\nzstd\n").is_err());
        assert!(LabelFile::parse("Compression Rate\n16\nzstd:1\nzstd:1\n").is_err());
    }

    #[test]
    fn compressor_choice_parses_last_colon() {
        let c: CompressorChoice = "lz4-fast:12".parse().unwrap();
        assert_eq!(c, CompressorChoice::new("lz4-fast", 12));
        assert_eq!(c.to_string(), "lz4-fast:12");
        assert!(":3".parse::<CompressorChoice>().is_err());
    }
}
