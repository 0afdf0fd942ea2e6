//! Chunk dataset: raw chunk bytes to fixed-length feature vectors.
//!
//! A chunk file is a blob of little-endian `f32`s. Features are the first
//! `dim` floats, zero-padded on the right, with NaN and infinities zeroed.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, TunerError};
use crate::vocab::LabelVocabulary;
use crate::winners::Winners;

/// Default feature length: one 16 KiB chunk of f32s.
pub const DEFAULT_DIM: usize = 4096;

const FLOAT_BYTES: usize = std::mem::size_of::<f32>();

/// One training example.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub features: Vec<f32>,
    pub label_index: usize,
}

/// Decode raw chunk bytes into exactly `dim` finite floats.
///
/// A trailing partial float is ignored.
pub fn decode_features(bytes: &[u8], dim: usize) -> Vec<f32> {
    let mut features = vec![0.0f32; dim];
    for (slot, raw) in features.iter_mut().zip(bytes.chunks_exact(FLOAT_BYTES)) {
        let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        *slot = if value.is_finite() { value } else { 0.0 };
    }
    features
}

/// Read one chunk and label it.
///
/// Fails with [`TunerError::MissingLabel`] if the chunk has no winner and with
/// [`TunerError::InvalidData`] if the file is missing, unreadable or empty.
pub fn sample(
    chunk_name: &str,
    storage_root: &Path,
    dim: usize,
    winners: &Winners,
    vocab: &LabelVocabulary,
) -> Result<Sample> {
    let winner = winners
        .get(chunk_name)
        .ok_or_else(|| TunerError::MissingLabel(chunk_name.to_string()))?;
    let label_index = vocab
        .index_of(&winner.label)
        .ok_or_else(|| TunerError::MissingLabel(chunk_name.to_string()))?;

    let path = storage_root.join(chunk_name);
    let bytes = fs::read(&path).map_err(|e| TunerError::InvalidData {
        chunk: chunk_name.to_string(),
        reason: format!("cannot read {}: {}", path.display(), e),
    })?;
    if bytes.len() < FLOAT_BYTES {
        return Err(TunerError::InvalidData {
            chunk: chunk_name.to_string(),
            reason: format!("chunk holds {} bytes, less than one float", bytes.len()),
        });
    }

    Ok(Sample {
        features: decode_features(&bytes, dim),
        label_index,
    })
}

/// All samples that could be loaded, in winner order.
#[derive(Debug, Clone)]
pub struct ChunkDataset {
    samples: Vec<Sample>,
    chunk_names: Vec<String>,
    dim: usize,
    num_classes: usize,
    skipped: usize,
}

impl ChunkDataset {
    /// Load every winner's chunk from `storage_root`.
    ///
    /// An unreachable storage root is fatal. Individual bad chunks are logged
    /// and skipped.
    pub fn load(
        winners: &Winners,
        vocab: &LabelVocabulary,
        storage_root: &Path,
        dim: usize,
    ) -> Result<Self> {
        if dim == 0 {
            return Err(TunerError::config("feature dimension must be positive"));
        }
        let meta = fs::metadata(storage_root).map_err(|e| TunerError::io(storage_root, e))?;
        if !meta.is_dir() {
            return Err(TunerError::io(
                storage_root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "chunk storage is not a directory"),
            ));
        }

        let mut samples = Vec::with_capacity(winners.len());
        let mut chunk_names = Vec::with_capacity(winners.len());
        let mut skipped = 0usize;

        for winner in winners.iter() {
            match sample(&winner.chunk_name, storage_root, dim, winners, vocab) {
                Ok(s) => {
                    samples.push(s);
                    chunk_names.push(winner.chunk_name.clone());
                }
                Err(e) if e.is_per_sample() => {
                    log::warn!("Skipping chunk: {}", e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Loaded {} chunks from {} ({} skipped)",
            samples.len(),
            storage_root.display(),
            skipped
        );

        Ok(Self {
            samples,
            chunk_names,
            dim,
            num_classes: vocab.len(),
            skipped,
        })
    }

    /// Build directly from samples. Every sample must have length `dim` and a
    /// label below `num_classes`.
    pub fn from_samples(samples: Vec<Sample>, dim: usize, num_classes: usize) -> Result<Self> {
        for (i, s) in samples.iter().enumerate() {
            if s.features.len() != dim {
                return Err(TunerError::InvalidData {
                    chunk: format!("#{}", i),
                    reason: format!("{} features, expected {}", s.features.len(), dim),
                });
            }
            if s.label_index >= num_classes {
                return Err(TunerError::MissingLabel(format!("#{}", i)));
            }
        }
        let chunk_names = (0..samples.len()).map(|i| format!("#{}", i)).collect();
        Ok(Self {
            samples,
            chunk_names,
            dim,
            num_classes,
            skipped: 0,
        })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn chunk_name(&self, index: usize) -> Option<&str> {
        self.chunk_names.get(index).map(String::as_str)
    }

    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label_index).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

// --- Train / validation split ---

/// Disjoint, exhaustive partition of dataset indices. Both lists are sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Stratified, seeded split.
///
/// Classes are visited in ascending label order. Each class's indices are
/// shuffled with `StdRng::seed_from_u64(seed)` and the first
/// `round(n * validation_fraction)` go to validation, capped at `n - 1` so a
/// class with more than one sample always keeps a training example. If that
/// leaves validation empty for a dataset of two or more samples, one sample of
/// the largest class is moved over.
pub fn split(labels: &[usize], validation_fraction: f64, seed: u64) -> Result<DatasetSplit> {
    if !(validation_fraction > 0.0 && validation_fraction < 1.0) {
        return Err(TunerError::config(format!(
            "validation fraction {} is outside (0, 1)",
            validation_fraction
        )));
    }

    let num_classes = labels.iter().max().map_or(0, |m| m + 1);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (i, &label) in labels.iter().enumerate() {
        by_class[label].push(i);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut validation = Vec::new();
    let mut largest: Option<(usize, Vec<usize>)> = None;

    for members in by_class.iter_mut() {
        let n = members.len();
        if n == 0 {
            continue;
        }
        members.shuffle(&mut rng);
        let mut n_val = (n as f64 * validation_fraction).round() as usize;
        if n > 1 {
            n_val = n_val.min(n - 1);
        } else {
            n_val = 0;
        }
        validation.extend_from_slice(&members[..n_val]);
        let rest = &members[n_val..];
        if largest.as_ref().map_or(true, |(size, _)| n > *size) {
            largest = Some((n, rest.to_vec()));
        }
        train.extend_from_slice(rest);
    }

    if validation.is_empty() && labels.len() >= 2 {
        if let Some((_, rest)) = largest {
            if let Some(&moved) = rest.last() {
                train.retain(|&i| i != moved);
                validation.push(moved);
            }
        }
    }

    train.sort_unstable();
    validation.sort_unstable();
    Ok(DatasetSplit { train, validation })
}

/// Samples per class index, `num_classes` long.
pub fn class_counts(labels: &[usize], num_classes: usize) -> Vec<usize> {
    let mut counts = vec![0usize; num_classes];
    for &label in labels {
        if label < num_classes {
            counts[label] += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{MetricDefinition, COMPRESSION_RATE};
    use crate::trace::TraceRecord;
    use proptest::prelude::*;

    fn floats_to_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn fixture(names: &[(&str, &str)]) -> (Winners, LabelVocabulary) {
        let records: Vec<TraceRecord> = names
            .iter()
            .map(|(chunk, comp)| TraceRecord {
                chunk_name: chunk.to_string(),
                compressor_name: comp.to_string(),
                compressor_level: 1,
                metric_name: COMPRESSION_RATE.into(),
                metric_value: 1.0,
                size: 100,
            })
            .collect();
        let winners =
            Winners::select(&records, &MetricDefinition::resolve(COMPRESSION_RATE, None), 0);
        let vocab = LabelVocabulary::build(&winners);
        (winners, vocab)
    }

    #[test]
    fn short_chunk_is_zero_padded_and_nan_cleared() {
        let bytes = floats_to_bytes(&[1.0, f32::NAN, f32::INFINITY, -2.5]);
        let features = decode_features(&bytes, 6);
        assert_eq!(features, vec![1.0, 0.0, 0.0, -2.5, 0.0, 0.0]);
    }

    #[test]
    fn long_chunk_is_truncated() {
        let bytes = floats_to_bytes(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(decode_features(&bytes, 2), vec![1.0, 2.0]);
    }

    #[test]
    fn trailing_partial_float_is_ignored() {
        let mut bytes = floats_to_bytes(&[7.0]);
        bytes.extend_from_slice(&[0xff, 0xff]);
        assert_eq!(decode_features(&bytes, 3), vec![7.0, 0.0, 0.0]);
    }

    #[test]
    fn sample_reads_and_labels_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (winners, vocab) = fixture(&[("a", "zstd"), ("b", "lz4")]);
        fs::write(dir.path().join("b"), floats_to_bytes(&[0.5, f32::NAN])).unwrap();

        let s = sample("b", dir.path(), 4, &winners, &vocab).unwrap();
        assert_eq!(s.features, vec![0.5, 0.0, 0.0, 0.0]);
        assert_eq!(s.label_index, 1);

        let again = sample("b", dir.path(), 4, &winners, &vocab).unwrap();
        assert_eq!(s, again);
    }

    #[test]
    fn missing_file_and_missing_label() {
        let dir = tempfile::tempdir().unwrap();
        let (winners, vocab) = fixture(&[("a", "zstd")]);
        assert!(matches!(
            sample("a", dir.path(), 4, &winners, &vocab),
            Err(TunerError::InvalidData { .. })
        ));
        assert!(matches!(
            sample("zzz", dir.path(), 4, &winners, &vocab),
            Err(TunerError::MissingLabel(_))
        ));
    }

    #[test_log::test]
    fn load_skips_bad_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (winners, vocab) = fixture(&[("a", "zstd"), ("b", "lz4"), ("c", "zstd")]);
        fs::write(dir.path().join("a"), floats_to_bytes(&[1.0])).unwrap();
        fs::write(dir.path().join("b"), Vec::<u8>::new()).unwrap();
        fs::write(dir.path().join("c"), floats_to_bytes(&[3.0, 4.0])).unwrap();

        let dataset = ChunkDataset::load(&winners, &vocab, dir.path(), 2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.skipped(), 1);
        assert_eq!(dataset.chunk_name(1), Some("c"));
        assert_eq!(dataset.labels(), vec![0, 0]);
        assert_eq!(dataset.num_classes(), 2);
    }

    #[test]
    fn unreachable_storage_is_fatal() {
        let (winners, vocab) = fixture(&[("a", "zstd")]);
        let err = ChunkDataset::load(&winners, &vocab, Path::new("/nonexistent/chunks"), 4)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[test]
    fn split_is_stratified() {
        let labels: Vec<usize> = (0..100).map(|i| if i < 80 { 0 } else { 1 }).collect();
        let s = split(&labels, 0.2, 0).unwrap();
        let val_counts = class_counts(
            &s.validation.iter().map(|&i| labels[i]).collect::<Vec<_>>(),
            2,
        );
        assert_eq!(val_counts, vec![16, 4]);
        assert_eq!(s.train.len(), 80);
    }

    #[test]
    fn split_never_leaves_validation_empty() {
        let s = split(&[0, 1, 2], 0.2, 3).unwrap();
        assert_eq!(s.validation.len(), 1);
        assert_eq!(s.train.len(), 2);
    }

    #[test]
    fn split_rejects_bad_fraction() {
        assert!(split(&[0, 1], 0.0, 0).is_err());
        assert!(split(&[0, 1], 1.0, 0).is_err());
    }

    proptest! {
        #[test]
        fn split_is_deterministic_disjoint_and_exhaustive(
            labels in prop::collection::vec(0usize..5, 0..200),
            fraction in 0.05f64..0.95,
            seed in any::<u64>(),
        ) {
            let a = split(&labels, fraction, seed).unwrap();
            let b = split(&labels, fraction, seed).unwrap();
            prop_assert_eq!(&a, &b);

            let mut all: Vec<usize> = a.train.iter().chain(a.validation.iter()).copied().collect();
            all.sort_unstable();
            prop_assert_eq!(all, (0..labels.len()).collect::<Vec<_>>());
        }

        #[test]
        fn decoded_length_is_always_dim(bytes in prop::collection::vec(any::<u8>(), 0..64), dim in 1usize..32) {
            let features = decode_features(&bytes, dim);
            prop_assert_eq!(features.len(), dim);
            prop_assert!(features.iter().all(|v| v.is_finite()));
        }
    }
}
