//! Winner selection: one best compressor configuration per chunk.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::metric::MetricDefinition;
use crate::trace::TraceRecord;
use crate::vocab::CompressorChoice;

/// The best configuration observed for one chunk under one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerEntry {
    pub chunk_name: String,
    /// Position of the winning record in the full trace, filtered rows included.
    pub chunk_index: usize,
    pub metric_value: f64,
    /// `"{compressor_name}:{compressor_level}"`
    pub label: String,
    pub compressor_level: i32,
}

/// Winners keyed by chunk name, iterated in the order each chunk first
/// qualified. Replacing a winner keeps its position.
#[derive(Debug, Clone, Default)]
pub struct Winners {
    entries: Vec<WinnerEntry>,
    by_chunk: HashMap<String, usize>,
}

impl Winners {
    /// Reduce `records` to one winner per chunk.
    ///
    /// A record qualifies if its size is strictly above `min_size`, its metric
    /// name matches, and its measurement is finite. A qualifying record
    /// replaces the current winner only if it is strictly better, so on ties
    /// the first record in trace order is kept.
    pub fn select<'a, I>(records: I, metric: &MetricDefinition, min_size: u64) -> Self
    where
        I: IntoIterator<Item = &'a TraceRecord>,
    {
        let mut winners = Winners::default();
        let mut considered = 0usize;

        for (chunk_index, record) in records.into_iter().enumerate() {
            if record.size <= min_size || record.metric_name != metric.name {
                continue;
            }
            if !record.metric_value.is_finite() {
                log::debug!(
                    "Skipping non-finite measurement for chunk '{}' at row {}",
                    record.chunk_name,
                    chunk_index
                );
                continue;
            }
            considered += 1;

            match winners.by_chunk.get(&record.chunk_name) {
                Some(&slot) => {
                    let current = &mut winners.entries[slot];
                    if metric
                        .direction
                        .is_better(record.metric_value, current.metric_value)
                    {
                        *current = WinnerEntry::from_record(record, chunk_index);
                    }
                }
                None => {
                    winners
                        .by_chunk
                        .insert(record.chunk_name.clone(), winners.entries.len());
                    winners
                        .entries
                        .push(WinnerEntry::from_record(record, chunk_index));
                }
            }
        }

        log::info!(
            "Selected {} winners for '{}' from {} qualifying records",
            winners.len(),
            metric,
            considered
        );
        winners
    }

    pub fn get(&self, chunk_name: &str) -> Option<&WinnerEntry> {
        self.by_chunk.get(chunk_name).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &WinnerEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of chunks won by each label, in first-encounter order.
    pub fn label_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        let mut slots: HashMap<&str, usize> = HashMap::new();
        for entry in &self.entries {
            match slots.get(entry.label.as_str()) {
                Some(&slot) => counts[slot].1 += 1,
                None => {
                    slots.insert(entry.label.as_str(), counts.len());
                    counts.push((entry.label.clone(), 1));
                }
            }
        }
        counts
    }
}

impl WinnerEntry {
    fn from_record(record: &TraceRecord, chunk_index: usize) -> Self {
        Self {
            chunk_name: record.chunk_name.clone(),
            chunk_index,
            metric_value: record.metric_value,
            label: CompressorChoice::new(&record.compressor_name, record.compressor_level)
                .to_string(),
            compressor_level: record.compressor_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Direction, COMPRESSION_RATE};
    use proptest::prelude::*;

    fn record(chunk: &str, comp: &str, level: i32, metric: &str, value: f64, size: u64) -> TraceRecord {
        TraceRecord {
            chunk_name: chunk.into(),
            compressor_name: comp.into(),
            compressor_level: level,
            metric_name: metric.into(),
            metric_value: value,
            size,
        }
    }

    fn rate() -> MetricDefinition {
        MetricDefinition::resolve(COMPRESSION_RATE, None)
    }

    #[test]
    fn three_record_scenario() {
        let records = vec![
            record("a", "zstd", 3, COMPRESSION_RATE, 2.1, 100),
            record("a", "lz4", 1, COMPRESSION_RATE, 1.5, 100),
            record("b", "zstd", 9, COMPRESSION_RATE, 3.0, 50),
        ];
        let winners = Winners::select(&records, &rate(), 10);
        assert_eq!(winners.len(), 2);
        assert_eq!(winners.get("a").unwrap().label, "zstd:3");
        assert_eq!(winners.get("a").unwrap().chunk_index, 0);
        assert_eq!(winners.get("b").unwrap().label, "zstd:9");
        assert_eq!(winners.get("b").unwrap().chunk_index, 2);
    }

    #[test]
    fn first_record_wins_ties() {
        let records = vec![
            record("a", "lz4", 1, COMPRESSION_RATE, 2.0, 100),
            record("a", "zstd", 3, COMPRESSION_RATE, 2.0, 100),
        ];
        let winners = Winners::select(&records, &rate(), 0);
        assert_eq!(winners.get("a").unwrap().label, "lz4:1");
    }

    #[test]
    fn size_filter_is_exclusive() {
        let records = vec![
            record("a", "lz4", 1, COMPRESSION_RATE, 9.0, 10),
            record("a", "zstd", 3, COMPRESSION_RATE, 2.0, 11),
        ];
        let winners = Winners::select(&records, &rate(), 10);
        let a = winners.get("a").unwrap();
        assert_eq!(a.label, "zstd:3");
        assert_eq!(a.chunk_index, 1);
    }

    #[test]
    fn unmatched_metric_yields_empty() {
        let records = vec![record("a", "lz4", 1, "Compression Speed", 9.0, 100)];
        assert!(Winners::select(&records, &rate(), 0).is_empty());
    }

    #[test]
    fn minimize_direction_prefers_smaller() {
        let metric = MetricDefinition::new("Decompression Time", Direction::Minimize);
        let records = vec![
            record("a", "zstd", 19, "Decompression Time", 4.0, 100),
            record("a", "lz4", 1, "Decompression Time", 1.0, 100),
        ];
        assert_eq!(
            Winners::select(&records, &metric, 0).get("a").unwrap().label,
            "lz4:1"
        );
    }

    #[test]
    fn replacement_keeps_iteration_position() {
        let records = vec![
            record("a", "lz4", 1, COMPRESSION_RATE, 1.0, 100),
            record("b", "lz4", 1, COMPRESSION_RATE, 1.0, 100),
            record("a", "zstd", 3, COMPRESSION_RATE, 5.0, 100),
        ];
        let winners = Winners::select(&records, &rate(), 0);
        let names: Vec<&str> = winners.iter().map(|w| w.chunk_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(
            winners.label_counts(),
            vec![("zstd:3".to_string(), 1), ("lz4:1".to_string(), 1)]
        );
    }

    proptest! {
        #[test]
        fn winner_is_true_maximum(
            rows in prop::collection::vec((0usize..4, 0i32..5, 0.0f64..10.0, 0u64..20), 1..60),
            min_size in 0u64..10,
        ) {
            let records: Vec<TraceRecord> = rows
                .iter()
                .map(|(c, l, v, s)| record(&format!("c{}", c), "zstd", *l, COMPRESSION_RATE, *v, *s))
                .collect();
            let winners = Winners::select(&records, &rate(), min_size);

            for (i, r) in records.iter().enumerate() {
                if r.size <= min_size {
                    continue;
                }
                let w = winners.get(&r.chunk_name).expect("qualifying chunk has a winner");
                prop_assert!(w.metric_value >= r.metric_value);
                if w.metric_value == r.metric_value {
                    prop_assert!(w.chunk_index <= i);
                }
            }
        }
    }
}
