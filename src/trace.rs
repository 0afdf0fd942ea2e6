//! Trace store reader.
//!
//! The benchmark tracer records one row per (chunk, compressor, level, metric)
//! measurement. On disk the store is JSON Lines: one object per row, keyed by
//! the tracer's column names. Rows are exposed in file order, which is the
//! order every downstream tie-break depends on.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};

/// One measurement from the trace store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    #[serde(rename = "Chunk Name", alias = "chunk_name")]
    pub chunk_name: String,
    #[serde(rename = "Compressor name", alias = "compressor_name")]
    pub compressor_name: String,
    #[serde(rename = "Compressor Level", alias = "compressor_level")]
    pub compressor_level: i32,
    #[serde(rename = "Metric Name", alias = "metric_name")]
    pub metric_name: String,
    #[serde(rename = "Metric Measurement", alias = "metric_value")]
    pub metric_value: f64,
    #[serde(rename = "Size", alias = "size")]
    pub size: u64,
}

/// Sequential reader over a JSON Lines trace.
///
/// Yields records in file order. Blank lines are skipped; the first row that
/// fails to decode ends iteration with a [`TunerError::TraceFormat`].
pub struct TraceReader<R> {
    reader: R,
    path: PathBuf,
    line: usize,
    buf: String,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TunerError::io(path, e))?;
        Ok(Self::new(BufReader::new(file), path))
    }
}

impl<R: BufRead> TraceReader<R> {
    /// Wrap an already-open reader. `path` is only used in error messages.
    pub fn new(reader: R, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            path: path.into(),
            line: 0,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<TraceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            self.line += 1;
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(TunerError::io(&self.path, e))),
            }

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }

            return Some(serde_json::from_str(line).map_err(|e| TunerError::TraceFormat {
                path: self.path.clone(),
                line: self.line,
                message: e.to_string(),
            }));
        }
    }
}

/// Read the whole trace into memory, failing on the first bad row.
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<TraceRecord>> {
    let path = path.as_ref();
    let records = TraceReader::open(path)?.collect::<Result<Vec<_>>>()?;
    log::info!("Read {} trace records from {}", records.len(), path.display());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const ROWS: &str = r#"{"Chunk Name": "a.data", "Compressor name": "zstd", "Compressor Level": 3, "Metric Name": "Compression Rate", "Metric Measurement": 2.1, "Size": 100}

{"chunk_name": "b.data", "compressor_name": "lz4", "compressor_level": 1, "metric_name": "Compression Speed", "metric_value": 5e8, "size": 4096}
"#;

    #[test]
    fn reads_rows_in_order_and_skips_blank_lines() {
        let records: Vec<TraceRecord> = TraceReader::new(Cursor::new(ROWS), "mem")
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].chunk_name, "a.data");
        assert_eq!(records[0].compressor_level, 3);
        assert_eq!(records[1].compressor_name, "lz4");
        assert_eq!(records[1].size, 4096);
    }

    #[test]
    fn bad_row_reports_its_line() {
        let input = format!("{}\n{{\"Chunk Name\": \"x\"}}\n", ROWS.lines().next().unwrap());
        let mut reader = TraceReader::new(Cursor::new(input), "meta.jsonl");
        assert!(reader.next().unwrap().is_ok());
        match reader.next().unwrap() {
            Err(TunerError::TraceFormat { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected TraceFormat, got {:?}", other),
        }
    }

    #[test]
    fn missing_store_is_io_error() {
        let err = read_trace("/nonexistent/meta.jsonl").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}
