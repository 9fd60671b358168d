//! Newline-delimited JSON training log.

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// One line of the log, written after every epoch. Costs are epoch means
/// over the updates of that kind, `None` when there were none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRecord {
    pub n_epochs: usize,
    pub n_updates: usize,
    pub n_examples: usize,
    pub n_seconds: f64,
    pub g_cost: Option<f32>,
    pub d_cost: Option<f32>,
}

pub struct NdjsonLog {
    writer: BufWriter<File>,
}

impl NdjsonLog {
    /// Opens `path` for appending, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run.ndjson");
        let mut log = NdjsonLog::open(&path).unwrap();
        for n in 1..=2 {
            log.append(&EpochRecord {
                n_epochs: n,
                n_updates: 4 * n,
                n_examples: 500 * n,
                n_seconds: 1.5,
                g_cost: Some(0.25),
                d_cost: None,
            })
            .unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["n_updates"], 8);
        assert_eq!(lines[0]["g_cost"], 0.25);
        assert!(lines[0]["d_cost"].is_null());
    }
}
