//! # Journal — Append-Only Trace File
//!
//! One entry per line:
//!
//! ```text
//! <crc32 as 8 hex digits> <entry as compact JSON>\n
//! ```
//!
//! Entries are never rewritten. Replay recomputes every checksum and reports
//! lines that fail verification instead of aborting, so one torn write at
//! the end of the file does not hide the rest of the history.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal entry encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of reading a journal back.
#[derive(Debug)]
pub struct ReplayReport<T> {
    pub entries: Vec<T>,
    /// 1-based line numbers that failed checksum or decoding.
    pub corrupt_lines: Vec<usize>,
}

impl<T> ReplayReport<T> {
    pub fn is_clean(&self) -> bool {
        self.corrupt_lines.is_empty()
    }
}

pub struct TraceJournal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TraceJournal {
    /// Open (or create) a journal for appending. Existing entries are kept.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append entries with one write and flush them to the OS. Every entry
    /// is encoded before anything touches the file, so an encoding failure
    /// writes nothing.
    pub fn append_batch<T: Serialize>(&mut self, entries: &[T]) -> Result<(), JournalError> {
        let mut block = String::new();
        for entry in entries {
            let json = serde_json::to_string(entry)?;
            block.push_str(&format!("{:08x} {}\n", checksum(json.as_bytes()), json));
        }
        self.writer.write_all(block.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read every entry back, verifying checksums.
    pub fn replay<T: DeserializeOwned>(
        path: impl AsRef<Path>,
    ) -> Result<ReplayReport<T>, JournalError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut report = ReplayReport {
            entries: Vec::new(),
            corrupt_lines: Vec::new(),
        };

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match decode_line(&line) {
                Some(entry) => report.entries.push(entry),
                None => report.corrupt_lines.push(idx + 1),
            }
        }
        Ok(report)
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn decode_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let (crc_hex, json) = line.split_once(' ')?;
    let expected = u32::from_str_radix(crc_hex, 16).ok()?;
    if checksum(json.as_bytes()) != expected {
        return None;
    }
    serde_json::from_str(json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        id: u32,
        label: String,
    }

    fn entry(id: u32) -> Entry {
        Entry {
            id,
            label: format!("entry-{}", id),
        }
    }

    #[test]
    fn test_append_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");

        let mut journal = TraceJournal::open(&path).unwrap();
        journal.append_batch(&[entry(1), entry(2)]).unwrap();

        let report: ReplayReport<Entry> = TraceJournal::replay(&path).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.entries, vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_reopen_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");

        TraceJournal::open(&path).unwrap().append_batch(&[entry(1)]).unwrap();
        TraceJournal::open(&path).unwrap().append_batch(&[entry(2)]).unwrap();

        let report: ReplayReport<Entry> = TraceJournal::replay(&path).unwrap();
        assert_eq!(report.entries.len(), 2);
    }

    #[derive(Serialize)]
    enum Line {
        Good(u32),
        Unencodable(std::collections::BTreeMap<Vec<u8>, u32>),
    }

    #[test]
    fn test_batch_with_unencodable_entry_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");

        let mut journal = TraceJournal::open(&path).unwrap();
        let bad = std::collections::BTreeMap::from([(vec![1u8], 1u32)]);
        let err = journal
            .append_batch(&[Line::Good(1), Line::Unencodable(bad)])
            .unwrap_err();
        assert!(matches!(err, JournalError::Encode(_)));

        journal.append_batch(&[Line::Good(2), Line::Good(3)]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(!contents.contains("{\"Good\":1}"));
    }

    #[test]
    fn test_tampered_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");

        let mut journal = TraceJournal::open(&path).unwrap();
        journal.append_batch(&[entry(1), entry(2)]).unwrap();
        drop(journal);

        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replacen("entry-2", "entry-9", 1);
        std::fs::write(&path, format!("{}garbage\n", tampered)).unwrap();

        let report: ReplayReport<Entry> = TraceJournal::replay(&path).unwrap();
        assert_eq!(report.entries, vec![entry(1)]);
        assert_eq!(report.corrupt_lines, vec![2, 3]);
    }
}
