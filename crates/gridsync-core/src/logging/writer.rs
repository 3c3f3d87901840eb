//! Per-node JSONL files under `<logs>/raw/`.
//!
//! A node appends to `<logs>/raw/<YYYY-MM-DD>_<node>.jsonl` and moves on to a
//! new file when the local date changes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;

use super::entry::LogRecord;

struct OpenFile {
    date: NaiveDate,
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Append-only writer for one node's log files
pub struct NodeLogWriter {
    raw_dir: PathBuf,
    node: String,
    current: Mutex<OpenFile>,
}

impl NodeLogWriter {
    /// Create `<logs_dir>/raw/` and open today's file for `node`
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> io::Result<Self> {
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;
        let node = node.into();
        let current = open_for(&raw_dir, &node, Local::now().date_naive())?;
        Ok(Self {
            raw_dir,
            node,
            current: Mutex::new(current),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// File currently written to
    pub fn path(&self) -> PathBuf {
        self.current.lock().path.clone()
    }

    /// Append one record and flush
    pub fn write(&self, record: &LogRecord) -> io::Result<()> {
        let line = record
            .to_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut current = self.current.lock();
        let today = Local::now().date_naive();
        if today != current.date {
            current.writer.flush()?;
            *current = open_for(&self.raw_dir, &self.node, today)?;
        }
        writeln!(current.writer, "{}", line)?;
        current.writer.flush()
    }
}

impl Drop for NodeLogWriter {
    fn drop(&mut self) {
        let _ = self.current.lock().writer.flush();
    }
}

fn open_for(raw_dir: &Path, node: &str, date: NaiveDate) -> io::Result<OpenFile> {
    let path = raw_dir.join(format!("{}_{}.jsonl", date.format("%Y-%m-%d"), node));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(OpenFile {
        date,
        path,
        writer: BufWriter::new(file),
    })
}

/// Which records [`read_records`] returns
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Only this node
    pub node: Option<String>,
    /// Only this level and above
    pub min_level: Option<String>,
    /// Only the last `n` records after sorting
    pub tail: Option<usize>,
}

/// Read every node's records, merged and sorted by timestamp
///
/// Unparsable lines are skipped.
pub fn read_records(logs_dir: impl AsRef<Path>, filter: &RecordFilter) -> io::Result<Vec<LogRecord>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(&raw_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        records.extend(
            content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| LogRecord::parse_line(l).ok())
                .filter(|r| filter.node.as_deref().is_none_or(|n| r.node == n))
                .filter(|r| filter.min_level.as_deref().is_none_or(|l| r.is_at_least(l))),
        );
    }

    records.sort_by(|a, b| a.ts.cmp(&b.ts));
    if let Some(n) = filter.tail {
        let skip = records.len().saturating_sub(n);
        records.drain(..skip);
    }
    Ok(records)
}
