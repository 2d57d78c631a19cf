//! Append-only JSONL queues written by many instances and drained by one
//! periodic sync job.

pub mod graph;
mod lifecycle;
pub mod memory;

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use lifecycle::{
    archive, archive_as, archive_at, claim, claim_at, clear, is_stale, is_stale_at,
    pending_batches,
};

/// A line type that can live in a queue file.
pub trait QueueRecord: Serialize + DeserializeOwned {
    /// Short name used in log lines and errors.
    const KIND: &'static str;

    /// Records that parse but fail this check are dropped on read.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Storage-agnostic queue operations. Aggregation only ever sees the output
/// of `read_all`, so the backing medium can change without touching it.
pub trait Queue {
    type Record;

    fn append(&self, record: &Self::Record) -> Result<()>;
    fn read_all(&self) -> Result<Vec<Self::Record>>;
    fn clear(&self) -> Result<()>;
    fn archive(&self, archive_dir: &Path) -> Result<Option<PathBuf>>;
    fn is_stale(&self, max_age: Duration) -> bool;
}

/// Raw line counts for a queue file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub lines: usize,
    pub valid: usize,
}

/// Records taken from a queue by one sync run, and the claimed files they
/// came from.
#[derive(Debug)]
pub struct Drained<T> {
    pub records: Vec<T>,
    pub batches: Vec<PathBuf>,
}

/// A queue backed by one JSON-lines file.
#[derive(Debug, Clone)]
pub struct JsonlQueue<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: QueueRecord> JsonlQueue<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Count non-blank lines and how many of them read as valid records.
    pub fn stats(&self) -> Result<QueueStats> {
        let Some(contents) = read_bytes(&self.path)? else {
            return Ok(QueueStats::default());
        };
        let mut stats = QueueStats::default();
        for line in non_blank_lines(&contents) {
            stats.lines += 1;
            if line.and_then(parse_line::<T>).is_some() {
                stats.valid += 1;
            }
        }
        Ok(stats)
    }

    /// Batches claimed by an earlier sync that never finished.
    pub fn pending(&self) -> Result<usize> {
        pending_batches(&self.path).map(|b| b.len())
    }

    /// Claim the live file and read it together with any unfinished batches.
    /// Lines appended after the claim land in a new live file and are left
    /// for the next run.
    pub fn drain(&self) -> Result<Drained<T>> {
        let batches = claim(&self.path)?;
        let mut records = Vec::new();
        for batch in &batches {
            records.extend(read_lines(batch)?);
        }
        Ok(Drained { records, batches })
    }

    /// Everything a drain would return, without moving any file.
    pub fn peek(&self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for batch in pending_batches(&self.path)? {
            records.extend(read_lines(&batch)?);
        }
        records.extend(read_lines(&self.path)?);
        Ok(records)
    }

    /// Retire drained batches: archive them under the queue's name when an
    /// archive directory is given, delete them otherwise.
    pub fn finish(&self, batches: &[PathBuf], archive_dir: Option<&Path>) -> Result<()> {
        for batch in batches {
            match archive_dir {
                Some(dir) => {
                    archive_as(batch, &self.path, dir, chrono::Utc::now())?;
                }
                None => {
                    clear(batch)?;
                }
            }
        }
        Ok(())
    }
}

impl<T: QueueRecord> Queue for JsonlQueue<T> {
    type Record = T;

    /// One `write` of one complete line on an append handle, so concurrent
    /// appenders interleave whole lines.
    fn append(&self, record: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record)
            .with_context(|| format!("serializing {} record", T::KIND))?;
        line.push('\n');

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .with_context(|| format!("appending to {}", self.path.display()))
    }

    fn read_all(&self) -> Result<Vec<T>> {
        read_lines(&self.path)
    }

    fn clear(&self) -> Result<()> {
        clear(&self.path).map(|_| ())
    }

    fn archive(&self, archive_dir: &Path) -> Result<Option<PathBuf>> {
        archive(&self.path, archive_dir)
    }

    fn is_stale(&self, max_age: Duration) -> bool {
        is_stale(&self.path, max_age)
    }
}

/// Read every valid record from a JSONL file, in file order.
///
/// A missing file is empty. Blank, unparseable, and invalid lines are
/// skipped individually. Read errors other than "not found" propagate.
pub fn read_lines<T: QueueRecord>(path: &Path) -> Result<Vec<T>> {
    let Some(contents) = read_bytes(path)? else {
        return Ok(Vec::new());
    };

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for line in non_blank_lines(&contents) {
        match line.and_then(parse_line::<T>) {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::debug!(
            kind = T::KIND,
            path = %path.display(),
            skipped,
            "skipped unusable queue lines"
        );
    }
    Ok(records)
}

fn parse_line<T: QueueRecord>(line: &str) -> Option<T> {
    serde_json::from_str::<T>(line.trim())
        .ok()
        .filter(T::is_valid)
}

/// Split on newlines, dropping blank lines. Lines that aren't UTF-8 come
/// back as `None` so callers can count them as corrupt.
fn non_blank_lines(contents: &[u8]) -> impl Iterator<Item = Option<&str>> {
    contents
        .split(|b| *b == b'\n')
        .map(|raw| std::str::from_utf8(raw).ok())
        .filter(|line| line.is_none_or(|l| !l.trim().is_empty()))
}

fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("reading {}", path.display()))),
    }
}
