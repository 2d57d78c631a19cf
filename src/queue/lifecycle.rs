use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Suffix of a queue file claimed by a sync run.
const BATCH_SUFFIX: &str = ".processing";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Delete a processed queue file. Returns whether a file was removed; a
/// missing file is not an error.
pub fn clear(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(anyhow::Error::new(e).context(format!("removing {}", path.display()))),
    }
}

/// True when the file exists and was last modified more than `max_age` ago.
pub fn is_stale(path: &Path, max_age: Duration) -> bool {
    is_stale_at(path, max_age, SystemTime::now())
}

pub fn is_stale_at(path: &Path, max_age: Duration, now: SystemTime) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };
    // An mtime in the future reads as fresh.
    now.duration_since(modified)
        .is_ok_and(|age| age > max_age)
}

/// Move `path` into `archive_dir` under a timestamped name.
///
/// Returns the archived path, or `None` when there was nothing to archive.
pub fn archive(path: &Path, archive_dir: &Path) -> Result<Option<PathBuf>> {
    archive_at(path, archive_dir, Utc::now())
}

pub fn archive_at(path: &Path, archive_dir: &Path, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
    archive_as(path, path, archive_dir, now)
}

/// Like [`archive_at`], but the archived name is derived from `name_like`
/// instead of `path`. Claimed batches archive under their queue's name.
pub fn archive_as(
    path: &Path,
    name_like: &Path,
    archive_dir: &Path,
    now: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::create_dir_all(archive_dir)
        .with_context(|| format!("creating {}", archive_dir.display()))?;

    let target = archive_target(name_like, archive_dir, now);
    match fs::rename(path, &target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(rename_err) => {
            // Cross-device moves can't rename; fall back to copy + remove.
            tracing::debug!(error = %rename_err, "rename failed, copying archive instead");
            fs::copy(path, &target).with_context(|| {
                format!("copying {} to {}", path.display(), target.display())
            })?;
            clear(path)?;
        }
    }
    tracing::info!(from = %path.display(), to = %target.display(), "archived queue");
    Ok(Some(target))
}

/// `<stem>-<timestamp>.<ext>`, with a numeric suffix if that name is taken.
fn archive_target(path: &Path, archive_dir: &Path, now: DateTime<Utc>) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("queue");
    let ext = path.extension().and_then(|e| e.to_str());
    let stamp = now.format(STAMP_FORMAT);

    let name_for = |n: u32| {
        let base = if n == 0 {
            format!("{stem}-{stamp}")
        } else {
            format!("{stem}-{stamp}-{n}")
        };
        match ext {
            Some(ext) => format!("{base}.{ext}"),
            None => base,
        }
    };

    let mut n = 0;
    loop {
        let candidate = archive_dir.join(name_for(n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Move the live queue aside so appends from other instances start a fresh
/// file, then return every claimed batch, oldest first. Batches left behind
/// by an interrupted run are included.
pub fn claim(path: &Path) -> Result<Vec<PathBuf>> {
    claim_at(path, Utc::now())
}

pub fn claim_at(path: &Path, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
    let target = batch_target(path, now);
    match fs::rename(path, &target) {
        Ok(()) => tracing::debug!(batch = %target.display(), "claimed queue"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("claiming {}", path.display())));
        }
    }
    pending_batches(path)
}

/// Claimed batches of `path` that were not retired yet, oldest first.
pub fn pending_batches(path: &Path) -> Result<Vec<PathBuf>> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("listing {}", dir.display()))),
    };

    let prefix = format!("{name}.");
    let mut batches: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(BATCH_SUFFIX))
        })
        .collect();
    batches.sort();
    Ok(batches)
}

/// `<name>.<timestamp>.<seq>.processing`; names sort in claim order.
fn batch_target(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("queue");
    let stamp = now.format(STAMP_FORMAT);
    let mut n = 0u32;
    loop {
        let candidate = path.with_file_name(format!("{name}.{stamp}.{n:04}{BATCH_SUFFIX}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
