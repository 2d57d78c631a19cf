use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{Value, json};

use super::{OutputFormat, ProjectArgs};
use crate::config::{CoordinationEnv, ProjectPaths};
use crate::error::ExitError;
use crate::queue::graph::{self, GraphEvent};
use crate::queue::memory::{self, MemoryRecord};
use crate::queue::{JsonlQueue, Queue, QueueRecord, QueueStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueKind {
    Graph,
    Memory,
}

impl QueueKind {
    const fn name(self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Memory => "memory",
        }
    }

    fn path(self, paths: &ProjectPaths) -> PathBuf {
        match self {
            Self::Graph => paths.graph_queue(),
            Self::Memory => paths.memory_queue(),
        }
    }
}

/// What happens to a queue file once its merged contents were emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retire {
    Clear,
    Archive,
    Keep,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Append one entry to a queue
    Append {
        #[command(subcommand)]
        entry: AppendEntry,
    },
    /// Merge a queue, print the result, then clear or archive it
    Sync {
        /// Which queue to process
        #[arg(value_enum)]
        kind: QueueKind,
        /// Move the processed file to the archive directory instead of deleting it
        #[arg(long, conflicts_with = "keep")]
        archive: bool,
        /// Leave the processed file in place
        #[arg(long)]
        keep: bool,
        /// Write the merged result to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Show line counts and staleness for both queues
    Status {
        /// Queues untouched for longer than this are reported stale
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
        #[command(flatten)]
        project: ProjectArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum AppendEntry {
    /// Append a graph mutation event (JSON with `type` and `payload`)
    Graph {
        /// Event JSON
        #[arg(long)]
        event: String,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Append a memory record
    Memory {
        /// Memory content
        #[arg(long)]
        text: String,
        /// Owner scope (e.g. project-decisions)
        #[arg(long)]
        user_id: String,
        /// Agent that produced the memory
        #[arg(long)]
        agent_id: Option<String>,
        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
        #[command(flatten)]
        project: ProjectArgs,
    },
}

impl QueueCommand {
    pub fn execute(&self, env: &CoordinationEnv) -> Result<()> {
        match self {
            QueueCommand::Append { entry } => entry.execute(env),
            QueueCommand::Sync {
                kind,
                archive,
                keep,
                output,
                project,
            } => {
                let retire = if *keep {
                    Retire::Keep
                } else if *archive {
                    Retire::Archive
                } else {
                    Retire::Clear
                };
                let paths = project.paths(env)?;
                let merged = sync_queue(*kind, &paths, retire, output.as_deref())?;
                tracing::info!(queue = kind.name(), merged, "queue synced");
                Ok(())
            }
            QueueCommand::Status {
                max_age_hours,
                format,
                project,
            } => {
                let paths = project.paths(env)?;
                let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));
                let report = status_report(&paths, max_age)?;
                print_status(&report, OutputFormat::resolve(*format))
            }
        }
    }
}

impl AppendEntry {
    fn execute(&self, env: &CoordinationEnv) -> Result<()> {
        match self {
            AppendEntry::Graph { event, project } => {
                let mut event = parse_graph_event(event)?;
                if event.timestamp.is_none() {
                    event = GraphEvent::now(event.mutation);
                }
                let paths = project.paths(env)?;
                JsonlQueue::<GraphEvent>::new(paths.graph_queue()).append(&event)
            }
            AppendEntry::Memory {
                text,
                user_id,
                agent_id,
                metadata,
                project,
            } => {
                let record = build_memory_record(text, user_id, agent_id.as_deref(), metadata.as_deref())?;
                let paths = project.paths(env)?;
                JsonlQueue::<MemoryRecord>::new(paths.memory_queue()).append(&record)
            }
        }
    }
}

fn parse_graph_event(json: &str) -> Result<GraphEvent> {
    serde_json::from_str(json).map_err(|e| {
        ExitError::InvalidEntry {
            kind: GraphEvent::KIND,
            message: e.to_string(),
        }
        .into()
    })
}

fn build_memory_record(
    text: &str,
    user_id: &str,
    agent_id: Option<&str>,
    metadata: Option<&str>,
) -> Result<MemoryRecord> {
    let invalid = |message: String| ExitError::InvalidEntry {
        kind: MemoryRecord::KIND,
        message,
    };

    let metadata = match metadata {
        None => Value::Null,
        Some(raw) => {
            let value: Value =
                serde_json::from_str(raw).map_err(|e| invalid(format!("metadata: {e}")))?;
            if !value.is_object() {
                return Err(invalid("metadata must be a JSON object".into()).into());
            }
            value
        }
    };

    let record = MemoryRecord {
        agent_id: agent_id.map(String::from),
        metadata,
        ..MemoryRecord::new(text, user_id)
    };
    if !record.is_valid() {
        return Err(invalid("text and user id must be non-empty".into()).into());
    }
    Ok(record)
}

/// Claim, merge, emit, then retire. Claimed batches are only retired after
/// the merged result was written out; a failed run leaves them for the next
/// one. Returns the number of merged items.
pub fn sync_queue(
    kind: QueueKind,
    paths: &ProjectPaths,
    retire: Retire,
    output: Option<&Path>,
) -> Result<usize> {
    match kind {
        QueueKind::Graph => {
            let queue = JsonlQueue::<GraphEvent>::new(paths.graph_queue());
            let (events, batches) = take(&queue, retire)?;
            let snapshot = graph::aggregate(&events);
            let merged = snapshot.entities.len() + snapshot.relations.len() + snapshot.observations.len();
            emit(&snapshot, output)?;
            finish(&queue, &batches, retire, &paths.archive_dir())?;
            Ok(merged)
        }
        QueueKind::Memory => {
            let queue = JsonlQueue::<MemoryRecord>::new(paths.memory_queue());
            let (records, batches) = take(&queue, retire)?;
            let records = memory::deduplicate(records);
            let merged = records.len();
            emit(&json!({ "memories": records }), output)?;
            finish(&queue, &batches, retire, &paths.archive_dir())?;
            Ok(merged)
        }
    }
}

fn queue_error(path: &Path, err: &anyhow::Error) -> anyhow::Error {
    ExitError::Queue {
        path: path.display().to_string(),
        message: format!("{err:#}"),
    }
    .into()
}

/// Kept queues are read in place; otherwise the live file is claimed.
fn take<T: QueueRecord>(queue: &JsonlQueue<T>, retire: Retire) -> Result<(Vec<T>, Vec<PathBuf>)> {
    let taken = if retire == Retire::Keep {
        queue.peek().map(|records| (records, Vec::new()))
    } else {
        queue.drain().map(|d| (d.records, d.batches))
    };
    taken.map_err(|e| queue_error(queue.path(), &e))
}

fn emit<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::write(path, body + "\n").with_context(|| format!("writing {}", path.display()))
        }
        None => {
            println!("{body}");
            Ok(())
        }
    }
}

fn finish<T: QueueRecord>(
    queue: &JsonlQueue<T>,
    batches: &[PathBuf],
    retire: Retire,
    archive_dir: &Path,
) -> Result<()> {
    let result = match retire {
        Retire::Clear => queue.finish(batches, None),
        Retire::Archive => queue.finish(batches, Some(archive_dir)),
        Retire::Keep => Ok(()),
    };
    result.map_err(|e| queue_error(queue.path(), &e))
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub queue: &'static str,
    pub path: String,
    pub exists: bool,
    #[serde(flatten)]
    pub stats: QueueStats,
    /// Claimed batches left by a sync that did not finish.
    pub pending: usize,
    pub stale: bool,
}

fn status_for<T: QueueRecord>(kind: QueueKind, paths: &ProjectPaths, max_age: Duration) -> Result<QueueStatus> {
    let queue = JsonlQueue::<T>::new(kind.path(paths));
    let to_exit = |e: anyhow::Error| queue_error(queue.path(), &e);
    Ok(QueueStatus {
        queue: kind.name(),
        path: queue.path().display().to_string(),
        exists: queue.exists(),
        stats: queue.stats().map_err(to_exit)?,
        pending: queue.pending().map_err(to_exit)?,
        stale: queue.is_stale(max_age),
    })
}

pub fn status_report(paths: &ProjectPaths, max_age: Duration) -> Result<Vec<QueueStatus>> {
    Ok(vec![
        status_for::<GraphEvent>(QueueKind::Graph, paths, max_age)?,
        status_for::<MemoryRecord>(QueueKind::Memory, paths, max_age)?,
    ])
}

fn print_status(report: &[QueueStatus], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            for s in report {
                println!(
                    "queue  name={}  exists={}  lines={}  valid={}  pending={}  stale={}",
                    s.queue, s.exists, s.stats.lines, s.stats.valid, s.pending, s.stale
                );
            }
        }
        OutputFormat::Pretty => {
            println!("=== Queues ===\n");
            for s in report {
                if s.pending > 0 {
                    println!("{}: {} unfinished sync batch(es)", s.queue, s.pending);
                }
                if !s.exists {
                    println!("{}: empty", s.queue);
                    continue;
                }
                let stale = if s.stale { " (STALE)" } else { "" };
                println!(
                    "{}: {} line(s), {} valid{stale}\n  {}",
                    s.queue, s.stats.lines, s.stats.valid, s.path
                );
            }
        }
    }
    Ok(())
}
