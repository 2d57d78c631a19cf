//! Flat memory-record queue and near-duplicate collapsing.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::QueueRecord;

/// One line of the memory queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(default)]
    pub text: String,
    /// Owner scope the memory is filed under.
    #[serde(default, alias = "userId")]
    pub user_id: String,
    #[serde(default, alias = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// Unreadable timestamps read as `None`; the record itself is kept.
    #[serde(default, alias = "queuedAt", deserialize_with = "lenient_timestamp")]
    pub queued_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    pub fn new(text: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            agent_id: None,
            metadata: Value::Null,
            queued_at: Some(Utc::now()),
        }
    }

    /// Trimmed, case-folded text.
    pub fn dedup_key(&self) -> String {
        self.text.trim().to_lowercase()
    }
}

impl QueueRecord for MemoryRecord {
    const KIND: &'static str = "memory";

    fn is_valid(&self) -> bool {
        !self.text.trim().is_empty() && !self.user_id.trim().is_empty()
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(|v| parse_timestamp(&v))
}

/// Accepts RFC 3339, ISO 8601 without an offset (taken as UTC), and epoch
/// seconds as an integer or float.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(secs) => DateTime::from_timestamp(secs, 0),
            #[allow(clippy::cast_possible_truncation)]
            None => DateTime::from_timestamp_millis((n.as_f64()? * 1000.0).round() as i64),
        },
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

/// Read the memory queue at `path`, dropping invalid records.
pub fn read_queue(path: &Path) -> Result<Vec<MemoryRecord>> {
    super::read_lines(path)
}

/// Collapse records sharing a [`MemoryRecord::dedup_key`].
///
/// A later record replaces the stored one only when its `queued_at` is
/// strictly later; the replacement is whole, nothing is merged. Output keeps
/// the order in which keys were first seen.
pub fn deduplicate(records: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<MemoryRecord> = Vec::new();

    for record in records {
        let key = record.dedup_key();
        match index.get(&key) {
            Some(&idx) => {
                if record.queued_at > out[idx].queued_at {
                    out[idx] = record;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(record);
            }
        }
    }
    out
}
