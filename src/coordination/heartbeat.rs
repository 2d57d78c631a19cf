use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::{CoordinationEnv, ProjectPaths};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_IDLE: &str = "idle";

/// Records whose last heartbeat is older than this are pruned by any sweep.
pub const STALE_AFTER: TimeDelta = TimeDelta::minutes(5);

/// Fields owned by the registry; callers cannot set these through extras.
const RESERVED_FIELDS: [&str; 4] = ["instance_id", "status", "started_at", "last_heartbeat"];

/// Liveness record for one instance, stored as `<instance-id>.json`.
///
/// Any field the registry doesn't know about lands in `extra` and is written
/// back unchanged on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub instance_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HeartbeatRecord {
    fn new(instance_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            status: STATUS_ACTIVE.to_string(),
            started_at: now,
            last_heartbeat: now,
            extra: Map::new(),
        }
    }

    /// Stale only when strictly older than `threshold`; the boundary itself
    /// counts as alive.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        now.signed_duration_since(self.last_heartbeat) > threshold
    }
}

/// The shared coordination directory.
#[derive(Debug, Clone)]
pub struct HeartbeatRegistry {
    dir: PathBuf,
}

impl HeartbeatRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_project(paths: &ProjectPaths) -> Self {
        Self::new(paths.coordination_dir())
    }

    pub fn record_path(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(instance_id)))
    }

    /// Read one record. Missing or unparseable files read as `None`.
    pub fn load(&self, instance_id: &str) -> Option<HeartbeatRecord> {
        read_record(&self.record_path(instance_id))
    }

    /// Create or update the record for `instance_id`.
    ///
    /// An existing record keeps every field except `status` (forced to
    /// active) and `last_heartbeat` (set to `now`). `extra` is merged on top;
    /// reserved keys in it are ignored.
    pub fn refresh_at(
        &self,
        instance_id: &str,
        extra: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatRecord> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let mut record = match self.load(instance_id) {
            Some(mut existing) => {
                existing.instance_id = instance_id.to_string();
                existing.status = STATUS_ACTIVE.to_string();
                existing.last_heartbeat = now;
                existing
            }
            None => HeartbeatRecord::new(instance_id, now),
        };
        for (key, value) in extra {
            if !RESERVED_FIELDS.contains(&key.as_str()) {
                record.extra.insert(key.clone(), value.clone());
            }
        }

        self.write_record(instance_id, &record)?;
        Ok(record)
    }

    /// Mark an instance idle without touching its heartbeat time.
    pub fn set_status(&self, instance_id: &str, status: &str) -> Result<bool> {
        let Some(mut record) = self.load(instance_id) else {
            return Ok(false);
        };
        record.status = status.to_string();
        self.write_record(instance_id, &record)?;
        Ok(true)
    }

    /// Delete every stale record except `own_id`'s. Returns the ids removed
    /// by this call. Files that fail to parse are left alone, and files that
    /// vanish mid-scan are treated as already handled.
    pub fn sweep_at(&self, own_id: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let own_path = self.record_path(own_id);
        let stale = self
            .scan()?
            .into_iter()
            .filter(|(path, record)| *path != own_path && record.is_stale(now, STALE_AFTER))
            .collect();
        Ok(prune(stale))
    }

    /// All records that are not stale at `now`, oldest start first.
    pub fn live_at(&self, now: DateTime<Utc>) -> Result<Vec<HeartbeatRecord>> {
        let mut live: Vec<HeartbeatRecord> = self
            .scan()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|r| !r.is_stale(now, STALE_AFTER))
            .collect();
        live.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(live)
    }

    /// Parseable records in the directory. A missing directory is empty.
    fn scan(&self) -> Result<Vec<(PathBuf, HeartbeatRecord)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("listing {}", self.dir.display())));
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Some(record) => records.push((path, record)),
                None => tracing::debug!(path = %path.display(), "skipping unreadable heartbeat"),
            }
        }
        Ok(records)
    }

    /// Whole-file rewrite through a temp file so readers never see a
    /// partial record.
    fn write_record(&self, instance_id: &str, record: &HeartbeatRecord) -> Result<()> {
        let path = self.record_path(instance_id);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            file_stem(instance_id),
            std::process::id()
        ));
        let body = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(anyhow::Error::new(e).context(format!("renaming to {}", path.display())));
        }
        Ok(())
    }
}

/// Delete the given records. Files already gone were pruned by a peer and
/// are not reported.
fn prune(stale: Vec<(PathBuf, HeartbeatRecord)>) -> Vec<String> {
    let mut pruned = Vec::new();
    for (path, record) in stale {
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(instance = %record.instance_id, "pruned stale heartbeat");
                pruned.push(record.instance_id);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not prune heartbeat");
            }
        }
    }
    pruned
}

fn read_record(path: &Path) -> Option<HeartbeatRecord> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Instance ids become file names; anything outside `[A-Za-z0-9._-]` is
/// replaced and a leading dot is escaped so records never hide. A rewritten
/// id gets a short hash of the original so distinct ids keep distinct files.
fn file_stem(instance_id: &str) -> String {
    let mut stem: String = instance_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.starts_with('.') {
        stem.insert(0, '_');
    }
    if stem != instance_id {
        let digest = format!("{:x}", Sha256::digest(instance_id.as_bytes()));
        stem.push('-');
        stem.push_str(&digest[..8]);
    }
    stem
}

/// Which instance is calling: explicit id, then the project's registration
/// file, then the session id.
pub fn resolve_instance_id(env: &CoordinationEnv, paths: &ProjectPaths) -> Option<String> {
    if let Some(ref id) = env.instance_id {
        return Some(id.clone());
    }
    if let Some(id) = read_registered_instance(&paths.instance_file()) {
        return Some(id);
    }
    env.session_id.clone()
}

fn read_registered_instance(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&contents).ok()?;
    value["instance_id"]
        .as_str()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
}

/// What a refresh call did. Every variant means "carry on".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Multi-instance mode off, slow work skipped, or no resolvable id.
    Skipped,
    Refreshed {
        instance_id: String,
        pruned: Vec<String>,
    },
    /// A filesystem error was swallowed.
    Failed,
}

/// Refresh this instance's heartbeat and prune stale peers.
///
/// Best effort: never returns an error, and does no filesystem work at all
/// unless multi-instance coordination is enabled.
pub fn refresh(
    env: &CoordinationEnv,
    paths: &ProjectPaths,
    extra: &Map<String, Value>,
) -> HeartbeatOutcome {
    refresh_at(env, paths, extra, Utc::now())
}

pub fn refresh_at(
    env: &CoordinationEnv,
    paths: &ProjectPaths,
    extra: &Map<String, Value>,
    now: DateTime<Utc>,
) -> HeartbeatOutcome {
    if !env.heartbeat_enabled() {
        return HeartbeatOutcome::Skipped;
    }
    let Some(instance_id) = resolve_instance_id(env, paths) else {
        tracing::debug!("no instance id available, skipping heartbeat");
        return HeartbeatOutcome::Skipped;
    };

    let registry = HeartbeatRegistry::for_project(paths);
    let result = registry
        .refresh_at(&instance_id, extra, now)
        .and_then(|_| registry.sweep_at(&instance_id, now));

    match result {
        Ok(pruned) => HeartbeatOutcome::Refreshed {
            instance_id,
            pruned,
        },
        Err(e) => {
            tracing::warn!(instance = %instance_id, "heartbeat refresh failed: {e:#}");
            HeartbeatOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn extras(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn multi_env(id: &str) -> CoordinationEnv {
        CoordinationEnv {
            multi_instance: true,
            instance_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn first_refresh_creates_active_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path().join("hb"));

        let record = registry
            .refresh_at("inst-a", &extras(json!({"task": "fix parser"})), ts(0))
            .unwrap();
        assert_eq!(record.status, STATUS_ACTIVE);
        assert_eq!(record.started_at, ts(0));
        assert_eq!(record.last_heartbeat, ts(0));
        assert_eq!(record.extra["task"], "fix parser");
        assert_eq!(registry.load("inst-a"), Some(record));
    }

    #[test]
    fn repeated_refresh_only_advances_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        let extra = extras(json!({"task": "review", "branch": "feat/x"}));

        let first = registry.refresh_at("inst-a", &extra, ts(0)).unwrap();
        let second = registry.refresh_at("inst-a", &extra, ts(10)).unwrap();

        assert_eq!(first.extra, second.extra);
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(second.last_heartbeat, ts(10));
    }

    #[test]
    fn refresh_preserves_unknown_fields_and_forces_active() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        let on_disk = json!({
            "instance_id": "inst-a",
            "status": "idle",
            "started_at": "2023-11-14T22:13:20Z",
            "last_heartbeat": "2023-11-14T22:13:20Z",
            "capabilities": ["backend", {"nested": [1, 2, 3]}],
            "worktree": "/tmp/wt-a"
        });
        fs::write(registry.record_path("inst-a"), on_disk.to_string()).unwrap();

        let record = registry.refresh_at("inst-a", &Map::new(), ts(30)).unwrap();
        assert_eq!(record.status, STATUS_ACTIVE);
        assert_eq!(record.last_heartbeat, ts(30));
        assert_eq!(record.started_at, ts(0));
        assert_eq!(record.extra["capabilities"], on_disk["capabilities"]);
        assert_eq!(record.extra["worktree"], "/tmp/wt-a");
    }

    #[test]
    fn extras_cannot_override_reserved_fields() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        let record = registry
            .refresh_at("inst-a", &extras(json!({"status": "idle", "started_at": 5})), ts(0))
            .unwrap();
        assert_eq!(record.status, STATUS_ACTIVE);
        assert!(record.extra.is_empty());

        let text = fs::read_to_string(registry.record_path("inst-a")).unwrap();
        let reparsed: HeartbeatRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed, record);
    }

    #[test]
    fn sweep_boundary_keeps_exactly_five_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        registry.refresh_at("at-boundary", &Map::new(), ts(0)).unwrap();
        registry.refresh_at("just-past", &Map::new(), ts(-1)).unwrap();
        registry.refresh_at("me", &Map::new(), ts(300)).unwrap();

        let pruned = registry.sweep_at("me", ts(300)).unwrap();
        assert_eq!(pruned, vec!["just-past".to_string()]);
        assert!(registry.load("at-boundary").is_some());
        assert!(!registry.record_path("just-past").exists());
    }

    #[test]
    fn sweep_never_prunes_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        registry.refresh_at("me", &Map::new(), ts(0)).unwrap();

        let pruned = registry.sweep_at("me", ts(10_000)).unwrap();
        assert!(pruned.is_empty());
        assert!(registry.load("me").is_some());
    }

    #[test]
    fn sweep_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        registry.refresh_at("old", &Map::new(), ts(0)).unwrap();

        let pruned = registry.sweep_at("me", ts(3600)).unwrap();
        assert_eq!(pruned, vec!["old".to_string()]);
        assert!(dir.path().join("broken.json").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn sweep_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path().join("absent"));
        assert!(registry.sweep_at("me", ts(0)).unwrap().is_empty());
        assert!(registry.live_at(ts(0)).unwrap().is_empty());
    }

    #[test]
    fn live_lists_only_fresh_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        registry.refresh_at("b", &Map::new(), ts(100)).unwrap();
        registry.refresh_at("a", &Map::new(), ts(50)).unwrap();
        registry.refresh_at("gone", &Map::new(), ts(-1000)).unwrap();

        let live: Vec<String> = registry
            .live_at(ts(120))
            .unwrap()
            .into_iter()
            .map(|r| r.instance_id)
            .collect();
        assert_eq!(live, vec!["a", "b"]);
    }

    #[test]
    fn set_status_keeps_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        registry.refresh_at("a", &Map::new(), ts(0)).unwrap();

        assert!(registry.set_status("a", STATUS_IDLE).unwrap());
        let record = registry.load("a").unwrap();
        assert_eq!(record.status, STATUS_IDLE);
        assert_eq!(record.last_heartbeat, ts(0));
        assert!(!registry.set_status("missing", STATUS_IDLE).unwrap());
    }

    #[test]
    fn file_stem_sanitizes_ids() {
        assert_eq!(file_stem("inst-1"), "inst-1");
        assert_eq!(file_stem("a_b"), "a_b");
        assert!(file_stem("a/b c").starts_with("a_b_c-"));
        assert!(file_stem("../x").starts_with("_.._x-"));
        assert!(file_stem("").starts_with("_-"));
        assert!(!file_stem("a/b").contains('/'));
    }

    #[test]
    fn sanitized_ids_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        assert_ne!(registry.record_path("a/b"), registry.record_path("a_b"));
        assert_ne!(registry.record_path("a/b"), registry.record_path("a b"));

        registry.refresh_at("a/b", &extras(json!({"task": "one"})), ts(0)).unwrap();
        registry.refresh_at("a_b", &extras(json!({"task": "two"})), ts(0)).unwrap();
        assert_eq!(registry.load("a/b").unwrap().extra["task"], "one");
        assert_eq!(registry.load("a_b").unwrap().extra["task"], "two");
    }

    #[test]
    fn record_vanishing_before_removal_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        registry.refresh_at("old", &Map::new(), ts(0)).unwrap();

        let stale = registry.scan().unwrap();
        assert_eq!(stale.len(), 1);
        // A peer's sweep gets there first.
        let peer = HeartbeatRegistry::new(dir.path());
        assert_eq!(peer.sweep_at("peer", ts(3600)).unwrap(), vec!["old".to_string()]);

        assert!(prune(stale).is_empty());
        assert!(registry.sweep_at("me", ts(3600)).unwrap().is_empty());
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HeartbeatRegistry::new(dir.path());
        // A directory where the record should go makes the rename fail.
        fs::create_dir(registry.record_path("blocked")).unwrap();
        fs::write(registry.record_path("blocked").join("keep"), "x").unwrap();

        assert!(registry.refresh_at("blocked", &Map::new(), ts(0)).is_err());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn refresh_is_noop_without_multi_instance() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let env = CoordinationEnv {
            instance_id: Some("a".into()),
            ..Default::default()
        };
        assert_eq!(refresh(&env, &paths, &Map::new()), HeartbeatOutcome::Skipped);
        assert!(!paths.coordination_dir().exists());
    }

    #[test]
    fn refresh_is_noop_when_skipping_slow_work() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let env = CoordinationEnv {
            skip_slow: true,
            ..multi_env("a")
        };
        assert_eq!(refresh(&env, &paths, &Map::new()), HeartbeatOutcome::Skipped);
        assert!(!paths.coordination_dir().exists());
    }

    #[test]
    fn refresh_writes_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let registry = HeartbeatRegistry::for_project(&paths);
        registry.refresh_at("peer", &Map::new(), ts(0)).unwrap();

        let outcome = refresh_at(&multi_env("me"), &paths, &Map::new(), ts(301));
        assert_eq!(
            outcome,
            HeartbeatOutcome::Refreshed {
                instance_id: "me".into(),
                pruned: vec!["peer".into()],
            }
        );
        assert!(registry.load("me").is_some());
    }

    #[test]
    fn refresh_swallows_filesystem_errors() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the .claude directory should be makes create_dir_all fail.
        fs::write(dir.path().join(".claude"), "not a directory").unwrap();
        let paths = ProjectPaths::new(dir.path());

        let outcome = refresh(&multi_env("me"), &paths, &Map::new());
        assert_eq!(outcome, HeartbeatOutcome::Failed);
    }

    #[test]
    fn instance_id_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let mut env = CoordinationEnv {
            session_id: Some("session-1".into()),
            ..Default::default()
        };
        assert_eq!(resolve_instance_id(&env, &paths).as_deref(), Some("session-1"));

        fs::create_dir_all(paths.instance_file().parent().unwrap()).unwrap();
        fs::write(paths.instance_file(), r#"{"instance_id": "registered-9"}"#).unwrap();
        assert_eq!(resolve_instance_id(&env, &paths).as_deref(), Some("registered-9"));

        env.instance_id = Some("explicit".into());
        assert_eq!(resolve_instance_id(&env, &paths).as_deref(), Some("explicit"));
    }

    #[test]
    fn instance_id_falls_through_corrupt_registration() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        fs::create_dir_all(paths.instance_file().parent().unwrap()).unwrap();
        fs::write(paths.instance_file(), "garbage").unwrap();
        let env = CoordinationEnv::default();
        assert_eq!(resolve_instance_id(&env, &paths), None);
    }
}
