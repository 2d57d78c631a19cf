use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Override file name constants, relative to `<project>/.claude/`.
pub const OVERRIDES_TOML: &str = "hook-overrides.toml";
pub const OVERRIDES_JSON: &str = "hook-overrides.json";

/// Environment inputs.
pub const ENV_MULTI_INSTANCE: &str = "CLAUDE_MULTI_INSTANCE";
pub const ENV_SKIP_SLOW: &str = "ORCHESTKIT_SKIP_SLOW_HOOKS";
pub const ENV_INSTANCE_ID: &str = "CLAUDE_INSTANCE_ID";
pub const ENV_SESSION_ID: &str = "CLAUDE_SESSION_ID";
pub const ENV_PROJECT_DIR: &str = "CLAUDE_PROJECT_DIR";

/// Per-project hook overrides.
///
/// `disabled` is `None` when the file omits it or holds something other than
/// a list of strings; nothing is disabled in that case. `timeouts` only keeps
/// positive integer entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OverrideConfig {
    /// Hook names to disable. Protected hooks listed here are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<Vec<String>>,
    /// Per-hook timeout overrides, in seconds.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub timeouts: BTreeMap<String, u64>,
}

impl OverrideConfig {
    /// Build a config from an already-parsed document, dropping malformed
    /// sections individually. Returns `None` if the root is not a table/object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let root = value.as_object()?;

        let disabled = root.get("disabled").and_then(|v| {
            v.as_array()?
                .iter()
                .map(|item| item.as_str().map(String::from))
                .collect::<Option<Vec<_>>>()
        });

        let timeouts = root
            .get("timeouts")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(name, secs)| {
                        secs.as_u64()
                            .filter(|s| *s > 0)
                            .map(|s| (name.clone(), s))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self { disabled, timeouts })
    }

    /// Parse an overrides document in JSON.
    pub fn parse_json(json: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(json).ok()?;
        Self::from_value(&value)
    }

    /// Parse an overrides document in TOML.
    pub fn parse_toml(toml_str: &str) -> Option<Self> {
        let value: Value = toml::from_str(toml_str).ok()?;
        Self::from_value(&value)
    }

    /// Whether `name` appears in the disabled list. This says nothing about
    /// protection; see [`crate::hooks::is_disabled`].
    pub fn lists_disabled(&self, name: &str) -> bool {
        self.disabled
            .as_ref()
            .is_some_and(|list| list.iter().any(|n| n == name))
    }
}

/// Find the override file, preferring TOML over JSON.
/// Returns None if neither exists.
pub fn find_overrides(paths: &ProjectPaths) -> Option<PathBuf> {
    let toml_path = paths.claude_dir().join(OVERRIDES_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = paths.claude_dir().join(OVERRIDES_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Load the project's overrides. Any read or parse failure yields `None`,
/// which callers treat the same as "no overrides".
pub fn load_overrides(paths: &ProjectPaths) -> Option<OverrideConfig> {
    let path = find_overrides(paths)?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "could not read hook overrides");
            return None;
        }
    };
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => OverrideConfig::parse_toml(&contents),
        _ => OverrideConfig::parse_json(&contents),
    };
    if parsed.is_none() {
        tracing::warn!(path = %path.display(), "ignoring malformed hook overrides");
    }
    parsed
}

/// On-disk layout for one project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn claude_dir(&self) -> PathBuf {
        self.root.join(".claude")
    }

    /// One `<instance-id>.json` per live instance.
    pub fn coordination_dir(&self) -> PathBuf {
        self.claude_dir().join("coordination").join("heartbeats")
    }

    /// Written by the session-start hook when an instance registers.
    pub fn instance_file(&self) -> PathBuf {
        self.claude_dir().join(".instance").join("id.json")
    }

    pub fn graph_queue(&self) -> PathBuf {
        self.claude_dir().join("memory").join("graph-queue.jsonl")
    }

    pub fn memory_queue(&self) -> PathBuf {
        self.claude_dir().join("memory").join("mem0-queue.jsonl")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.claude_dir().join("memory").join("archive")
    }
}

/// Snapshot of the environment inputs, taken once per invocation.
#[derive(Debug, Clone, Default)]
pub struct CoordinationEnv {
    pub multi_instance: bool,
    pub skip_slow: bool,
    pub instance_id: Option<String>,
    pub session_id: Option<String>,
    pub project_dir: Option<PathBuf>,
}

impl CoordinationEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing or blank values fall back
    /// to the defaults (multi-instance mode off).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            multi_instance: is_truthy(get(ENV_MULTI_INSTANCE).as_deref()),
            skip_slow: is_truthy(get(ENV_SKIP_SLOW).as_deref()),
            instance_id: get(ENV_INSTANCE_ID),
            session_id: get(ENV_SESSION_ID),
            project_dir: get(ENV_PROJECT_DIR).map(PathBuf::from),
        }
    }

    /// Heartbeats only run in multi-instance sessions that haven't asked to
    /// skip slow work.
    pub const fn heartbeat_enabled(&self) -> bool {
        self.multi_instance && !self.skip_slow
    }
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// Resolve the project root: explicit flag, then `CLAUDE_PROJECT_DIR`, then cwd.
pub fn resolve_project_root(
    explicit: Option<&Path>,
    env: &CoordinationEnv,
) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(ref p) = env.project_dir {
        return Ok(p.clone());
    }
    std::env::current_dir().context("could not determine current directory")
}
