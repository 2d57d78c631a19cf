use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{CoordinationEnv, OverrideConfig, ProjectPaths};
use crate::coordination::{self, HeartbeatOutcome};

use super::registry::is_disabled;

pub const HEARTBEAT_HOOK: &str = "lifecycle/multi-instance-heartbeat";

/// What a hook prints on stdout for Claude Code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResult {
    #[serde(rename = "continue")]
    pub continue_: bool,
    pub suppress_output: bool,
}

impl HookResult {
    /// Carry on, say nothing.
    pub const fn silent_success() -> Self {
        Self {
            continue_: true,
            suppress_output: true,
        }
    }
}

/// Pull the fields worth keeping on a heartbeat out of the hook's stdin JSON.
pub fn heartbeat_extras(hook_input: Option<&str>) -> Map<String, Value> {
    let mut extras = Map::new();
    let Some(input) = hook_input.and_then(|s| serde_json::from_str::<Value>(s).ok()) else {
        return extras;
    };

    let task = input["task"]
        .as_str()
        .or_else(|| input["current_task"].as_str())
        .filter(|t| !t.trim().is_empty());
    if let Some(task) = task {
        extras.insert("task".into(), Value::String(task.to_string()));
    }
    if let Some(tool) = input["tool_name"].as_str() {
        extras.insert("last_tool".into(), Value::String(tool.to_string()));
    }
    extras
}

/// Run the heartbeat hook: refresh this instance and prune stale peers.
///
/// Always answers "continue"; nothing here may block the tool call it is
/// attached to.
pub fn run_heartbeat(
    env: &CoordinationEnv,
    paths: &ProjectPaths,
    overrides: Option<&OverrideConfig>,
    hook_input: Option<&str>,
) -> HookResult {
    if is_disabled(HEARTBEAT_HOOK, overrides) {
        tracing::debug!("heartbeat hook disabled by overrides");
        return HookResult::silent_success();
    }

    // The hook payload carries the session id even when the environment doesn't.
    let mut env = env.clone();
    if env.session_id.is_none() {
        env.session_id = hook_input
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .and_then(|v| v["session_id"].as_str().map(String::from))
            .filter(|id| !id.trim().is_empty());
    }

    match coordination::refresh(&env, paths, &heartbeat_extras(hook_input)) {
        HeartbeatOutcome::Refreshed {
            instance_id,
            pruned,
        } => {
            tracing::debug!(instance = %instance_id, pruned = pruned.len(), "heartbeat refreshed");
        }
        HeartbeatOutcome::Skipped | HeartbeatOutcome::Failed => {}
    }
    HookResult::silent_success()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::HeartbeatRegistry;

    fn multi_env() -> CoordinationEnv {
        CoordinationEnv {
            multi_instance: true,
            ..Default::default()
        }
    }

    #[test]
    fn hook_result_serializes_for_claude_code() {
        let json = serde_json::to_string(&HookResult::silent_success()).unwrap();
        assert_eq!(json, r#"{"continue":true,"suppressOutput":true}"#);
    }

    #[test]
    fn extras_from_hook_input() {
        let extras = heartbeat_extras(Some(
            r#"{"session_id":"s1","tool_name":"Edit","current_task":"refactor auth"}"#,
        ));
        assert_eq!(extras["task"], "refactor auth");
        assert_eq!(extras["last_tool"], "Edit");
        assert!(!extras.contains_key("session_id"));
    }

    #[test]
    fn extras_tolerate_garbage_input() {
        assert!(heartbeat_extras(Some("not json")).is_empty());
        assert!(heartbeat_extras(None).is_empty());
    }

    #[test]
    fn heartbeat_uses_session_id_from_input() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());

        let result = run_heartbeat(
            &multi_env(),
            &paths,
            None,
            Some(r#"{"session_id":"sess-42","tool_name":"Bash"}"#),
        );
        assert_eq!(result, HookResult::silent_success());

        let record = HeartbeatRegistry::for_project(&paths).load("sess-42").unwrap();
        assert_eq!(record.extra["last_tool"], "Bash");
    }

    #[test]
    fn disabled_heartbeat_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let overrides = OverrideConfig {
            disabled: Some(vec![HEARTBEAT_HOOK.to_string()]),
            ..Default::default()
        };
        let env = CoordinationEnv {
            instance_id: Some("a".into()),
            ..multi_env()
        };

        let result = run_heartbeat(&env, &paths, Some(&overrides), None);
        assert_eq!(result, HookResult::silent_success());
        assert!(!paths.coordination_dir().exists());
    }
}
