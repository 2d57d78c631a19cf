use crate::config::OverrideConfig;

use super::run::HEARTBEAT_HOOK;

/// Hooks that stay enabled no matter what the override file says.
///
/// Checked at decision time in [`is_disabled`], never folded into the
/// configurable list.
pub const PROTECTED_HOOKS: [&str; 5] = [
    "pretool/bash/dangerous-command-blocker",
    "pretool/bash/compound-command-validator",
    "pretool/write-edit/file-guard",
    "pretool/write/security-pattern-validator",
    "skill/redact-secrets",
];

pub fn is_protected(name: &str) -> bool {
    PROTECTED_HOOKS.contains(&name)
}

/// Decide whether `name` is disabled for this invocation.
///
/// Only a listed, unprotected name is disabled. A missing config, a missing
/// or malformed `disabled` list, or a protected name all answer `false`.
pub fn is_disabled(name: &str, overrides: Option<&OverrideConfig>) -> bool {
    let Some(config) = overrides else {
        return false;
    };
    if !config.lists_disabled(name) {
        return false;
    }
    !is_protected(name)
}

/// Timeout for `name`: the override if one is configured, else `default_secs`.
pub fn effective_timeout(name: &str, overrides: Option<&OverrideConfig>, default_secs: u64) -> u64 {
    overrides
        .and_then(|c| c.timeouts.get(name).copied())
        .filter(|secs| *secs > 0)
        .unwrap_or(default_secs)
}

/// Claude Code hook event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    SessionStart,
    PostToolUse,
}

impl HookEvent {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HookEvent::SessionStart => "SessionStart",
            HookEvent::PostToolUse => "PostToolUse",
        }
    }
}

/// Hook registry entry
#[derive(Debug, Clone)]
pub struct HookEntry {
    /// Name used on the command line (`ork hooks run <name>`).
    pub name: &'static str,
    /// Name checked against the override file.
    pub qualified_name: &'static str,
    pub events: &'static [HookEvent],
}

/// Hooks this binary can run itself.
pub struct HookRegistry;

impl HookRegistry {
    pub fn all() -> Vec<HookEntry> {
        vec![HookEntry {
            name: "heartbeat",
            qualified_name: HEARTBEAT_HOOK,
            events: &[HookEvent::SessionStart, HookEvent::PostToolUse],
        }]
    }

    pub fn find(name: &str) -> Option<HookEntry> {
        Self::all()
            .into_iter()
            .find(|h| h.name == name || h.qualified_name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_disabling(names: &[&str]) -> OverrideConfig {
        OverrideConfig {
            disabled: Some(names.iter().map(|n| (*n).to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn protected_hooks_cannot_be_disabled() {
        let config = config_disabling(&PROTECTED_HOOKS);
        for name in PROTECTED_HOOKS {
            assert!(!is_disabled(name, Some(&config)), "{name} must stay enabled");
        }
    }

    #[test]
    fn listed_unprotected_hook_is_disabled() {
        let config = config_disabling(&["posttool/audit-logger", "skill/redact-secrets"]);
        assert!(is_disabled("posttool/audit-logger", Some(&config)));
        assert!(!is_disabled("skill/redact-secrets", Some(&config)));
        assert!(!is_disabled("prompt/context-injector", Some(&config)));
    }

    #[test]
    fn missing_config_disables_nothing() {
        assert!(!is_disabled("posttool/audit-logger", None));
        for name in PROTECTED_HOOKS {
            assert!(!is_disabled(name, None));
        }
    }

    #[test]
    fn malformed_disabled_list_disables_nothing() {
        let config = OverrideConfig::parse_json(r#"{"disabled": {"posttool/audit-logger": true}}"#)
            .unwrap();
        assert!(!is_disabled("posttool/audit-logger", Some(&config)));
    }

    #[test]
    fn protection_is_exact_match() {
        let config = config_disabling(&["skill/redact-secrets-extra"]);
        assert!(is_disabled("skill/redact-secrets-extra", Some(&config)));
    }

    #[test]
    fn timeout_override_applies() {
        let config = OverrideConfig::parse_json(r#"{"timeouts": {"stop/auto-save": 90}}"#).unwrap();
        assert_eq!(effective_timeout("stop/auto-save", Some(&config), 30), 90);
        assert_eq!(effective_timeout("other", Some(&config), 30), 30);
        assert_eq!(effective_timeout("stop/auto-save", None, 30), 30);
    }

    #[test]
    fn registry_finds_by_either_name() {
        assert!(HookRegistry::find("heartbeat").is_some());
        assert!(HookRegistry::find(HEARTBEAT_HOOK).is_some());
        assert!(HookRegistry::find("nope").is_none());
    }
}
