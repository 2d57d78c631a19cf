use std::io::Read;

use anyhow::Result;
use clap::Subcommand;
use serde_json::json;

use super::{OutputFormat, ProjectArgs};
use crate::config::{CoordinationEnv, OverrideConfig, ProjectPaths, find_overrides, load_overrides};
use crate::error::ExitError;
use crate::hooks::{self, HookEntry, HookEvent, HookRegistry, PROTECTED_HOOKS};

/// Hook input from Claude Code is small; cap what we read from stdin.
const MAX_HOOK_INPUT: u64 = 64 * 1024;

#[derive(Debug, Subcommand)]
pub enum HooksCommand {
    /// Report whether a hook is disabled by the project's overrides
    Check {
        /// Hook name (e.g. posttool/audit-logger)
        name: String,
        /// Exit 1 when the hook is disabled
        #[arg(long)]
        exit_code: bool,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// List protected hooks and the project's overrides
    List {
        #[command(flatten)]
        project: ProjectArgs,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Print the effective timeout for a hook, in seconds
    Timeout {
        /// Hook name
        name: String,
        /// Timeout used when no override is configured
        #[arg(long, default_value_t = 60)]
        default: u64,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Run a hook directly (for Claude Code hooks)
    Run {
        /// Hook name (heartbeat)
        hook_name: String,
        #[command(flatten)]
        project: ProjectArgs,
    },
}

impl HooksCommand {
    pub fn execute(&self, env: &CoordinationEnv) -> Result<()> {
        match self {
            HooksCommand::Check {
                name,
                exit_code,
                project,
            } => check_hook(name, *exit_code, &project.paths(env)?),
            HooksCommand::List { project, format } => {
                list_hooks(&project.paths(env)?, OutputFormat::resolve(*format))
            }
            HooksCommand::Timeout {
                name,
                default,
                project,
            } => {
                let overrides = load_overrides(&project.paths(env)?);
                println!("{}", hooks::effective_timeout(name, overrides.as_ref(), *default));
                Ok(())
            }
            HooksCommand::Run { hook_name, project } => run_hook(hook_name, project, env),
        }
    }
}

fn check_hook(name: &str, exit_code: bool, paths: &ProjectPaths) -> Result<()> {
    let overrides = load_overrides(paths);
    let disabled = hooks::is_disabled(name, overrides.as_ref());
    println!("{}", if disabled { "disabled" } else { "enabled" });
    if disabled && exit_code {
        return Err(ExitError::HookDisabled(name.to_string()).into());
    }
    Ok(())
}

/// One configured override and what it actually does.
struct OverrideLine<'a> {
    name: &'a str,
    effect: &'static str,
}

fn classify(overrides: &OverrideConfig) -> Vec<OverrideLine<'_>> {
    overrides
        .disabled
        .iter()
        .flatten()
        .map(|name| OverrideLine {
            name: name.as_str(),
            effect: if hooks::is_protected(name) {
                "ignored"
            } else {
                "disabled"
            },
        })
        .collect()
}

fn event_names(entry: &HookEntry) -> Vec<&'static str> {
    entry.events.iter().map(HookEvent::as_str).collect()
}

fn list_hooks(paths: &ProjectPaths, format: OutputFormat) -> Result<()> {
    let source = find_overrides(paths);
    let overrides = load_overrides(paths).unwrap_or_default();
    let lines = classify(&overrides);
    let builtin = HookRegistry::all();

    match format {
        OutputFormat::Json => {
            let result = json!({
                "overrides_file": source.as_ref().map(|p| p.display().to_string()),
                "builtin": builtin.iter().map(|h| json!({
                    "name": h.name,
                    "qualified_name": h.qualified_name,
                    "events": event_names(h),
                    "disabled": hooks::is_disabled(h.qualified_name, Some(&overrides)),
                })).collect::<Vec<_>>(),
                "protected": PROTECTED_HOOKS,
                "disabled": lines.iter().filter(|l| l.effect == "disabled").map(|l| l.name).collect::<Vec<_>>(),
                "ignored": lines.iter().filter(|l| l.effect == "ignored").map(|l| l.name).collect::<Vec<_>>(),
                "timeouts": &overrides.timeouts,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => {
            for h in &builtin {
                println!(
                    "builtin  {}  {}  events={}",
                    h.name,
                    h.qualified_name,
                    event_names(h).join(",")
                );
            }
            for name in PROTECTED_HOOKS {
                println!("protected  {name}");
            }
            for line in &lines {
                println!("{}  {}", line.effect, line.name);
            }
            for (name, secs) in &overrides.timeouts {
                println!("timeout  {name}={secs}");
            }
        }
        OutputFormat::Pretty => {
            match source {
                Some(ref p) => println!("Overrides: {}", p.display()),
                None => println!("Overrides: none"),
            }
            println!("\nBuilt-in hooks:");
            for h in &builtin {
                println!(
                    "  • {} ({}) on {}",
                    h.name,
                    h.qualified_name,
                    event_names(h).join(", ")
                );
            }
            println!("\nProtected hooks (cannot be disabled):");
            for name in PROTECTED_HOOKS {
                println!("  • {name}");
            }
            if !lines.is_empty() {
                println!("\nDisabled:");
                for line in &lines {
                    if line.effect == "ignored" {
                        println!("  • {} (protected, ignored)", line.name);
                    } else {
                        println!("  • {}", line.name);
                    }
                }
            }
            if !overrides.timeouts.is_empty() {
                println!("\nTimeouts:");
                for (name, secs) in &overrides.timeouts {
                    println!("  • {name}: {secs}s");
                }
            }
        }
    }
    Ok(())
}

fn run_hook(hook_name: &str, project: &ProjectArgs, env: &CoordinationEnv) -> Result<()> {
    let Some(entry) = HookRegistry::find(hook_name) else {
        return Err(ExitError::Config(format!("unknown hook: {hook_name}")).into());
    };

    // Hooks never fail the tool call: fall back to cwd-relative paths.
    let paths = project
        .paths(env)
        .unwrap_or_else(|_| ProjectPaths::new("."));

    let stdin_input = read_hook_input();
    let overrides = load_overrides(&paths);

    let result = match entry.name {
        "heartbeat" => hooks::run_heartbeat(env, &paths, overrides.as_ref(), stdin_input.as_deref()),
        _ => hooks::HookResult::silent_success(),
    };
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn read_hook_input() -> Option<String> {
    use std::io::IsTerminal;
    if std::io::stdin().is_terminal() {
        return None;
    }
    let mut buf = String::new();
    std::io::stdin()
        .take(MAX_HOOK_INPUT)
        .read_to_string(&mut buf)
        .ok();
    if buf.trim().is_empty() { None } else { Some(buf) }
}
