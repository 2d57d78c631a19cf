use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;

use super::{OutputFormat, ProjectArgs};
use crate::config::{CoordinationEnv, ProjectPaths};
use crate::coordination::{HeartbeatRecord, HeartbeatRegistry, STATUS_IDLE, resolve_instance_id};
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct InstancesArgs {
    #[command(subcommand)]
    pub action: Option<InstancesAction>,
    #[command(flatten)]
    pub project: ProjectArgs,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Subcommand)]
pub enum InstancesAction {
    /// Mark this instance idle until its next heartbeat
    Idle,
}

#[derive(Debug, Serialize)]
pub struct InstancesReport {
    pub current: Option<String>,
    pub instances: Vec<HeartbeatRecord>,
}

impl InstancesArgs {
    pub fn execute(&self, env: &CoordinationEnv) -> anyhow::Result<()> {
        let paths = self.project.paths(env)?;
        match self.action {
            Some(InstancesAction::Idle) => mark_idle(env, &paths),
            None => self.list(env, &paths),
        }
    }

    fn list(&self, env: &CoordinationEnv, paths: &ProjectPaths) -> anyhow::Result<()> {
        let now = Utc::now();
        let report = InstancesReport {
            current: resolve_instance_id(env, paths),
            instances: HeartbeatRegistry::for_project(paths).live_at(now)?,
        };

        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => {
                println!("instances  live={}", report.instances.len());
                for r in &report.instances {
                    let age = (now - r.last_heartbeat).num_seconds();
                    println!(
                        "instance  id={}  status={}  last_seen={age}s",
                        r.instance_id, r.status
                    );
                }
            }
            OutputFormat::Pretty => {
                println!("=== Live Instances ===\n");
                if report.instances.is_empty() {
                    println!("  (none)");
                }
                for r in &report.instances {
                    let age = (now - r.last_heartbeat).num_seconds();
                    let marker = if report.current.as_deref() == Some(r.instance_id.as_str()) {
                        " (this instance)"
                    } else {
                        ""
                    };
                    let task = r.extra.get("task").and_then(|t| t.as_str());
                    match task {
                        Some(task) => println!(
                            "  • {}{marker}: {}, {age}s ago, {task}",
                            r.instance_id, r.status
                        ),
                        None => println!("  • {}{marker}: {}, {age}s ago", r.instance_id, r.status),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Flip this instance's record to idle. The next refresh makes it active again.
fn mark_idle(env: &CoordinationEnv, paths: &ProjectPaths) -> anyhow::Result<()> {
    let Some(instance_id) = resolve_instance_id(env, paths) else {
        return Err(ExitError::Config("no instance id (set CLAUDE_INSTANCE_ID)".into()).into());
    };
    if HeartbeatRegistry::for_project(paths).set_status(&instance_id, STATUS_IDLE)? {
        println!("{instance_id}  {STATUS_IDLE}");
    } else {
        println!("{instance_id}  no heartbeat");
    }
    Ok(())
}
