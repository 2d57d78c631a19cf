use schemars::schema_for;

use crate::config::OverrideConfig;

/// Print the JSON Schema for `.claude/hook-overrides.json` to stdout.
pub fn run_schema() -> anyhow::Result<()> {
    let schema = schema_for!(OverrideConfig);
    let json = serde_json::to_string_pretty(&schema)?;
    println!("{json}");
    Ok(())
}
