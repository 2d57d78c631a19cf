use std::process::ExitCode;

use clap::{Parser, Subcommand};

use ork::commands::hooks::HooksCommand;
use ork::commands::instances::InstancesArgs;
use ork::commands::queue::QueueCommand;
use ork::config::CoordinationEnv;
use ork::{commands, error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "ork",
    version,
    about = "Multi-instance coordination and queue processing for agent hooks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Inspect hook overrides and run built-in hooks
    Hooks {
        #[command(subcommand)]
        command: HooksCommand,
    },
    /// List live agent instances from the heartbeat directory
    Instances(InstancesArgs),
    /// Append to, sync, and inspect the knowledge queues
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Print the JSON Schema for the hook overrides file
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Hooks { .. } => "hooks",
            Self::Instances(_) => "instances",
            Self::Queue { .. } => "queue",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();
    let env = CoordinationEnv::from_env();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Hooks { command } => command.execute(&env),
        Commands::Instances(args) => args.execute(&env),
        Commands::Queue { command } => command.execute(&env),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
