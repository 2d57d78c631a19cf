pub mod hooks;
pub mod instances;
pub mod queue;
pub mod schema;

use std::io::IsTerminal;
use std::path::PathBuf;

use crate::config::{CoordinationEnv, ProjectPaths, resolve_project_root};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Explicit flag, else pretty on a TTY and text otherwise.
    pub fn resolve(explicit: Option<Self>) -> Self {
        explicit.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

/// Shared `--project-root` flag.
#[derive(Debug, Clone, clap::Args)]
pub struct ProjectArgs {
    /// Project root directory (default: $CLAUDE_PROJECT_DIR, then cwd)
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl ProjectArgs {
    pub fn paths(&self, env: &CoordinationEnv) -> anyhow::Result<ProjectPaths> {
        resolve_project_root(self.project_root.as_deref(), env).map(ProjectPaths::new)
    }
}
