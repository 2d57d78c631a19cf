use std::process::ExitCode;

/// Errors that cause ork to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid {kind} queue entry: {message}")]
    InvalidEntry { kind: &'static str, message: String },

    #[error("queue {path}: {message}")]
    Queue { path: String, message: String },

    #[error("hook '{0}' is disabled")]
    HookDisabled(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::HookDisabled(_) | ExitError::Other(_) => ExitCode::from(1),
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::InvalidEntry { .. } => ExitCode::from(3),
            ExitError::Queue { .. } => ExitCode::from(4),
        }
    }
}
