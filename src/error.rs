use thiserror::Error;

pub type ShrinkResult<T> = Result<T, ShrinkError>;

#[derive(Error, Debug)]
pub enum ShrinkError {
    #[error("{operation} of {resource} timed out after {attempts} attempts")]
    TimedOut {
        operation: &'static str,
        resource: String,
        attempts: u32,
    },

    #[error("command `{command}` failed ({status}): {stderr}")]
    Tooling {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("cloud call {operation} failed: {message}")]
    Cloud { operation: String, message: String },

    #[error("boot loader: {0}")]
    BootLoader(String),

    #[error("unexpected tool output: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("instance metadata request failed: {0}")]
    Metadata(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse JSON output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse status of a single operation, used by callers to branch without
/// inspecting error details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Ok,
    TimedOut,
    ToolingFailed,
}

impl ShrinkError {
    pub fn outcome(&self) -> OpOutcome {
        match self {
            ShrinkError::TimedOut { .. } => OpOutcome::TimedOut,
            _ => OpOutcome::ToolingFailed,
        }
    }

    pub fn cloud(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ShrinkError::Cloud {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl OpOutcome {
    pub fn of<T>(result: &ShrinkResult<T>) -> Self {
        match result {
            Ok(_) => OpOutcome::Ok,
            Err(err) => err.outcome(),
        }
    }
}
