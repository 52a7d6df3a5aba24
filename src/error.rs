use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridflowError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job store id: {0}")]
    InvalidJobStoreId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Command `{command}` exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to launch job: {0}")]
    Launch(String),

    #[error("Service manager has quit")]
    ServiceManagerDied,

    #[error("Batch system driver has quit")]
    DriverDied,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GridflowError {
    /// Stderr of a failed external command, if this is one.
    pub fn command_stderr(&self) -> Option<&str> {
        match self {
            GridflowError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GridflowError>;
