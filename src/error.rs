use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Adding dependency of {to} on {from} would create a cycle")]
    Cycle { from: TaskId, to: TaskId },

    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: String,
        to: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Artifact not found: {name} (run {run_id})")]
    ArtifactNotFound { run_id: String, name: String },

    #[error("Producer failed for task {task}: {message}")]
    Producer { task: TaskId, message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Blindness policy error: {0}")]
    Policy(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// Failure taxonomy used by the orchestrator to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Gate returned BLOCK; fix and re-validation nodes get inserted.
    ValidationBlock,
    /// A bundle carried denied content; its consumers halt until regenerated.
    BlindnessViolation,
    /// Structural graph error; the run aborts.
    Structural,
    /// External collaborator failed or timed out; an explicit retry node is inserted.
    ProducerFailure,
    /// A dispute ran out of rounds; terminal for that dispute only.
    DisputeEscalation,
    /// Everything else (IO, serialization, configuration).
    Environment,
}

impl ErrorClass {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClass::Structural | ErrorClass::Environment)
    }
}

impl Error {
    /// Classify an error against the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Cycle { .. }
            | Error::InvalidTransition { .. }
            | Error::TaskNotFound(_)
            | Error::InvariantViolation(_) => ErrorClass::Structural,
            Error::Producer { .. } | Error::Timeout(_) => ErrorClass::ProducerFailure,
            _ => ErrorClass::Environment,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
