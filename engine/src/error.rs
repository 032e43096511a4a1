use std::time::Duration;
use thiserror::Error;

/// Error type for container engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Another container already uses the requested name
    #[error("container name {0} is already in use")]
    DuplicateContainerName(String),

    /// More than one network carries the requested name; needs an operator
    #[error("found more than one network named {0}")]
    DuplicateNetwork(String),

    #[error("no matching environment variable {0}")]
    NoMatchingEnv(String),

    #[error("container id is empty")]
    EmptyContainerId,

    #[error("container {0} doesn't exist")]
    ContainerNotFound(String),

    /// The engine answered with a not-found status
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine answered with a conflict status
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("command `{command}` exited with code {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i64,
        output: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("engine returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("engine transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Wraps the error with a description of the step that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        EngineError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context layers.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            EngineError::NotFound(_) | EngineError::ContainerNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.root(),
            EngineError::Conflict(_)
                | EngineError::DuplicateContainerName(_)
                | EngineError::DuplicateNetwork(_)
        )
    }

    pub fn is_duplicate_container_name(&self) -> bool {
        matches!(self.root(), EngineError::DuplicateContainerName(_))
    }

    pub fn is_duplicate_network(&self) -> bool {
        matches!(self.root(), EngineError::DuplicateNetwork(_))
    }
}
