use thiserror::Error;

#[derive(Error, Debug)]
pub enum PostgresError {
    #[error("invalid backup configuration: {0}")]
    InvalidBackupConfig(String),

    #[error("invalid backup schedule {expression}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("container {0} does not exist")]
    ContainerMissing(String),

    #[error("{step}: {source}")]
    Engine {
        step: String,
        #[source]
        source: engine::EngineError,
    },

    #[error("{step}: {source}")]
    Store {
        step: String,
        #[source]
        source: metastore::StoreError,
    },

    #[error("backup storage: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("invalid backup name {0:?}")]
    InvalidBackupName(String),

    #[error("backup {backup} not found in bucket {bucket}")]
    BackupNotFound { backup: String, bucket: String },

    #[error("{original} (cleanup also failed: {cleanup})")]
    CleanupFailed {
        original: Box<PostgresError>,
        cleanup: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PostgresError {
    pub(crate) fn engine(step: impl Into<String>) -> impl FnOnce(engine::EngineError) -> Self {
        let step = step.into();
        move |source| PostgresError::Engine { step, source }
    }

    pub(crate) fn store(step: impl Into<String>) -> impl FnOnce(metastore::StoreError) -> Self {
        let step = step.into();
        move |source| PostgresError::Store { step, source }
    }

    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| PostgresError::Io { context, source }
    }

    /// True for errors caused by the request rather than the environment.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PostgresError::InvalidBackupConfig(_)
                | PostgresError::InvalidSchedule { .. }
                | PostgresError::InvalidBackupName(_)
        )
    }

    /// Engine error behind this one, if any.
    pub fn engine_error(&self) -> Option<&engine::EngineError> {
        match self {
            PostgresError::Engine { source, .. } => Some(source),
            PostgresError::CleanupFailed { original, .. } => original.engine_error(),
            _ => None,
        }
    }
}
