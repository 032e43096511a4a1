use metastore::StoreError;
use monitor::MonitorError;
use postgres::PostgresError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("engine type {0:?} is not supported")]
    UnsupportedEngine(String),

    #[error("cluster {0} not found")]
    NotFound(String),

    #[error("no free port in {0}")]
    NoFreePort(String),

    #[error(transparent)]
    Provision(#[from] PostgresError),

    #[error("{step}: {source}")]
    Store {
        step: String,
        #[source]
        source: StoreError,
    },

    #[error("monitoring: {0}")]
    Monitor(#[from] MonitorError),
}

impl ServiceError {
    pub(crate) fn store(step: impl Into<String>) -> impl FnOnce(StoreError) -> Self {
        let step = step.into();
        move |source| ServiceError::Store { step, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }
}
