use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("{step}: {source}")]
    Engine {
        step: String,
        #[source]
        source: engine::EngineError,
    },

    #[error("writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("locking {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network {0} has no gateway address")]
    NoGateway(String),

    #[error("monitoring stack has not been bootstrapped")]
    NotBootstrapped,
}

impl MonitorError {
    pub(crate) fn engine(step: impl Into<String>) -> impl FnOnce(engine::EngineError) -> Self {
        let step = step.into();
        move |source| MonitorError::Engine { step, source }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| MonitorError::Io { path, source }
    }
}
