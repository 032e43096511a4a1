use engine::Client;
use log::{error, info};
use monitor::{MonitorError, MonitorRuntime, MonitorSettings, Target};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};

/// Progress of registering one cluster with the monitoring stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Pending,
    Registered,
    Failed(String),
}

impl Registration {
    pub fn is_done(&self) -> bool {
        !matches!(self, Registration::Pending)
    }
}

/// Lazily bootstrapped monitoring stack shared by every cluster.
pub(crate) struct SharedMonitor {
    client: Client,
    settings: MonitorSettings,
    runtime: OnceCell<Arc<MonitorRuntime>>,
}

impl SharedMonitor {
    pub(crate) fn new(client: Client, settings: MonitorSettings) -> Self {
        Self {
            client,
            settings,
            runtime: OnceCell::new(),
        }
    }

    /// Returns the runtime, bootstrapping the stack on first use. A failed
    /// bootstrap is retried by the next caller.
    pub(crate) async fn runtime(&self) -> Result<Arc<MonitorRuntime>, MonitorError> {
        self.runtime
            .get_or_try_init(|| async {
                let runtime = MonitorRuntime::new(self.client.clone(), self.settings.clone());
                runtime.bootstrap().await?;
                Ok::<_, MonitorError>(Arc::new(runtime))
            })
            .await
            .cloned()
    }

    /// Registers `target` in the background and reports progress on the
    /// returned channel.
    pub(crate) fn register(self: &Arc<Self>, target: Target) -> watch::Receiver<Registration> {
        let (tx, rx) = watch::channel(Registration::Pending);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let name = target.container_name.clone();
            let result = match shared.runtime().await {
                Ok(runtime) => runtime.add_target(target).await,
                Err(e) => Err(e),
            };
            let status = match result {
                Ok(()) => {
                    info!("{name} is now monitored");
                    Registration::Registered
                }
                Err(e) => {
                    error!("registering {name} with monitoring failed: {e}");
                    Registration::Failed(e.to_string())
                }
            };
            tx.send_replace(status);
        });
        rx
    }
}
