use async_trait::async_trait;
use chrono::Utc;
use croner::Cron;
use log::{error, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::PostgresError;

/// Work fired on every occurrence of a schedule.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(&self);

    /// Identifies what the job does, so a changed job replaces its schedule
    /// even when the expression stays the same.
    fn fingerprint(&self) -> String {
        String::new()
    }
}

struct Entry {
    expression: String,
    fingerprint: String,
    handle: JoinHandle<()>,
}

/// Process-wide registry of backup schedules, at most one per cluster.
#[derive(Default)]
pub struct BackupScheduler {
    jobs: Mutex<HashMap<String, Entry>>,
}

impl BackupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Parses a five field cron expression.
    pub fn parse(expression: &str) -> Result<Cron, PostgresError> {
        Cron::new(expression)
            .parse()
            .map_err(|e| PostgresError::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            })
    }

    /// Schedules `job` for a cluster, replacing any schedule it already had.
    pub fn schedule(
        &self,
        cluster_id: &str,
        expression: &str,
        job: Arc<dyn ScheduledJob>,
    ) -> Result<(), PostgresError> {
        let cron = Self::parse(expression)?;
        let fingerprint = job.fingerprint();
        let label = cluster_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = match cron.find_next_occurrence(&now, false) {
                    Ok(next) => next,
                    Err(e) => {
                        error!("no further backup occurrence for {label}: {e}");
                        break;
                    }
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                info!("Triggering scheduled backup for {label}");
                let job = job.clone();
                tokio::spawn(async move { job.run().await });
            }
        });

        let previous = self.lock().insert(
            cluster_id.to_string(),
            Entry {
                expression: expression.to_string(),
                fingerprint,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
            info!("Replaced backup schedule of {cluster_id} ({} -> {expression})", previous.expression);
        } else {
            info!("Scheduled backups of {cluster_id} at {expression}");
        }
        Ok(())
    }

    /// Removes a cluster's schedule; returns whether there was one.
    pub fn cancel(&self, cluster_id: &str) -> bool {
        match self.lock().remove(cluster_id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, cluster_id: &str) -> bool {
        self.lock().contains_key(cluster_id)
    }

    /// Whether the cluster is scheduled at `expression` with a job matching `job`.
    pub fn is_current(&self, cluster_id: &str, expression: &str, job: &dyn ScheduledJob) -> bool {
        self.lock().get(cluster_id).is_some_and(|entry| {
            entry.expression == expression && entry.fingerprint == job.fingerprint()
        })
    }

    /// Cluster ids with their cron expressions, sorted by id.
    pub fn scheduled(&self) -> Vec<(String, String)> {
        let mut scheduled: Vec<(String, String)> = self
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.expression.clone()))
            .collect();
        scheduled.sort();
        scheduled
    }

    pub fn shutdown(&self) {
        for (_, entry) in self.lock().drain() {
            entry.handle.abort();
        }
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
