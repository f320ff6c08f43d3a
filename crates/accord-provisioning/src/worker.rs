//! Provisioning Worker
//!
//! Background loop that drives the engine on a poll interval and periodically
//! returns abandoned claims to the queue.

use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use accord_core::{AccordError, Result, TaskStore};

use crate::engine::ProvisioningEngine;

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// How often to poll for due tasks (in milliseconds).
    pub poll_interval_ms: u64,

    /// How often to look for stale claims (in seconds).
    pub stale_release_interval_secs: u64,

    /// Age after which a claim without an outcome is considered abandoned
    /// (in seconds).
    pub stale_after_secs: u64,
}

impl WorkerConfig {
    /// Reject a stale threshold that could release a claim whose connector
    /// call may still be running
    pub fn validate(&self, operation_timeout: Duration) -> Result<()> {
        let stale_after = Duration::from_secs(self.stale_after_secs);
        if stale_after <= operation_timeout {
            return Err(AccordError::config_error(format!(
                "stale_after_secs ({}s) must exceed the operation timeout ({}ms)",
                self.stale_after_secs,
                operation_timeout.as_millis()
            )));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            stale_release_interval_secs: 60,
            stale_after_secs: 300,
        }
    }
}

pub struct ProvisioningWorker<S>
where
    S: TaskStore,
{
    engine: Arc<ProvisioningEngine<S>>,
    config: WorkerConfig,
    shutdown: AtomicBool,
    wake: Notify,
}

impl<S> ProvisioningWorker<S>
where
    S: TaskStore + 'static,
{
    pub fn new(engine: Arc<ProvisioningEngine<S>>, config: WorkerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Run until [`shutdown`](Self::shutdown) is requested. A batch that is
    /// in flight when shutdown arrives runs to completion first.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            concurrency = self.engine.settings().concurrency,
            "Starting provisioning worker"
        );

        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stale_interval =
            interval(Duration::from_secs(self.config.stale_release_interval_secs.max(1)));
        stale_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.is_shutdown() {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = poll_interval.tick() => {
                    if let Err(e) = self.engine.run_once().await {
                        error!(error = %e, "Provisioning batch failed");
                    }
                }
                _ = stale_interval.tick() => {
                    self.release_stale_claims().await;
                }
            }
        }

        info!("Provisioning worker stopped");
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn release_stale_claims(&self) {
        let stale_after = Duration::from_secs(self.config.stale_after_secs);
        match self.engine.release_stale_claims(stale_after).await {
            Ok(count) if count > 0 => warn!(count, "Released stale task claims"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to release stale task claims"),
        }
    }
}
