//! Periodic background sweep.
//!
//! Event-driven sweeps only run while traffic flows. The maintenance
//! service sweeps the store on a fixed period so idle sessions are reclaimed
//! on quiet bots too.

use crate::session::SessionStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters kept by the maintenance loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceStatus {
    /// Sweeps run since start.
    pub runs: u64,
    /// When the last sweep finished.
    pub last_run: Option<SystemTime>,
    /// Sessions evicted by maintenance sweeps.
    pub evicted_total: u64,
    /// Callback tokens removed by maintenance sweeps.
    pub tokens_removed_total: u64,
}

/// Handle for controlling a running maintenance loop.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
    status: Arc<RwLock<MaintenanceStatus>>,
}

impl MaintenanceHandle {
    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "maintenance task ended abnormally");
        }
    }

    /// Current counters.
    pub async fn status(&self) -> MaintenanceStatus {
        *self.status.read().await
    }
}

/// Sweeps a session store on a fixed period.
#[derive(Debug)]
pub struct MaintenanceService {
    store: Arc<SessionStore>,
    interval: Duration,
    status: Arc<RwLock<MaintenanceStatus>>,
}

impl MaintenanceService {
    /// Create a service for `store`.
    #[must_use]
    pub fn new(store: Arc<SessionStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            status: Arc::new(RwLock::new(MaintenanceStatus::default())),
        }
    }

    /// Spawn the loop on the current runtime.
    #[must_use]
    pub fn start(self) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let status = Arc::clone(&self.status);
        let Self {
            store,
            interval,
            status: loop_status,
        } = self;

        let task = tokio::spawn(async move {
            info!(interval = ?interval, "maintenance started");

            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        Self::run_once(&store, &loop_status).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("maintenance shutting down");
                        break;
                    }
                }
            }
        });

        MaintenanceHandle {
            shutdown_tx,
            task,
            status,
        }
    }

    async fn run_once(store: &SessionStore, status: &RwLock<MaintenanceStatus>) {
        let report = store.sweep_now().await;
        debug!(
            evicted = report.evicted.len(),
            tokens_removed = report.tokens_removed,
            remaining = report.remaining,
            "maintenance sweep"
        );

        let mut s = status.write().await;
        s.runs += 1;
        s.last_run = Some(SystemTime::now());
        s.evicted_total += report.evicted.len() as u64;
        s.tokens_removed_total += report.tokens_removed as u64;
    }
}
