//! Runtime lifecycle management including background maintenance and graceful shutdown.

use crate::{cache::CacheScope, config::AppConfig, proxy::RequestOrchestrator};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{builder::RelayRuntimeBuilder, RelayComponents};

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    pub windows_pruned: usize,
    pub active_windows: usize,
    pub cache_entries: usize,
    pub expired_entries: usize,
}

/// Prunes idle rate-limit windows and publishes cache and breaker gauges.
///
/// Expired cache entries are counted but never deleted here.
pub async fn run_maintenance_pass(components: &RelayComponents) -> MaintenanceReport {
    let metrics = components.metrics_collector();

    let windows_pruned = components.rate_limiter().prune_idle();
    let active_windows = components.rate_limiter().window_count();
    metrics.record_rate_limit_windows(active_windows, windows_pruned);

    let stats = components.cache_store().stats(&CacheScope::All);
    metrics.record_cache_stats(stats.entry_count, stats.expired_entries, stats.total_size_bytes);

    for endpoint in components.registry().all_endpoints() {
        let snapshot = endpoint.breaker_snapshot().await;
        metrics.record_circuit_breaker_state(endpoint.id(), snapshot.state, snapshot.failure_count);
    }

    MaintenanceReport {
        windows_pruned,
        active_windows,
        cache_entries: stats.entry_count,
        expired_entries: stats.expired_entries,
    }
}

/// Main runtime container managing component lifecycles and background tasks.
///
/// When `shutdown()` is called, the maintenance task is signalled through the broadcast
/// channel and awaited.
pub struct RelayRuntime {
    components: RelayComponents,
    shutdown_tx: broadcast::Sender<()>,
    config: AppConfig,
    maintenance_task: Option<JoinHandle<()>>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl RelayRuntime {
    #[must_use]
    pub fn builder() -> RelayRuntimeBuilder {
        RelayRuntimeBuilder::new()
    }

    pub(super) fn new(
        components: RelayComponents,
        shutdown_tx: broadcast::Sender<()>,
        config: AppConfig,
        enable_maintenance: bool,
    ) -> Self {
        let maintenance_task = enable_maintenance.then(|| {
            let task = Self::start_maintenance(
                components.clone(),
                config.maintenance_interval(),
                shutdown_tx.subscribe(),
            );
            debug!(
                interval_secs = config.cache.maintenance_interval_seconds,
                "Maintenance task started"
            );
            task
        });

        Self {
            components,
            shutdown_tx,
            config,
            maintenance_task,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn components(&self) -> &RelayComponents {
        &self.components
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<RequestOrchestrator> {
        self.components.orchestrator()
    }

    /// Creates a new shutdown receiver for tasks started outside the runtime.
    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiates graceful shutdown of all background tasks. Safe to call more than once.
    pub async fn shutdown(self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Shutdown already initiated, ignoring duplicate call");
            return;
        }

        info!("Initiating Relay runtime shutdown");
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!(error = %e, "Shutdown signal had no receivers");
        }
        if let Some(task) = self.maintenance_task {
            match task.await {
                Ok(()) => debug!("Maintenance task completed"),
                Err(e) if e.is_cancelled() => debug!("Maintenance task cancelled"),
                Err(e) => error!(error = %e, "Maintenance task failed"),
            }
        }

        info!("Relay runtime shutdown complete");
    }

    fn start_maintenance(
        components: RelayComponents,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Maintenance task received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = run_maintenance_pass(&components).await;
                        debug!(
                            windows_pruned = report.windows_pruned,
                            active_windows = report.active_windows,
                            cache_entries = report.cache_entries,
                            expired_entries = report.expired_entries,
                            "maintenance pass complete"
                        );
                    }
                }
            }
        })
    }
}

const _: () = {
    const fn assert_send<T: Send>() {}
    const fn assert_sync<T: Sync>() {}
    let _ = assert_send::<RelayRuntime>;
    let _ = assert_sync::<RelayRuntime>;
};
