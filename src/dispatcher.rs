//! Dispatcher service: moves due scheduled jobs toward execution and
//! releases blocked jobs when their concurrency key frees up.
//!
//! The dispatcher never executes anything. Each poll it runs two passes over
//! the store: promote due Scheduled rows (through the semaphore when the job
//! has a key), then promote Blocked rows with regained capacity, force-
//! releasing any that sat past their expiry. Multiple dispatchers can run
//! against one store; the batched, atomic store operations keep them from
//! double-moving a job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::config::{DispatcherConfig, SupervisorConfig};
use crate::error::Result;
use crate::store::{
    DispatchOutcome, ExecutionStore, ProcessId, ProcessKind, ProcessRecord, UnblockOutcome,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Running totals for one dispatcher.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    dispatched: Arc<AtomicU64>,
    unblocked: Arc<AtomicU64>,
    force_released: Arc<AtomicU64>,
}

impl DispatcherStats {
    /// Scheduled jobs moved out (to Ready or Blocked).
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Blocked jobs promoted after acquiring capacity.
    pub fn unblocked(&self) -> u64 {
        self.unblocked.load(Ordering::Relaxed)
    }

    /// Blocked jobs force-released past their expiry.
    pub fn force_released(&self) -> u64 {
        self.force_released.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Background service owning the Scheduled -> Ready and Blocked -> Ready
/// transitions.
pub struct Dispatcher {
    store: Arc<dyn ExecutionStore>,
    config: DispatcherConfig,
    supervisor: SupervisorConfig,
    supervisor_id: Option<ProcessId>,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        config: DispatcherConfig,
        supervisor: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            config,
            supervisor,
            supervisor_id: None,
            stats: DispatcherStats::default(),
        }
    }

    /// Link the dispatcher's process record to a supervisor.
    pub fn with_supervisor(mut self, supervisor_id: ProcessId) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    /// Handle to the running totals (shared with the service loop).
    pub fn stats(&self) -> DispatcherStats {
        self.stats.clone()
    }

    /// One dispatch pass at `now`: dispatch due scheduled jobs, then release
    /// blocked ones. Exposed for deterministic ticking in tests and embedded
    /// setups.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<(DispatchOutcome, UnblockOutcome)> {
        let dispatched = self
            .store
            .dispatch_due(self.config.batch_size, now)
            .await?;
        let released = self
            .store
            .release_blocked(self.config.batch_size, now)
            .await?;

        self.stats
            .dispatched
            .fetch_add(dispatched.total() as u64, Ordering::Relaxed);
        self.stats
            .unblocked
            .fetch_add(released.unblocked as u64, Ordering::Relaxed);
        self.stats
            .force_released
            .fetch_add(released.force_released as u64, Ordering::Relaxed);

        counter!("flywheel_dispatched_total", "destination" => "ready")
            .increment(dispatched.to_ready as u64);
        counter!("flywheel_dispatched_total", "destination" => "blocked")
            .increment(dispatched.to_blocked as u64);
        counter!("flywheel_unblocked_total", "mode" => "acquired")
            .increment(released.unblocked as u64);
        counter!("flywheel_unblocked_total", "mode" => "forced")
            .increment(released.force_released as u64);

        if released.force_released > 0 {
            tracing::warn!(
                force_released = released.force_released,
                "Blocked jobs force-released past expiry; check for stuck concurrency keys"
            );
        }
        if dispatched.total() > 0 || released.total() > 0 {
            tracing::debug!(
                to_ready = dispatched.to_ready,
                to_blocked = dispatched.to_blocked,
                unblocked = released.unblocked,
                force_released = released.force_released,
                "Dispatch pass complete"
            );
        }
        Ok((dispatched, released))
    }

    /// Run the polling loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut process = ProcessRecord::new(ProcessKind::Dispatcher, Utc::now());
        if let Some(supervisor_id) = self.supervisor_id {
            process = process.with_supervisor(supervisor_id);
        }
        let process_id = process.id;
        self.store.register_process(process.clone()).await?;

        tracing::info!(
            process_id = %process_id,
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "Dispatcher started"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut heartbeat = tokio::time::interval(self.supervisor.heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(error) = self.run_once(Utc::now()).await {
                        error.observe();
                    }
                }
                _ = heartbeat.tick() => {
                    match self.store.heartbeat(process_id, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // Reaped while alive (e.g. after a long stall);
                            // re-register and keep going.
                            tracing::warn!(process_id = %process_id, "Dispatcher process row missing; re-registering");
                            process.last_heartbeat_at = Utc::now();
                            self.store.register_process(process.clone()).await?;
                        }
                        Err(error) => error.observe(),
                    }
                }
            }
        }

        self.store.deregister_process(process_id, Utc::now()).await?;
        tracing::info!(process_id = %process_id, "Dispatcher stopped");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
