//! Supervisor service: process liveness and crash recovery.
//!
//! Every service process (workers, dispatchers, schedulers, the supervisor
//! itself) maintains a heartbeat on its process row. The supervisor
//! periodically sweeps for rows whose heartbeat is older than the liveness
//! threshold, returns the dead process's claimed jobs to Ready, and deletes
//! the row. That sweep is what turns worker crashes into at-least-once
//! delivery instead of lost jobs.
//!
//! A job reclaimed this way may already have executed (the worker died after
//! the work, before reporting); handlers must tolerate re-execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::store::{ExecutionStore, ProcessId, ProcessKind, ProcessRecord, ReapOutcome};

// ═══════════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Running totals for one supervisor.
#[derive(Debug, Clone, Default)]
pub struct SupervisorStats {
    reaped_processes: Arc<AtomicU64>,
    reclaimed_jobs: Arc<AtomicU64>,
}

impl SupervisorStats {
    pub fn reaped_processes(&self) -> u64 {
        self.reaped_processes.load(Ordering::Relaxed)
    }

    pub fn reclaimed_jobs(&self) -> u64 {
        self.reclaimed_jobs.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Supervisor
// ═══════════════════════════════════════════════════════════════════════════════

/// Background service owning process registration hygiene and the
/// Claimed -> Ready reclamation path for dead processes.
pub struct Supervisor {
    store: Arc<dyn ExecutionStore>,
    config: SupervisorConfig,
    process_id: ProcessId,
    stats: SupervisorStats,
}

impl Supervisor {
    pub fn new(store: Arc<dyn ExecutionStore>, config: SupervisorConfig) -> Self {
        Self {
            store,
            config,
            process_id: ProcessId::new(),
            stats: SupervisorStats::default(),
        }
    }

    /// The supervisor's own process id, for linking child process records.
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Handle to the running totals (shared with the service loop).
    pub fn stats(&self) -> SupervisorStats {
        self.stats.clone()
    }

    /// One reaper pass at `now`: sweep dead processes, reclaim their claimed
    /// jobs, publish queue-depth gauges. Exposed for deterministic ticking
    /// in tests and embedded setups.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReapOutcome> {
        let threshold = crate::config::to_chrono(self.config.liveness_threshold);
        let outcome = self.store.reap_dead_processes(threshold, now).await?;

        // jobs_reclaimed can be nonzero on its own when an orphaned claim
        // (owner has no Process row) ages past the threshold.
        if outcome.processes_reaped > 0 || outcome.jobs_reclaimed > 0 {
            self.stats
                .reaped_processes
                .fetch_add(outcome.processes_reaped as u64, Ordering::Relaxed);
            self.stats
                .reclaimed_jobs
                .fetch_add(outcome.jobs_reclaimed as u64, Ordering::Relaxed);
            counter!("flywheel_reaped_processes_total").increment(outcome.processes_reaped as u64);
            counter!("flywheel_reclaimed_jobs_total").increment(outcome.jobs_reclaimed as u64);
            tracing::warn!(
                processes_reaped = outcome.processes_reaped,
                jobs_reclaimed = outcome.jobs_reclaimed,
                "Reaped dead or vanished processes"
            );
        }

        self.publish_depth_gauges().await?;
        Ok(outcome)
    }

    /// Publish per-queue depth gauges from the current counts.
    async fn publish_depth_gauges(&self) -> Result<()> {
        let counts = self.store.counts().await?;
        for (queue, states) in &counts.by_queue {
            gauge!("flywheel_queue_depth", "queue" => queue.clone(), "state" => "ready")
                .set(states.ready as f64);
            gauge!("flywheel_queue_depth", "queue" => queue.clone(), "state" => "claimed")
                .set(states.claimed as f64);
            gauge!("flywheel_queue_depth", "queue" => queue.clone(), "state" => "blocked")
                .set(states.blocked as f64);
            gauge!("flywheel_queue_depth", "queue" => queue.clone(), "state" => "scheduled")
                .set(states.scheduled as f64);
            gauge!("flywheel_queue_depth", "queue" => queue.clone(), "state" => "failed")
                .set(states.failed as f64);
        }
        Ok(())
    }

    /// Run the reaper loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut process = ProcessRecord::new(ProcessKind::Supervisor, Utc::now());
        process.id = self.process_id;
        self.store.register_process(process.clone()).await?;

        tracing::info!(
            process_id = %self.process_id,
            liveness_threshold = ?self.config.liveness_threshold,
            reap_interval = ?self.config.reap_interval,
            "Supervisor started"
        );

        let mut reap = tokio::time::interval(self.config.reap_interval);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reap.tick() => {
                    if let Err(error) = self.run_once(Utc::now()).await {
                        error.observe();
                    }
                }
                _ = heartbeat.tick() => {
                    match self.store.heartbeat(self.process_id, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(process_id = %self.process_id, "Supervisor process row missing; re-registering");
                            process.last_heartbeat_at = Utc::now();
                            self.store.register_process(process.clone()).await?;
                        }
                        Err(error) => error.observe(),
                    }
                }
            }
        }

        self.store
            .deregister_process(self.process_id, Utc::now())
            .await?;
        tracing::info!(process_id = %self.process_id, "Supervisor stopped");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
