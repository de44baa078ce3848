//! Engine facade: one handle over the store, the handler registry, and the
//! background services.
//!
//! An embedded deployment builds a [`Flywheel`], registers handlers, calls
//! [`Flywheel::start`], and submits jobs. `start` spawns four services onto
//! the current Tokio runtime: a supervisor (liveness + crash recovery), a
//! dispatcher (scheduled and blocked promotion), a recurring scheduler
//! (cron-driven submission), and a worker (claim + execute). Additional
//! workers against the same store can be run directly through
//! [`crate::worker::Worker`].
//!
//! All control-plane operations (pause, cancel, retry, counts) go through
//! the engine and work whether or not the services are running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FlywheelConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{FlywheelError, Result};
use crate::job::{ExecutionState, JobId, JobRequest};
use crate::recurring::{RecurringScheduler, RecurringTask};
use crate::registry::HandlerRegistry;
use crate::store::{ExecutionStore, FailedExecution, MemoryStore, QueueCounts};
use crate::supervisor::Supervisor;
use crate::worker::Worker;

/// The queue engine.
pub struct Flywheel {
    config: FlywheelConfig,
    store: Arc<dyn ExecutionStore>,
    registry: Arc<HandlerRegistry>,
    recurring: Arc<DashMap<String, RecurringTask>>,
    shutdown: CancellationToken,
    services: Mutex<Vec<JoinHandle<Result<()>>>>,
    running: AtomicBool,
}

impl Flywheel {
    /// Create an engine over the in-memory store.
    pub fn new(config: FlywheelConfig) -> Self {
        let store = Arc::new(MemoryStore::with_concurrency(config.concurrency.clone()));
        Self::with_store(config, store)
    }

    /// Create an engine over an explicit store implementation.
    pub fn with_store(config: FlywheelConfig, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            config,
            store,
            registry: Arc::new(HandlerRegistry::new()),
            recurring: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            services: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// The handler registry; register job classes here.
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    /// The underlying store, for embedded setups that drive transitions
    /// themselves.
    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.store)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission + job control
    // ─────────────────────────────────────────────────────────────────────────

    /// Submit a job. Returns its id; the job lands in Ready, Scheduled, or
    /// Blocked depending on its schedule and concurrency key.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let queue = request.queue.clone();
        let enqueued = self.store.enqueue(request, Utc::now()).await?;
        counter!("flywheel_submitted_total", "queue" => queue.clone()).increment(1);
        tracing::debug!(
            job_id = %enqueued.job_id,
            queue,
            state = %enqueued.state,
            "Job submitted"
        );
        Ok(enqueued.job_id)
    }

    /// Cancel a job that has not started executing. Returns false when the
    /// job is already claimed, terminal, or unknown.
    pub async fn cancel_if_not_started(&self, job_id: JobId) -> Result<bool> {
        let cancelled = self.store.cancel_if_not_started(job_id, Utc::now()).await?;
        if cancelled {
            counter!("flywheel_cancelled_total").increment(1);
            tracing::info!(job_id = %job_id, "Job cancelled");
        }
        Ok(cancelled)
    }

    /// Resubmit a failed job under its original id.
    pub async fn retry_failed(&self, job_id: JobId) -> Result<bool> {
        let retried = self.store.retry_failed(job_id, Utc::now()).await?;
        if retried {
            counter!("flywheel_retried_total").increment(1);
            tracing::info!(job_id = %job_id, "Failed job resubmitted");
        }
        Ok(retried)
    }

    /// Drop a failed job entirely.
    pub async fn discard_failed(&self, job_id: JobId) -> Result<bool> {
        self.store.discard_failed(job_id).await
    }

    /// List failed executions, oldest first.
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedExecution>> {
        self.store.failed_executions(limit).await
    }

    /// Delete finished job rows older than `older_than`.
    pub async fn prune_finished(&self, older_than: std::time::Duration) -> Result<usize> {
        let pruned = self
            .store
            .prune_finished(crate::config::to_chrono(older_than), Utc::now())
            .await?;
        if pruned > 0 {
            tracing::info!(pruned, "Pruned finished jobs");
        }
        Ok(pruned)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queue control + introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Pause a queue: its jobs stop being promoted and claimed until
    /// resumed. The flag persists in the store.
    pub async fn pause_queue(&self, queue: &str) -> Result<()> {
        self.store.pause_queue(queue).await?;
        tracing::info!(queue, "Queue paused");
        Ok(())
    }

    /// Resume a paused queue.
    pub async fn resume_queue(&self, queue: &str) -> Result<()> {
        self.store.resume_queue(queue).await?;
        tracing::info!(queue, "Queue resumed");
        Ok(())
    }

    /// Currently paused queues.
    pub async fn paused_queues(&self) -> Result<Vec<String>> {
        self.store.paused_queues().await
    }

    /// Per-queue, per-state counts.
    pub async fn counts(&self) -> Result<QueueCounts> {
        self.store.counts().await
    }

    /// Current state of a job, or None for unknown ids.
    pub async fn job_state(&self, job_id: JobId) -> Result<Option<ExecutionState>> {
        self.store.job_state(job_id).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recurring tasks
    // ─────────────────────────────────────────────────────────────────────────

    /// Register (or replace) a recurring task. Takes effect on the next
    /// scheduler tick.
    pub fn add_recurring(&self, task: RecurringTask) {
        tracing::info!(task = %task.key, expression = %task.expression, "Recurring task registered");
        self.recurring.insert(task.key.clone(), task);
    }

    /// Remove a recurring task. Returns false when the key is unknown.
    pub fn remove_recurring(&self, key: &str) -> bool {
        self.recurring.remove(key).is_some()
    }

    /// Registered recurring task keys, sorted.
    pub fn recurring_tasks(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .recurring
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn the background services onto the current runtime.
    ///
    /// Fails with [`FlywheelError::AlreadyRunning`] when called twice
    /// without an intervening [`Flywheel::shutdown`].
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FlywheelError::AlreadyRunning);
        }

        let supervisor = Supervisor::new(Arc::clone(&self.store), self.config.supervisor.clone());
        let supervisor_id = supervisor.process_id();

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            self.config.dispatcher.clone(),
            self.config.supervisor.clone(),
        )
        .with_supervisor(supervisor_id);

        let scheduler = RecurringScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.recurring),
            self.config.recurring.clone(),
            self.config.supervisor.clone(),
        )
        .with_supervisor(supervisor_id);

        let worker = Worker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.worker.clone(),
            self.config.supervisor.clone(),
        )
        .with_supervisor(supervisor_id);

        let mut services = self.services.lock();
        services.push(tokio::spawn(supervisor.run(self.shutdown.child_token())));
        services.push(tokio::spawn(dispatcher.run(self.shutdown.child_token())));
        services.push(tokio::spawn(scheduler.run(self.shutdown.child_token())));
        services.push(tokio::spawn(worker.run(self.shutdown.child_token())));

        tracing::info!(
            queues = ?self.config.worker.queues,
            recurring_tasks = self.recurring.len(),
            "Flywheel started"
        );
        Ok(())
    }

    /// Stop the services and wait for them to drain. Jobs in flight finish
    /// their current batch; handlers observe the shutdown through their
    /// context token.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<Result<()>>> = std::mem::take(&mut *self.services.lock());
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => error.observe(),
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Service task ended abnormally");
                }
            }
        }
        tracing::info!("Flywheel stopped");
        Ok(())
    }

    /// Whether the background services are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Flywheel {
    fn drop(&mut self) {
        // Best effort: services cannot be joined here, but they stop.
        self.shutdown.cancel();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
