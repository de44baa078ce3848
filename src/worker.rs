//! Worker service: claims ready jobs and executes their handlers.
//!
//! Each poll the worker atomically claims a batch, runs every claimed job on
//! its own task, and reports each outcome back to the store. A panicking
//! handler takes down its task, not the worker; the panic is captured and
//! recorded as a job failure.
//!
//! The delivery contract is at-least-once: a worker that dies mid-execution
//! leaves its claims behind for the supervisor to reclaim, so handlers should
//! be idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{SupervisorConfig, WorkerConfig};
use crate::error::Result;
use crate::job::{ExecutionError, JobContext, JobId};
use crate::registry::HandlerRegistry;
use crate::store::{ExecutionStore, ProcessId, ProcessKind, ProcessRecord};

/// Spread applied to the poll interval so co-located workers drift apart.
const POLL_JITTER_FACTOR: f64 = 0.1;

// ═══════════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Running totals for one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    claimed: Arc<AtomicU64>,
    succeeded: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Jobs currently executing.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// What one worker poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Background service owning the Ready -> Claimed -> terminal transitions.
pub struct Worker {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    supervisor: SupervisorConfig,
    supervisor_id: Option<ProcessId>,
    process_id: ProcessId,
    cancellation: CancellationToken,
    stats: WorkerStats,
}

struct Running {
    job_id: JobId,
    queue: String,
    class_id: String,
    handle: JoinHandle<(Duration, std::result::Result<(), ExecutionError>)>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
        supervisor: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            supervisor,
            supervisor_id: None,
            process_id: ProcessId::new(),
            cancellation: CancellationToken::new(),
            stats: WorkerStats::default(),
        }
    }

    /// Link the worker's process record to a supervisor.
    pub fn with_supervisor(mut self, supervisor_id: ProcessId) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    /// The id this worker claims under.
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Handle to the running totals (shared with the service loop).
    pub fn stats(&self) -> WorkerStats {
        self.stats.clone()
    }

    /// One poll at `now`: claim a batch, execute it to completion, report
    /// every outcome. Exposed for deterministic ticking in tests and
    /// embedded setups.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ExecutionReport> {
        let claimed = self
            .store
            .claim(self.process_id, &self.config.queues, self.config.batch_size, now)
            .await?;
        let mut report = ExecutionReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        self.stats
            .claimed
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);
        self.stats
            .active
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);

        // One task per job: a panic is contained to the task and surfaces
        // as a JoinError below.
        let mut running = Vec::with_capacity(claimed.len());
        for item in claimed {
            let registry = Arc::clone(&self.registry);
            let cancellation = self.cancellation.child_token();
            let job_id = item.job.id;
            let queue = item.job.queue.clone();
            let class_id = item.job.class_id.clone();
            let handle = tokio::spawn(async move {
                let ctx = JobContext::new(&item.job, item.claimed_at, cancellation);
                let started = std::time::Instant::now();
                let result = registry.execute(&item.job, ctx).await;
                (started.elapsed(), result)
            });
            running.push(Running {
                job_id,
                queue,
                class_id,
                handle,
            });
        }

        for task in running {
            let outcome = match task.handle.await {
                Ok((elapsed, result)) => {
                    histogram!(
                        "flywheel_job_duration_seconds",
                        "queue" => task.queue.clone(),
                        "class_id" => task.class_id.clone(),
                    )
                    .record(elapsed.as_secs_f64());
                    result
                }
                Err(join_error) => match join_error.try_into_panic() {
                    Ok(payload) => {
                        let detail = if let Some(message) = payload.downcast_ref::<&str>() {
                            (*message).to_string()
                        } else if let Some(message) = payload.downcast_ref::<String>() {
                            message.clone()
                        } else {
                            "handler panicked with a non-string payload".to_string()
                        };
                        Err(ExecutionError::panicked(detail))
                    }
                    Err(join_error) => Err(ExecutionError::fatal(format!(
                        "execution task aborted: {join_error}"
                    ))
                    .with_code("aborted")),
                },
            };
            self.report_outcome(task.job_id, &task.queue, &task.class_id, outcome, &mut report)
                .await?;
            self.stats.active.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(report)
    }

    async fn report_outcome(
        &self,
        job_id: JobId,
        queue: &str,
        class_id: &str,
        outcome: std::result::Result<(), ExecutionError>,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let now = Utc::now();
        match outcome {
            Ok(()) => {
                let recorded = self.store.mark_finished(job_id, now).await?;
                if recorded {
                    report.succeeded += 1;
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    counter!("flywheel_jobs_total", "queue" => queue.to_string(), "outcome" => "succeeded")
                        .increment(1);
                    tracing::info!(job_id = %job_id, queue, class_id, "Job finished");
                } else {
                    // Ownership was lost (e.g. reclaimed after a stall) and
                    // someone else already settled the job.
                    tracing::debug!(job_id = %job_id, queue, "Job outcome discarded; already settled");
                }
            }
            Err(error) => {
                let recorded = self.store.mark_failed(job_id, error.clone(), now).await?;
                if recorded {
                    report.failed += 1;
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    counter!("flywheel_jobs_total", "queue" => queue.to_string(), "outcome" => "failed")
                        .increment(1);
                    tracing::error!(
                        job_id = %job_id,
                        queue,
                        class_id,
                        error = %error,
                        retryable = error.is_retryable(),
                        "Job failed"
                    );
                } else {
                    tracing::debug!(job_id = %job_id, queue, "Job failure discarded; already settled");
                }
            }
        }
        Ok(())
    }

    /// Run the polling loop until `shutdown` is cancelled. The batch in
    /// flight when shutdown arrives is drained before the worker
    /// deregisters; handlers observe the cancellation through their context.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.cancellation = shutdown.clone();

        let mut process = ProcessRecord::new(ProcessKind::Worker, Utc::now())
            .with_metadata(serde_json::json!({ "queues": self.config.queues }));
        process.id = self.process_id;
        if let Some(supervisor_id) = self.supervisor_id {
            process = process.with_supervisor(supervisor_id);
        }
        self.store.register_process(process.clone()).await?;

        tracing::info!(
            process_id = %self.process_id,
            queues = ?self.config.queues,
            batch_size = self.config.batch_size,
            "Worker started"
        );

        let mut heartbeat = tokio::time::interval(self.supervisor.heartbeat_interval);
        let mut delay = jittered(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {
                    delay = match self.run_once(Utc::now()).await {
                        // A full batch means the queue is hot; poll again
                        // without waiting.
                        Ok(report) if report.claimed == self.config.batch_size
                            && report.claimed > 0 => Duration::ZERO,
                        Ok(_) => jittered(self.config.poll_interval),
                        Err(error) => {
                            error.observe();
                            jittered(self.config.poll_interval)
                        }
                    };
                }
                _ = heartbeat.tick() => {
                    match self.store.heartbeat(self.process_id, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(process_id = %self.process_id, "Worker process row missing; re-registering");
                            process.last_heartbeat_at = Utc::now();
                            self.store.register_process(process.clone()).await?;
                        }
                        Err(error) => error.observe(),
                    }
                }
            }
        }

        let released = self
            .store
            .deregister_process(self.process_id, Utc::now())
            .await?;
        tracing::info!(
            process_id = %self.process_id,
            released,
            "Worker stopped"
        );
        Ok(())
    }
}

/// Poll delay with a random spread of up to ±10%.
fn jittered(interval: Duration) -> Duration {
    let spread = (rand_unit() * 2.0 - 1.0) * POLL_JITTER_FACTOR;
    interval.mul_f64((1.0 + spread).max(0.0))
}

/// Cheap pseudo-random value in 0.0..1.0, seeded from the hash RNG.
fn rand_unit() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
