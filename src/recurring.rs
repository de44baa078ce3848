//! Recurring task scheduler: cron-driven job submission.
//!
//! Each registered task pairs a cron expression with a job template. On
//! every tick the scheduler computes the occurrences that fell inside
//! `(last_tick, now]` and fires one job per occurrence. The
//! `(task_key, run_at)` uniqueness recorded by the store makes the tick
//! idempotent: with several schedulers running, each occurrence still
//! produces exactly one job, and the losers just count a skip.
//!
//! The watermark starts at scheduler creation, so occurrences that elapsed
//! while no scheduler was running are not back-filled.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{RecurringConfig, SupervisorConfig};
use crate::error::{FlywheelError, Result};
use crate::job::JobRequest;
use crate::store::{ExecutionStore, ProcessId, ProcessKind, ProcessRecord};

// ═══════════════════════════════════════════════════════════════════════════════
// Recurring Task
// ═══════════════════════════════════════════════════════════════════════════════

/// A cron schedule plus the job template it fires.
///
/// Expressions use the seconds-resolution cron format
/// (`sec min hour day-of-month month day-of-week [year]`).
#[derive(Debug, Clone)]
pub struct RecurringTask {
    /// Unique task key; occurrence dedup is scoped to it.
    pub key: String,
    /// Original cron expression, kept for display and logs.
    pub expression: String,
    /// Whether the task comes from static configuration rather than a
    /// runtime registration.
    pub is_static: bool,
    schedule: Schedule,
    request: JobRequest,
}

impl RecurringTask {
    /// Parse a task definition. Fails on an invalid cron expression or an
    /// invalid job template.
    pub fn new(
        key: impl Into<String>,
        expression: impl Into<String>,
        request: JobRequest,
    ) -> Result<Self> {
        let expression = expression.into();
        let schedule = Schedule::from_str(&expression)
            .map_err(|error| FlywheelError::invalid_schedule(&expression, error))?;
        request.validate()?;
        Ok(Self {
            key: key.into(),
            expression,
            is_static: false,
            schedule,
            request,
        })
    }

    /// Mark the task as statically configured.
    pub fn static_task(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// The next occurrence strictly after `after`.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// All occurrences in `(after, until]`, in order.
    pub fn occurrences_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .take_while(|run_at| *run_at <= until)
            .collect()
    }

    /// The job this task submits for the occurrence at `run_at`.
    fn request_for(&self, run_at: DateTime<Utc>) -> JobRequest {
        self.request.clone().schedule_at(run_at)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecurringReport {
    /// Occurrences that produced a job.
    pub triggered: usize,
    /// Occurrences another scheduler already fired.
    pub skipped: usize,
}

/// Running totals for one scheduler.
#[derive(Debug, Clone, Default)]
pub struct RecurringStats {
    triggered: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl RecurringStats {
    pub fn triggered(&self) -> u64 {
        self.triggered.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Background service firing recurring tasks on their cron schedules.
pub struct RecurringScheduler {
    store: Arc<dyn ExecutionStore>,
    tasks: Arc<DashMap<String, RecurringTask>>,
    config: RecurringConfig,
    supervisor: SupervisorConfig,
    supervisor_id: Option<ProcessId>,
    last_tick: Mutex<DateTime<Utc>>,
    stats: RecurringStats,
}

impl RecurringScheduler {
    /// Create a scheduler over a shared task map. The occurrence window
    /// starts now; nothing before it is back-filled.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        tasks: Arc<DashMap<String, RecurringTask>>,
        config: RecurringConfig,
        supervisor: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            tasks,
            config,
            supervisor,
            supervisor_id: None,
            last_tick: Mutex::new(Utc::now()),
            stats: RecurringStats::default(),
        }
    }

    /// Link the scheduler's process record to a supervisor.
    pub fn with_supervisor(mut self, supervisor_id: ProcessId) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    /// Handle to the running totals (shared with the service loop).
    pub fn stats(&self) -> RecurringStats {
        self.stats.clone()
    }

    /// Restart the occurrence window at `now`.
    pub fn reset_watermark(&self, now: DateTime<Utc>) {
        *self.last_tick.lock() = now;
    }

    /// One tick at `now`: fire every task occurrence in `(last_tick, now]`.
    /// Exposed for deterministic ticking in tests and embedded setups.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RecurringReport> {
        let since = {
            let mut watermark = self.last_tick.lock();
            let since = *watermark;
            // Never move the watermark backwards under clock skew.
            *watermark = since.max(now);
            since
        };
        let mut report = RecurringReport::default();
        if now <= since {
            return Ok(report);
        }

        // Snapshot the task set; no map guard is held across awaits.
        let tasks: Vec<RecurringTask> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for task in tasks {
            for run_at in task.occurrences_between(since, now) {
                let request = task.request_for(run_at);
                match self
                    .store
                    .enqueue_recurring(request, &task.key, run_at, now)
                    .await?
                {
                    Some(enqueued) => {
                        report.triggered += 1;
                        self.stats.triggered.fetch_add(1, Ordering::Relaxed);
                        counter!("flywheel_recurring_triggered_total", "task" => task.key.clone())
                            .increment(1);
                        tracing::debug!(
                            task = %task.key,
                            run_at = %run_at,
                            job_id = %enqueued.job_id,
                            "Recurring task fired"
                        );
                    }
                    None => {
                        report.skipped += 1;
                        self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            task = %task.key,
                            run_at = %run_at,
                            "Occurrence already fired elsewhere"
                        );
                    }
                }
            }
        }
        Ok(report)
    }

    /// Run the tick loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut process = ProcessRecord::new(ProcessKind::Scheduler, Utc::now());
        if let Some(supervisor_id) = self.supervisor_id {
            process = process.with_supervisor(supervisor_id);
        }
        let process_id = process.id;
        self.store.register_process(process.clone()).await?;

        tracing::info!(
            process_id = %process_id,
            tasks = self.tasks.len(),
            tick_interval = ?self.config.tick_interval,
            "Recurring scheduler started"
        );

        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut heartbeat = tokio::time::interval(self.supervisor.heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(error) = self.run_once(Utc::now()).await {
                        error.observe();
                    }
                }
                _ = heartbeat.tick() => {
                    match self.store.heartbeat(process_id, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(process_id = %process_id, "Scheduler process row missing; re-registering");
                            process.last_heartbeat_at = Utc::now();
                            self.store.register_process(process.clone()).await?;
                        }
                        Err(error) => error.observe(),
                    }
                }
            }
        }

        self.store.deregister_process(process_id, Utc::now()).await?;
        tracing::info!(process_id = %process_id, "Recurring scheduler stopped");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
