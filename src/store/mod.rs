//! Execution store: the persistence seam of the engine.
//!
//! Every state transition in the queue is one method on [`ExecutionStore`],
//! and every method is atomic — a crash between calls leaves the previous
//! state intact, never a half-moved job. The in-process [`MemoryStore`]
//! realizes atomicity with a single lock; a durable implementation maps each
//! method onto one transaction.
//!
//! The persisted layout is seven logical tables (Job, Ready, Claimed,
//! Blocked, Scheduled, Failed, Semaphore) plus recurring-run records,
//! process records, and per-queue pause flags.
//!
//! All time-dependent methods take an explicit `now` so liveness and expiry
//! behavior is deterministic under test.

mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{ExecutionError, ExecutionState, Job, JobId, JobRequest};

// ═══════════════════════════════════════════════════════════════════════════════
// Process Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a registered process (worker, dispatcher, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub Uuid);

impl ProcessId {
    /// Generate a fresh process id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What role a registered process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Supervisor,
    Worker,
    Dispatcher,
    Scheduler,
}

impl ProcessKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Worker => "worker",
            Self::Dispatcher => "dispatcher",
            Self::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered process and its liveness bookkeeping.
///
/// Lifecycle: `starting -> alive (heartbeating) -> dead (missed heartbeat)
/// -> reaped (row removed, claimed jobs reclaimed)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub pid: u32,
    pub hostname: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// The supervisor that spawned this process, when applicable.
    pub supervisor_id: Option<ProcessId>,
    /// Free-form metadata (e.g. the queues a worker serves).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ProcessRecord {
    /// Create a record for the current OS process.
    pub fn new(kind: ProcessKind, now: DateTime<Utc>) -> Self {
        Self {
            id: ProcessId::new(),
            kind,
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            last_heartbeat_at: now,
            started_at: now,
            supervisor_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Link this process to its supervisor.
    pub fn with_supervisor(mut self, supervisor_id: ProcessId) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether the process has gone silent for longer than `threshold`.
    pub fn is_dead(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat_at > threshold
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A job eligible for immediate pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyExecution {
    pub job_id: JobId,
    pub queue: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// A job currently owned by a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedExecution {
    pub job_id: JobId,
    pub process_id: ProcessId,
    pub claimed_at: DateTime<Utc>,
}

/// A job waiting for concurrency-key capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedExecution {
    pub job_id: JobId,
    pub queue: String,
    pub priority: i32,
    pub concurrency_key: String,
    /// Safety timeout: past this instant the dispatcher force-releases the
    /// job into Ready even without semaphore capacity.
    pub expires_at: DateTime<Utc>,
}

/// A job waiting for its scheduled time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledExecution {
    pub job_id: JobId,
    pub queue: String,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// Terminal failure record for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedExecution {
    pub job_id: JobId,
    pub error: ExecutionError,
    pub failed_at: DateTime<Utc>,
}

/// Snapshot of one concurrency-key semaphore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreState {
    pub key: String,
    /// Remaining capacity. Never negative; never above `limit`.
    pub value: u32,
    pub limit: u32,
    /// Past this instant the row is invalid and the next acquire resets the
    /// key to full capacity.
    pub expires_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Operation Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of submitting a job: its id and the state it landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: JobId,
    pub state: ExecutionState,
}

/// A claimed job handed to a worker for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub claimed_at: DateTime<Utc>,
}

/// What one dispatch tick did to due scheduled executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Due jobs moved into Ready (semaphore acquired or no key).
    pub to_ready: usize,
    /// Due jobs parked in Blocked for lack of capacity.
    pub to_blocked: usize,
}

impl DispatchOutcome {
    pub fn total(&self) -> usize {
        self.to_ready + self.to_blocked
    }
}

/// What one blocked-release pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnblockOutcome {
    /// Blocked jobs promoted after acquiring capacity.
    pub unblocked: usize,
    /// Blocked jobs force-released past their expiry without capacity
    /// (the escape valve).
    pub force_released: usize,
}

impl UnblockOutcome {
    pub fn total(&self) -> usize {
        self.unblocked + self.force_released
    }
}

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Dead process rows removed.
    pub processes_reaped: usize,
    /// Claimed jobs returned to Ready.
    pub jobs_reclaimed: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Counts
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-state counts for a single queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub ready: usize,
    pub claimed: usize,
    pub blocked: usize,
    pub scheduled: usize,
    pub failed: usize,
}

impl StateCounts {
    /// Jobs that have not reached a terminal state.
    pub fn backlog(&self) -> usize {
        self.ready + self.claimed + self.blocked + self.scheduled
    }
}

/// Per-queue, per-state counts: the primary operational signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub by_queue: HashMap<String, StateCounts>,
}

impl QueueCounts {
    /// Counts for one queue (zeroes when the queue has no rows).
    pub fn queue(&self, name: &str) -> StateCounts {
        self.by_queue.get(name).copied().unwrap_or_default()
    }

    /// Sums across all queues.
    pub fn totals(&self) -> StateCounts {
        let mut total = StateCounts::default();
        for counts in self.by_queue.values() {
            total.ready += counts.ready;
            total.claimed += counts.claimed;
            total.blocked += counts.blocked;
            total.scheduled += counts.scheduled;
            total.failed += counts.failed;
        }
        total
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// The Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Atomic state transitions over the job tables.
///
/// Implementations must guarantee that each method executes atomically with
/// respect to every other method: the mutual-exclusion invariant (a live job
/// occupies exactly one execution table) must hold at every observable
/// instant. Semaphore math in particular must be a conditional update inside
/// the operation, never a read-then-write across operations.
///
/// Methods that return `bool` report whether the call changed anything;
/// repeating them is safe (idempotent no-op the second time).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Submission + terminal transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a job and its initial execution row in one transaction.
    ///
    /// A future `scheduled_at` lands in Scheduled; otherwise the semaphore
    /// decides Ready vs Blocked. The request's `concurrency_limit` must
    /// already be resolved by the caller when a key is present.
    async fn enqueue(&self, request: JobRequest, now: DateTime<Utc>) -> Result<Enqueued>;

    /// Terminal success: set finished_at, drop the execution row, release a
    /// held semaphore token. Returns false (and releases nothing) when the
    /// job is already terminal or unknown.
    async fn mark_finished(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool>;

    /// Terminal failure: record the error, drop the execution row, release a
    /// held semaphore token. Returns false when the job is already terminal
    /// or unknown.
    async fn mark_failed(
        &self,
        job_id: JobId,
        error: ExecutionError,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Remove a job that has not started: succeeds only from
    /// Scheduled/Ready/Blocked, deleting the job row outright. A Ready job
    /// holding a semaphore token releases it.
    async fn cancel_if_not_started(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Claim protocol
    // ─────────────────────────────────────────────────────────────────────────

    /// Atomically move up to `limit` Ready jobs into Claimed for
    /// `process_id`, ordered by (priority desc, job id asc). `queues`
    /// filters eligibility (empty = all); paused queues are always skipped.
    /// Racing claimers simply see fewer rows.
    async fn claim(
        &self,
        process_id: ProcessId,
        queues: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatcher transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Move due Scheduled jobs out, ordered by (scheduled_at asc, priority
    /// desc), at most `batch_size`, skipping paused queues. Jobs with a
    /// concurrency key go through the semaphore (Ready on acquire, Blocked
    /// otherwise); the rest go straight to Ready.
    async fn dispatch_due(&self, batch_size: usize, now: DateTime<Utc>)
        -> Result<DispatchOutcome>;

    /// Promote Blocked jobs whose key has capacity again, and force-release
    /// those past `expires_at` even without capacity (the escape valve).
    /// Skips paused queues; at most `batch_size` rows move.
    async fn release_blocked(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<UnblockOutcome>;

    // ─────────────────────────────────────────────────────────────────────────
    // Failed job management
    // ─────────────────────────────────────────────────────────────────────────

    /// List failed executions, oldest first, up to `limit`.
    async fn failed_executions(&self, limit: usize) -> Result<Vec<FailedExecution>>;

    /// Resubmit a failed job under its original id: drop the failure record
    /// and re-enter Ready/Blocked via the semaphore check.
    async fn retry_failed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool>;

    /// Drop a failed job and its failure record entirely.
    async fn discard_failed(&self, job_id: JobId) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Pause control
    // ─────────────────────────────────────────────────────────────────────────

    /// Persistently pause a queue: no promotions into Ready, no claims.
    async fn pause_queue(&self, queue: &str) -> Result<()>;

    /// Lift a pause. Unknown queues are a no-op.
    async fn resume_queue(&self, queue: &str) -> Result<()>;

    /// Currently paused queues, sorted.
    async fn paused_queues(&self) -> Result<Vec<String>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Process registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a process row.
    async fn register_process(&self, process: ProcessRecord) -> Result<()>;

    /// Refresh a process's heartbeat. Returns false when the row is gone
    /// (e.g. already reaped) — the caller should re-register or stop.
    async fn heartbeat(&self, process_id: ProcessId, now: DateTime<Utc>) -> Result<bool>;

    /// Graceful shutdown: release the process's Claimed jobs back to Ready
    /// and delete its row. Returns how many jobs were released.
    async fn deregister_process(&self, process_id: ProcessId, now: DateTime<Utc>)
        -> Result<usize>;

    /// Reap processes silent for longer than `threshold`: reclaim their
    /// Claimed jobs into Ready and delete the rows. Claims whose owner has
    /// no Process row at all are swept on the same pass once the claim
    /// itself has aged past `threshold`.
    async fn reap_dead_processes(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapOutcome>;

    /// All registered processes.
    async fn processes(&self) -> Result<Vec<ProcessRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Recurring executions
    // ─────────────────────────────────────────────────────────────────────────

    /// Fire one recurring occurrence: if (task_key, run_at) has not been
    /// recorded yet, record it and enqueue the job in the same transaction;
    /// otherwise return None (someone already fired this occurrence).
    async fn enqueue_recurring(
        &self,
        request: JobRequest,
        task_key: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Enqueued>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection + maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch a job row.
    async fn job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Current execution state of a job, or None for unknown ids.
    async fn job_state(&self, job_id: JobId) -> Result<Option<ExecutionState>>;

    /// Per-queue per-state counts.
    async fn counts(&self) -> Result<QueueCounts>;

    /// Snapshot of one semaphore, or None when no row exists for the key.
    async fn semaphore(&self, key: &str) -> Result<Option<SemaphoreState>>;

    /// Delete finished job rows older than `older_than`, along with
    /// recurring-run records whose occurrence predates the same cutoff.
    /// Returns how many job rows were removed.
    async fn prune_finished(&self, older_than: chrono::Duration, now: DateTime<Utc>)
        -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
