//! In-memory [`ExecutionStore`] implementation.
//!
//! A single mutex over all tables is the transaction boundary: each trait
//! method locks once, applies the whole transition, and unlocks. That gives
//! the same atomicity guarantees a database transaction would, which is what
//! the claim protocol and the semaphore math rely on.
//!
//! Intended for embedded deployments and tests. State does not survive a
//! process restart; the recovery paths (reaping, claim reclamation) are
//! still exercised because multiple logical processes can share one store.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::{to_chrono, ConcurrencyConfig};
use crate::error::Result;
use crate::job::{ExecutionError, ExecutionState, Job, JobId, JobRequest};

use super::{
    BlockedExecution, ClaimedExecution, ClaimedJob, DispatchOutcome, Enqueued, ExecutionStore,
    FailedExecution, ProcessId, ProcessRecord, QueueCounts, ReadyExecution, ReapOutcome,
    ScheduledExecution, SemaphoreState, UnblockOutcome,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Tables
// ═══════════════════════════════════════════════════════════════════════════════

/// All persisted state, guarded by one lock.
#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    ready: HashMap<JobId, ReadyExecution>,
    claimed: HashMap<JobId, ClaimedExecution>,
    blocked: HashMap<JobId, BlockedExecution>,
    scheduled: HashMap<JobId, ScheduledExecution>,
    failed: HashMap<JobId, FailedExecution>,
    semaphores: HashMap<String, SemaphoreState>,
    recurring_runs: HashSet<(String, DateTime<Utc>)>,
    processes: HashMap<ProcessId, ProcessRecord>,
    paused: HashSet<String>,
}

impl Tables {
    /// Conditional decrement: take a token if capacity remains.
    ///
    /// A missing row means full capacity, so the first acquire creates the
    /// row at `limit - 1`. An expired row is reset to full capacity before
    /// the token is taken. Every successful acquire pushes `expires_at`
    /// forward.
    fn try_acquire(
        &mut self,
        key: &str,
        limit: u32,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let limit = limit.max(1);
        match self.semaphores.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let row = entry.get_mut();
                if row.expires_at <= now {
                    row.limit = limit;
                    row.value = limit - 1;
                    row.expires_at = expires_at;
                    true
                } else if row.value > 0 {
                    row.value -= 1;
                    row.expires_at = expires_at;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(SemaphoreState {
                    key: key.to_string(),
                    value: limit - 1,
                    limit,
                    expires_at,
                });
                true
            }
        }
    }

    /// Conditional increment, capped at the limit. Expired or missing rows
    /// are left alone; the next acquire resets them. The cap is what keeps
    /// force-released jobs from inflating capacity when they finish.
    fn release(&mut self, key: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        if let Some(row) = self.semaphores.get_mut(key) {
            if row.expires_at > now && row.value < row.limit {
                row.value += 1;
                row.expires_at = expires_at;
            }
        }
    }

    /// Insert the job and its initial execution row.
    fn place(&mut self, job: Job, horizon: DateTime<Utc>, now: DateTime<Utc>) -> ExecutionState {
        let state = match job.scheduled_at {
            Some(at) if at > now => {
                self.scheduled.insert(
                    job.id,
                    ScheduledExecution {
                        job_id: job.id,
                        queue: job.queue.clone(),
                        priority: job.priority,
                        scheduled_at: at,
                    },
                );
                ExecutionState::Scheduled
            }
            _ => self.admit(&job, horizon, now),
        };
        self.jobs.insert(job.id, job);
        state
    }

    /// Admit a due job: Ready when its key has capacity (or it has none),
    /// Blocked otherwise.
    fn admit(&mut self, job: &Job, horizon: DateTime<Utc>, now: DateTime<Utc>) -> ExecutionState {
        if let Some((key, limit)) = job.concurrency() {
            if !self.try_acquire(key, limit, horizon, now) {
                self.blocked.insert(
                    job.id,
                    BlockedExecution {
                        job_id: job.id,
                        queue: job.queue.clone(),
                        priority: job.priority,
                        concurrency_key: key.to_string(),
                        expires_at: horizon,
                    },
                );
                return ExecutionState::Blocked;
            }
        }
        self.ready.insert(
            job.id,
            ReadyExecution {
                job_id: job.id,
                queue: job.queue.clone(),
                priority: job.priority,
                created_at: now,
            },
        );
        ExecutionState::Ready
    }

    /// Move every claimed job of `process_id` back to Ready. Held semaphore
    /// tokens move with the jobs; no release happens here.
    fn reclaim_claimed(&mut self, process_id: ProcessId, now: DateTime<Utc>) -> usize {
        let ids: Vec<JobId> = self
            .claimed
            .values()
            .filter(|row| row.process_id == process_id)
            .map(|row| row.job_id)
            .collect();
        for job_id in &ids {
            self.claimed.remove(job_id);
            if let Some(job) = self.jobs.get(job_id) {
                self.ready.insert(
                    *job_id,
                    ReadyExecution {
                        job_id: *job_id,
                        queue: job.queue.clone(),
                        priority: job.priority,
                        created_at: now,
                    },
                );
            }
        }
        ids.len()
    }

    /// Move claimed jobs whose owner has no Process row back to Ready once
    /// the claim has aged past `threshold`. Catches claims that outlive a
    /// reaped owner row, and owners that died before ever registering.
    fn reclaim_orphaned(&mut self, threshold: chrono::Duration, now: DateTime<Utc>) -> usize {
        let ids: Vec<JobId> = self
            .claimed
            .values()
            .filter(|row| !self.processes.contains_key(&row.process_id))
            .filter(|row| now - row.claimed_at > threshold)
            .map(|row| row.job_id)
            .collect();
        for job_id in &ids {
            self.claimed.remove(job_id);
            if let Some(job) = self.jobs.get(job_id) {
                self.ready.insert(
                    *job_id,
                    ReadyExecution {
                        job_id: *job_id,
                        queue: job.queue.clone(),
                        priority: job.priority,
                        created_at: now,
                    },
                );
            }
        }
        ids.len()
    }

    fn is_terminal(&self, job_id: JobId) -> bool {
        self.failed.contains_key(&job_id)
            || self
                .jobs
                .get(&job_id)
                .map(|job| job.is_finished())
                .unwrap_or(false)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryStore
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process store backed by hash tables behind one mutex.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    sequence: AtomicI64,
    concurrency: ConcurrencyConfig,
}

impl MemoryStore {
    /// Create a store with default concurrency settings.
    pub fn new() -> Self {
        Self::with_concurrency(ConcurrencyConfig::default())
    }

    /// Create a store with explicit concurrency settings (default limit and
    /// semaphore expiry window).
    pub fn with_concurrency(concurrency: ConcurrencyConfig) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            sequence: AtomicI64::new(0),
            concurrency,
        }
    }

    fn next_id(&self) -> JobId {
        JobId(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Semaphore and blocked-row expiry instant for operations at `now`.
    fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.concurrency.duration)
    }

    /// Materialize a validated request into a job row, resolving the
    /// concurrency limit against the configured default.
    fn build_job(&self, request: JobRequest, now: DateTime<Utc>) -> Job {
        let concurrency_limit = request
            .concurrency_key
            .as_ref()
            .map(|_| request.concurrency_limit.unwrap_or(self.concurrency.default_limit).max(1));
        Job {
            id: self.next_id(),
            queue: request.queue,
            class_id: request.class_id,
            arguments: request.arguments,
            priority: request.priority,
            correlation_id: request.correlation_id,
            concurrency_key: request.concurrency_key,
            concurrency_limit,
            scheduled_at: request.scheduled_at,
            finished_at: None,
            created_at: now,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn enqueue(&self, request: JobRequest, now: DateTime<Utc>) -> Result<Enqueued> {
        request.validate()?;
        let job = self.build_job(request, now);
        let job_id = job.id;
        let horizon = self.horizon(now);

        let mut guard = self.tables.lock();
        let state = guard.place(job, horizon, now);
        Ok(Enqueued { job_id, state })
    }

    async fn mark_finished(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let horizon = self.horizon(now);
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let Some(job) = tables.jobs.get(&job_id) else {
            return Ok(false);
        };
        let key = job.concurrency_key.clone();
        if tables.is_terminal(job_id) {
            return Ok(false);
        }

        let from_ready = tables.ready.remove(&job_id).is_some();
        let from_claimed = tables.claimed.remove(&job_id).is_some();
        tables.blocked.remove(&job_id);
        tables.scheduled.remove(&job_id);

        // Only Ready and Claimed hold a token.
        if from_ready || from_claimed {
            if let Some(key) = &key {
                tables.release(key, horizon, now);
            }
        }
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.finished_at = Some(now);
        }
        Ok(true)
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: ExecutionError,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let horizon = self.horizon(now);
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let Some(job) = tables.jobs.get(&job_id) else {
            return Ok(false);
        };
        let key = job.concurrency_key.clone();
        if tables.is_terminal(job_id) {
            return Ok(false);
        }

        let from_ready = tables.ready.remove(&job_id).is_some();
        let from_claimed = tables.claimed.remove(&job_id).is_some();
        tables.blocked.remove(&job_id);
        tables.scheduled.remove(&job_id);

        if from_ready || from_claimed {
            if let Some(key) = &key {
                tables.release(key, horizon, now);
            }
        }
        tables.failed.insert(
            job_id,
            FailedExecution {
                job_id,
                error,
                failed_at: now,
            },
        );
        Ok(true)
    }

    async fn cancel_if_not_started(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let horizon = self.horizon(now);
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let Some(job) = tables.jobs.get(&job_id) else {
            return Ok(false);
        };
        let key = job.concurrency_key.clone();
        if tables.claimed.contains_key(&job_id) || tables.is_terminal(job_id) {
            return Ok(false);
        }

        let from_ready = tables.ready.remove(&job_id).is_some();
        let removed = from_ready
            || tables.blocked.remove(&job_id).is_some()
            || tables.scheduled.remove(&job_id).is_some();
        if !removed {
            return Ok(false);
        }
        if from_ready {
            if let Some(key) = &key {
                tables.release(key, horizon, now);
            }
        }
        tables.jobs.remove(&job_id);
        Ok(true)
    }

    async fn claim(
        &self,
        process_id: ProcessId,
        queues: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let mut eligible: Vec<(i32, JobId)> = tables
            .ready
            .values()
            .filter(|row| !tables.paused.contains(&row.queue))
            .filter(|row| queues.is_empty() || queues.iter().any(|q| q == &row.queue))
            .map(|row| (row.priority, row.job_id))
            .collect();
        // Priority desc, then submission order.
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, job_id) in eligible {
            tables.ready.remove(&job_id);
            tables.claimed.insert(
                job_id,
                ClaimedExecution {
                    job_id,
                    process_id,
                    claimed_at: now,
                },
            );
            if let Some(job) = tables.jobs.get(&job_id) {
                claimed.push(ClaimedJob {
                    job: job.clone(),
                    claimed_at: now,
                });
            }
        }
        Ok(claimed)
    }

    async fn dispatch_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let horizon = self.horizon(now);
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let mut due: Vec<(DateTime<Utc>, i32, JobId)> = tables
            .scheduled
            .values()
            .filter(|row| row.scheduled_at <= now)
            .filter(|row| !tables.paused.contains(&row.queue))
            .map(|row| (row.scheduled_at, row.priority, row.job_id))
            .collect();
        // Overdue first; among equals, priority desc, then submission order.
        due.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
        due.truncate(batch_size);

        let mut outcome = DispatchOutcome::default();
        for (_, _, job_id) in due {
            tables.scheduled.remove(&job_id);
            let Some(job) = tables.jobs.get(&job_id).cloned() else {
                continue;
            };
            match tables.admit(&job, horizon, now) {
                ExecutionState::Blocked => outcome.to_blocked += 1,
                _ => outcome.to_ready += 1,
            }
        }
        Ok(outcome)
    }

    async fn release_blocked(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<UnblockOutcome> {
        let horizon = self.horizon(now);
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let mut candidates: Vec<(i32, JobId)> = tables
            .blocked
            .values()
            .filter(|row| !tables.paused.contains(&row.queue))
            .map(|row| (row.priority, row.job_id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut outcome = UnblockOutcome::default();
        for (_, job_id) in candidates {
            if outcome.total() >= batch_size {
                break;
            }
            let Some(row) = tables.blocked.get(&job_id).cloned() else {
                continue;
            };
            let force = row.expires_at <= now;
            let admitted = force || {
                let limit = tables
                    .jobs
                    .get(&job_id)
                    .and_then(|job| job.concurrency_limit)
                    .unwrap_or(1);
                tables.try_acquire(&row.concurrency_key, limit, horizon, now)
            };
            if admitted {
                tables.blocked.remove(&job_id);
                tables.ready.insert(
                    job_id,
                    ReadyExecution {
                        job_id,
                        queue: row.queue,
                        priority: row.priority,
                        created_at: now,
                    },
                );
                if force {
                    outcome.force_released += 1;
                } else {
                    outcome.unblocked += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn failed_executions(&self, limit: usize) -> Result<Vec<FailedExecution>> {
        let guard = self.tables.lock();
        let mut rows: Vec<FailedExecution> = guard.failed.values().cloned().collect();
        rows.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then(a.job_id.cmp(&b.job_id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn retry_failed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let horizon = self.horizon(now);
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        if tables.failed.remove(&job_id).is_none() {
            return Ok(false);
        }
        let Some(job) = tables.jobs.get(&job_id).cloned() else {
            return Ok(false);
        };
        // The original schedule is long past; re-enter directly through the
        // semaphore check.
        tables.admit(&job, horizon, now);
        Ok(true)
    }

    async fn discard_failed(&self, job_id: JobId) -> Result<bool> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        if tables.failed.remove(&job_id).is_none() {
            return Ok(false);
        }
        tables.jobs.remove(&job_id);
        Ok(true)
    }

    async fn pause_queue(&self, queue: &str) -> Result<()> {
        self.tables.lock().paused.insert(queue.to_string());
        Ok(())
    }

    async fn resume_queue(&self, queue: &str) -> Result<()> {
        self.tables.lock().paused.remove(queue);
        Ok(())
    }

    async fn paused_queues(&self) -> Result<Vec<String>> {
        let mut queues: Vec<String> = self.tables.lock().paused.iter().cloned().collect();
        queues.sort();
        Ok(queues)
    }

    async fn register_process(&self, process: ProcessRecord) -> Result<()> {
        self.tables.lock().processes.insert(process.id, process);
        Ok(())
    }

    async fn heartbeat(&self, process_id: ProcessId, now: DateTime<Utc>) -> Result<bool> {
        let mut guard = self.tables.lock();
        match guard.processes.get_mut(&process_id) {
            Some(process) => {
                process.last_heartbeat_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deregister_process(
        &self,
        process_id: ProcessId,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        if tables.processes.remove(&process_id).is_none() {
            return Ok(0);
        }
        Ok(tables.reclaim_claimed(process_id, now))
    }

    async fn reap_dead_processes(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapOutcome> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        let dead: Vec<ProcessId> = tables
            .processes
            .values()
            .filter(|process| process.is_dead(threshold, now))
            .map(|process| process.id)
            .collect();

        let mut outcome = ReapOutcome::default();
        for process_id in dead {
            tables.processes.remove(&process_id);
            outcome.jobs_reclaimed += tables.reclaim_claimed(process_id, now);
            outcome.processes_reaped += 1;
        }
        // Claims held by an owner with no Process row would never age into
        // the pass above; sweep them once the claim itself is stale.
        outcome.jobs_reclaimed += tables.reclaim_orphaned(threshold, now);
        Ok(outcome)
    }

    async fn processes(&self) -> Result<Vec<ProcessRecord>> {
        let mut rows: Vec<ProcessRecord> = self.tables.lock().processes.values().cloned().collect();
        rows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(rows)
    }

    async fn enqueue_recurring(
        &self,
        request: JobRequest,
        task_key: &str,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Enqueued>> {
        request.validate()?;
        let job = self.build_job(request, now);
        let job_id = job.id;
        let horizon = self.horizon(now);

        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        // (task_key, run_at) uniqueness makes the tick idempotent across
        // racing schedulers.
        if !tables.recurring_runs.insert((task_key.to_string(), run_at)) {
            return Ok(None);
        }
        let state = tables.place(job, horizon, now);
        Ok(Some(Enqueued { job_id, state }))
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.tables.lock().jobs.get(&job_id).cloned())
    }

    async fn job_state(&self, job_id: JobId) -> Result<Option<ExecutionState>> {
        let guard = self.tables.lock();
        if !guard.jobs.contains_key(&job_id) {
            return Ok(None);
        }
        let state = if guard.ready.contains_key(&job_id) {
            ExecutionState::Ready
        } else if guard.claimed.contains_key(&job_id) {
            ExecutionState::Claimed
        } else if guard.blocked.contains_key(&job_id) {
            ExecutionState::Blocked
        } else if guard.scheduled.contains_key(&job_id) {
            ExecutionState::Scheduled
        } else if guard.failed.contains_key(&job_id) {
            ExecutionState::Failed
        } else {
            // Only the job row remains once a job completes.
            ExecutionState::Finished
        };
        Ok(Some(state))
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let guard = self.tables.lock();
        let mut counts = QueueCounts::default();
        for row in guard.ready.values() {
            counts.by_queue.entry(row.queue.clone()).or_default().ready += 1;
        }
        for row in guard.blocked.values() {
            counts.by_queue.entry(row.queue.clone()).or_default().blocked += 1;
        }
        for row in guard.scheduled.values() {
            counts
                .by_queue
                .entry(row.queue.clone())
                .or_default()
                .scheduled += 1;
        }
        for row in guard.claimed.values() {
            if let Some(job) = guard.jobs.get(&row.job_id) {
                counts.by_queue.entry(job.queue.clone()).or_default().claimed += 1;
            }
        }
        for row in guard.failed.values() {
            if let Some(job) = guard.jobs.get(&row.job_id) {
                counts.by_queue.entry(job.queue.clone()).or_default().failed += 1;
            }
        }
        Ok(counts)
    }

    async fn semaphore(&self, key: &str) -> Result<Option<SemaphoreState>> {
        Ok(self.tables.lock().semaphores.get(key).cloned())
    }

    async fn prune_finished(
        &self,
        older_than: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = now - older_than;
        let mut guard = self.tables.lock();
        let stale: Vec<JobId> = guard
            .jobs
            .values()
            .filter(|job| matches!(job.finished_at, Some(at) if at <= cutoff))
            .map(|job| job.id)
            .collect();
        for job_id in &stale {
            guard.jobs.remove(job_id);
        }
        // The scheduler watermark never moves backwards, so occurrences at
        // or before the cutoff cannot refire; their dedup records can go.
        guard.recurring_runs.retain(|(_, run_at)| *run_at > cutoff);
        Ok(stale.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProcessKind;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn request(queue: &str) -> JobRequest {
        JobRequest::new(queue, "noop")
    }

    async fn state_of(store: &MemoryStore, job_id: JobId) -> ExecutionState {
        store.job_state(job_id).await.unwrap().unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission + placement
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_enqueue_immediate_lands_ready() {
        let store = MemoryStore::new();
        let enqueued = store.enqueue(request("default"), t0()).await.unwrap();

        assert_eq!(enqueued.state, ExecutionState::Ready);
        assert_eq!(state_of(&store, enqueued.job_id).await, ExecutionState::Ready);
        assert_eq!(store.counts().await.unwrap().queue("default").ready, 1);
    }

    #[tokio::test]
    async fn test_enqueue_future_lands_scheduled() {
        let store = MemoryStore::new();
        let enqueued = store
            .enqueue(request("default").schedule_at(t0() + secs(60)), t0())
            .await
            .unwrap();

        assert_eq!(enqueued.state, ExecutionState::Scheduled);
    }

    #[tokio::test]
    async fn test_enqueue_past_schedule_lands_ready() {
        let store = MemoryStore::new();
        let enqueued = store
            .enqueue(request("default").schedule_at(t0() - secs(60)), t0())
            .await
            .unwrap();

        assert_eq!(enqueued.state, ExecutionState::Ready);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_request() {
        let store = MemoryStore::new();
        let result = store.enqueue(request(""), t0()).await;

        assert!(result.is_err());
        assert!(store.counts().await.unwrap().by_queue.is_empty());
    }

    #[tokio::test]
    async fn test_ids_increase_in_submission_order() {
        let store = MemoryStore::new();
        let a = store.enqueue(request("default"), t0()).await.unwrap();
        let b = store.enqueue(request("default"), t0()).await.unwrap();

        assert!(b.job_id > a.job_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claiming
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_id() {
        let store = MemoryStore::new();
        let low = store
            .enqueue(request("default").with_priority(1), t0())
            .await
            .unwrap();
        let high_a = store
            .enqueue(request("default").with_priority(5), t0())
            .await
            .unwrap();
        let high_b = store
            .enqueue(request("default").with_priority(5), t0())
            .await
            .unwrap();

        let claimed = store
            .claim(ProcessId::new(), &[], 10, t0())
            .await
            .unwrap();
        let order: Vec<JobId> = claimed.iter().map(|c| c.job.id).collect();

        assert_eq!(order, vec![high_a.job_id, high_b.job_id, low.job_id]);
    }

    #[tokio::test]
    async fn test_claim_respects_queue_filter_and_batch() {
        let store = MemoryStore::new();
        store.enqueue(request("mailers"), t0()).await.unwrap();
        store.enqueue(request("default"), t0()).await.unwrap();
        store.enqueue(request("default"), t0()).await.unwrap();

        let claimed = store
            .claim(ProcessId::new(), &["default".to_string()], 1, t0())
            .await
            .unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.queue, "default");
    }

    #[tokio::test]
    async fn test_claim_moves_jobs_exclusively() {
        let store = MemoryStore::new();
        for _ in 0..4 {
            store.enqueue(request("default"), t0()).await.unwrap();
        }

        let first = store.claim(ProcessId::new(), &[], 3, t0()).await.unwrap();
        let second = store.claim(ProcessId::new(), &[], 3, t0()).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 1);
        let mut all: Vec<JobId> = first.iter().chain(&second).map(|c| c.job.id).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_claim_skips_paused_queue() {
        let store = MemoryStore::new();
        store.enqueue(request("default"), t0()).await.unwrap();
        store.pause_queue("default").await.unwrap();

        assert!(store
            .claim(ProcessId::new(), &[], 10, t0())
            .await
            .unwrap()
            .is_empty());

        store.resume_queue("default").await.unwrap();
        assert_eq!(
            store.claim(ProcessId::new(), &[], 10, t0()).await.unwrap().len(),
            1
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Terminal transitions
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_mark_finished_keeps_job_row_and_is_idempotent() {
        let store = MemoryStore::new();
        let enqueued = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();

        assert!(store.mark_finished(enqueued.job_id, t0()).await.unwrap());
        assert!(!store.mark_finished(enqueued.job_id, t0()).await.unwrap());

        let job = store.job(enqueued.job_id).await.unwrap().unwrap();
        assert_eq!(job.finished_at, Some(t0()));
        assert_eq!(
            state_of(&store, enqueued.job_id).await,
            ExecutionState::Finished
        );
        assert_eq!(store.counts().await.unwrap().queue("default").claimed, 0);
    }

    #[tokio::test]
    async fn test_mark_failed_records_error() {
        let store = MemoryStore::new();
        let enqueued = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();

        let error = ExecutionError::fatal("boom").with_code("handler");
        assert!(store.mark_failed(enqueued.job_id, error, t0()).await.unwrap());

        let failed = store.failed_executions(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, enqueued.job_id);
        assert_eq!(failed[0].error.code.as_deref(), Some("handler"));
        assert_eq!(
            state_of(&store, enqueued.job_id).await,
            ExecutionState::Failed
        );
    }

    #[tokio::test]
    async fn test_prune_finished_respects_cutoff() {
        let store = MemoryStore::new();
        let enqueued = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();
        store.mark_finished(enqueued.job_id, t0()).await.unwrap();

        // Too recent to prune with a one-hour retention.
        assert_eq!(
            store.prune_finished(secs(3600), t0() + secs(60)).await.unwrap(),
            0
        );
        assert_eq!(
            store.prune_finished(secs(3600), t0() + secs(3601)).await.unwrap(),
            1
        );
        assert!(store.job(enqueued.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_finished_trims_recurring_run_records() {
        let store = MemoryStore::new();
        let old_run = t0() - secs(30 * 86_400);
        let new_run = t0() - secs(60);

        let old = store
            .enqueue_recurring(request("default"), "digest", old_run, old_run)
            .await
            .unwrap()
            .unwrap();
        store.claim(ProcessId::new(), &[], 1, old_run).await.unwrap();
        store.mark_finished(old.job_id, old_run).await.unwrap();
        store
            .enqueue_recurring(request("default"), "digest", new_run, new_run)
            .await
            .unwrap();

        // One-day retention: the month-old job row and its run record go,
        // the minute-old record stays.
        assert_eq!(store.prune_finished(secs(86_400), t0()).await.unwrap(), 1);
        assert!(store.job(old.job_id).await.unwrap().is_none());
        assert!(store
            .enqueue_recurring(request("default"), "digest", old_run, t0())
            .await
            .unwrap()
            .is_some());
        assert!(store
            .enqueue_recurring(request("default"), "digest", new_run, t0())
            .await
            .unwrap()
            .is_none());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Concurrency keys
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_semaphore_blocks_past_limit() {
        let store = MemoryStore::new();
        let first = store
            .enqueue(request("default").with_concurrency_key("user:1"), t0())
            .await
            .unwrap();
        let second = store
            .enqueue(request("default").with_concurrency_key("user:1"), t0())
            .await
            .unwrap();

        assert_eq!(first.state, ExecutionState::Ready);
        assert_eq!(second.state, ExecutionState::Blocked);

        let semaphore = store.semaphore("user:1").await.unwrap().unwrap();
        assert_eq!(semaphore.value, 0);
        assert_eq!(semaphore.limit, 1);
    }

    #[tokio::test]
    async fn test_limit_override_admits_more() {
        let store = MemoryStore::new();
        for _ in 0..2 {
            let enqueued = store
                .enqueue(
                    request("default")
                        .with_concurrency_key("batch")
                        .with_concurrency_limit(2),
                    t0(),
                )
                .await
                .unwrap();
            assert_eq!(enqueued.state, ExecutionState::Ready);
        }
        let third = store
            .enqueue(
                request("default")
                    .with_concurrency_key("batch")
                    .with_concurrency_limit(2),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(third.state, ExecutionState::Blocked);
    }

    #[tokio::test]
    async fn test_finish_releases_token_for_blocked_job() {
        let store = MemoryStore::new();
        let first = store
            .enqueue(request("default").with_concurrency_key("user:1"), t0())
            .await
            .unwrap();
        let second = store
            .enqueue(request("default").with_concurrency_key("user:1"), t0())
            .await
            .unwrap();

        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();
        store.mark_finished(first.job_id, t0()).await.unwrap();

        let outcome = store.release_blocked(100, t0()).await.unwrap();
        assert_eq!(outcome.unblocked, 1);
        assert_eq!(outcome.force_released, 0);
        assert_eq!(state_of(&store, second.job_id).await, ExecutionState::Ready);
    }

    #[tokio::test]
    async fn test_release_blocked_prefers_higher_priority() {
        let store = MemoryStore::new();
        let holder = store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();
        let low = store
            .enqueue(
                request("default").with_concurrency_key("k").with_priority(1),
                t0(),
            )
            .await
            .unwrap();
        let high = store
            .enqueue(
                request("default").with_concurrency_key("k").with_priority(9),
                t0(),
            )
            .await
            .unwrap();

        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();
        store.mark_finished(holder.job_id, t0()).await.unwrap();
        let outcome = store.release_blocked(100, t0()).await.unwrap();

        assert_eq!(outcome.unblocked, 1);
        assert_eq!(state_of(&store, high.job_id).await, ExecutionState::Ready);
        assert_eq!(state_of(&store, low.job_id).await, ExecutionState::Blocked);
    }

    #[tokio::test]
    async fn test_escape_valve_force_releases_expired_blocked() {
        let store = MemoryStore::new();
        store
            .enqueue(request("default").with_concurrency_key("stuck"), t0())
            .await
            .unwrap();
        let blocked = store
            .enqueue(request("default").with_concurrency_key("stuck"), t0())
            .await
            .unwrap();

        // Default expiry window is 900s; before that nothing moves.
        let early = store.release_blocked(100, t0() + secs(899)).await.unwrap();
        assert_eq!(early.total(), 0);

        let late = store.release_blocked(100, t0() + secs(901)).await.unwrap();
        assert_eq!(late.force_released, 1);
        assert_eq!(
            state_of(&store, blocked.job_id).await,
            ExecutionState::Ready
        );
    }

    #[tokio::test]
    async fn test_expired_semaphore_resets_on_next_acquire() {
        let store = MemoryStore::new();
        store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();

        // 1000s later the semaphore row has expired; capacity is treated as
        // full again and the new job takes the only token.
        let next = store
            .enqueue(
                request("default").with_concurrency_key("k"),
                t0() + secs(1000),
            )
            .await
            .unwrap();
        assert_eq!(next.state, ExecutionState::Ready);

        let semaphore = store.semaphore("k").await.unwrap().unwrap();
        assert_eq!(semaphore.value, 0);
        assert!(semaphore.expires_at > t0() + secs(1000));
    }

    #[tokio::test]
    async fn test_release_of_expired_semaphore_is_noop() {
        let store = MemoryStore::new();
        let enqueued = store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();

        // Finishing long after expiry must not resurrect the stale row.
        store
            .mark_finished(enqueued.job_id, t0() + secs(2000))
            .await
            .unwrap();
        let semaphore = store.semaphore("k").await.unwrap().unwrap();
        assert_eq!(semaphore.value, 0);
        assert!(semaphore.expires_at <= t0() + secs(2000));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling + dispatch
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_dispatch_due_moves_only_due_jobs() {
        let store = MemoryStore::new();
        let due = store
            .enqueue(request("default").schedule_at(t0() + secs(30)), t0())
            .await
            .unwrap();
        let future = store
            .enqueue(request("default").schedule_at(t0() + secs(300)), t0())
            .await
            .unwrap();

        let outcome = store.dispatch_due(100, t0() + secs(60)).await.unwrap();

        assert_eq!(outcome.to_ready, 1);
        assert_eq!(state_of(&store, due.job_id).await, ExecutionState::Ready);
        assert_eq!(
            state_of(&store, future.job_id).await,
            ExecutionState::Scheduled
        );
    }

    #[tokio::test]
    async fn test_dispatch_due_orders_by_time_then_priority() {
        let store = MemoryStore::new();
        let later_high = store
            .enqueue(
                request("default")
                    .schedule_at(t0() + secs(20))
                    .with_priority(9),
                t0(),
            )
            .await
            .unwrap();
        let earlier_low = store
            .enqueue(request("default").schedule_at(t0() + secs(10)), t0())
            .await
            .unwrap();

        // Batch of one takes the most overdue job regardless of priority.
        store.dispatch_due(1, t0() + secs(60)).await.unwrap();

        assert_eq!(
            state_of(&store, earlier_low.job_id).await,
            ExecutionState::Ready
        );
        assert_eq!(
            state_of(&store, later_high.job_id).await,
            ExecutionState::Scheduled
        );
    }

    #[tokio::test]
    async fn test_dispatch_due_sends_keyed_job_through_semaphore() {
        let store = MemoryStore::new();
        store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();
        let scheduled = store
            .enqueue(
                request("default")
                    .with_concurrency_key("k")
                    .schedule_at(t0() + secs(30)),
                t0(),
            )
            .await
            .unwrap();

        let outcome = store.dispatch_due(100, t0() + secs(60)).await.unwrap();

        assert_eq!(outcome.to_blocked, 1);
        assert_eq!(
            state_of(&store, scheduled.job_id).await,
            ExecutionState::Blocked
        );
    }

    #[tokio::test]
    async fn test_dispatch_due_skips_paused_queue() {
        let store = MemoryStore::new();
        let enqueued = store
            .enqueue(request("default").schedule_at(t0() + secs(30)), t0())
            .await
            .unwrap();
        store.pause_queue("default").await.unwrap();

        let outcome = store.dispatch_due(100, t0() + secs(60)).await.unwrap();

        assert_eq!(outcome.total(), 0);
        assert_eq!(
            state_of(&store, enqueued.job_id).await,
            ExecutionState::Scheduled
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cancellation + failed-job management
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_cancel_succeeds_only_before_claim() {
        let store = MemoryStore::new();
        let scheduled = store
            .enqueue(request("default").schedule_at(t0() + secs(60)), t0())
            .await
            .unwrap();
        let claimed = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();

        assert!(store
            .cancel_if_not_started(scheduled.job_id, t0())
            .await
            .unwrap());
        assert!(store.job(scheduled.job_id).await.unwrap().is_none());

        assert!(!store
            .cancel_if_not_started(claimed.job_id, t0())
            .await
            .unwrap());
        assert!(!store
            .cancel_if_not_started(JobId(9999), t0())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancel_ready_job_releases_its_token() {
        let store = MemoryStore::new();
        let ready = store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();
        let blocked = store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();

        assert!(store.cancel_if_not_started(ready.job_id, t0()).await.unwrap());

        let outcome = store.release_blocked(100, t0()).await.unwrap();
        assert_eq!(outcome.unblocked, 1);
        assert_eq!(state_of(&store, blocked.job_id).await, ExecutionState::Ready);
    }

    #[tokio::test]
    async fn test_retry_failed_reenters_under_same_id() {
        let store = MemoryStore::new();
        let enqueued = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();
        store
            .mark_failed(enqueued.job_id, ExecutionError::fatal("boom"), t0())
            .await
            .unwrap();

        assert!(store.retry_failed(enqueued.job_id, t0()).await.unwrap());
        assert_eq!(state_of(&store, enqueued.job_id).await, ExecutionState::Ready);
        assert!(store.failed_executions(10).await.unwrap().is_empty());

        // Second retry finds no failure record.
        assert!(!store.retry_failed(enqueued.job_id, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_failed_respects_semaphore() {
        let store = MemoryStore::new();
        let failed = store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();
        store
            .mark_failed(failed.job_id, ExecutionError::fatal("boom"), t0())
            .await
            .unwrap();

        // Another job takes the key before the retry.
        store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();

        assert!(store.retry_failed(failed.job_id, t0()).await.unwrap());
        assert_eq!(
            state_of(&store, failed.job_id).await,
            ExecutionState::Blocked
        );
    }

    #[tokio::test]
    async fn test_discard_failed_removes_everything() {
        let store = MemoryStore::new();
        let enqueued = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();
        store
            .mark_failed(enqueued.job_id, ExecutionError::fatal("boom"), t0())
            .await
            .unwrap();

        assert!(store.discard_failed(enqueued.job_id).await.unwrap());
        assert!(store.job(enqueued.job_id).await.unwrap().is_none());
        assert!(!store.discard_failed(enqueued.job_id).await.unwrap());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Processes + recovery
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reap_reclaims_jobs_of_silent_process() {
        let store = MemoryStore::new();
        let silent = ProcessRecord::new(ProcessKind::Worker, t0());
        let healthy = ProcessRecord::new(ProcessKind::Worker, t0());
        let silent_id = silent.id;
        let healthy_id = healthy.id;
        store.register_process(silent).await.unwrap();
        store.register_process(healthy).await.unwrap();

        let job = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(silent_id, &[], 1, t0()).await.unwrap();

        // Only the healthy process keeps heartbeating.
        store.heartbeat(healthy_id, t0() + secs(250)).await.unwrap();

        let outcome = store
            .reap_dead_processes(secs(300), t0() + secs(400))
            .await
            .unwrap();

        assert_eq!(outcome.processes_reaped, 1);
        assert_eq!(outcome.jobs_reclaimed, 1);
        assert_eq!(state_of(&store, job.job_id).await, ExecutionState::Ready);

        let remaining = store.processes().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, healthy_id);

        // A reaped process can no longer heartbeat.
        assert!(!store.heartbeat(silent_id, t0() + secs(500)).await.unwrap());
    }

    #[tokio::test]
    async fn test_reap_sweeps_claims_of_unregistered_owner() {
        let store = MemoryStore::new();

        // Claimed by owners with no Process row: one never registered, so
        // there is no heartbeat to age out, only the claim itself.
        let stale = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(ProcessId::new(), &[], 1, t0()).await.unwrap();
        let fresh = store
            .enqueue(request("default"), t0() + secs(350))
            .await
            .unwrap();
        store
            .claim(ProcessId::new(), &[], 1, t0() + secs(350))
            .await
            .unwrap();

        let outcome = store
            .reap_dead_processes(secs(300), t0() + secs(400))
            .await
            .unwrap();

        // Only the claim older than the threshold is swept.
        assert_eq!(outcome.processes_reaped, 0);
        assert_eq!(outcome.jobs_reclaimed, 1);
        assert_eq!(state_of(&store, stale.job_id).await, ExecutionState::Ready);
        assert_eq!(state_of(&store, fresh.job_id).await, ExecutionState::Claimed);

        let outcome = store
            .reap_dead_processes(secs(300), t0() + secs(700))
            .await
            .unwrap();
        assert_eq!(outcome.jobs_reclaimed, 1);
        assert_eq!(state_of(&store, fresh.job_id).await, ExecutionState::Ready);
    }

    #[tokio::test]
    async fn test_deregister_releases_claimed_jobs() {
        let store = MemoryStore::new();
        let worker = ProcessRecord::new(ProcessKind::Worker, t0());
        let worker_id = worker.id;
        store.register_process(worker).await.unwrap();

        let job = store.enqueue(request("default"), t0()).await.unwrap();
        store.claim(worker_id, &[], 1, t0()).await.unwrap();

        let released = store.deregister_process(worker_id, t0()).await.unwrap();

        assert_eq!(released, 1);
        assert_eq!(state_of(&store, job.job_id).await, ExecutionState::Ready);
        assert!(store.processes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reclaimed_job_keeps_its_token() {
        let store = MemoryStore::new();
        let worker = ProcessRecord::new(ProcessKind::Worker, t0());
        let worker_id = worker.id;
        store.register_process(worker).await.unwrap();

        let holder = store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();
        store.claim(worker_id, &[], 1, t0()).await.unwrap();
        store.deregister_process(worker_id, t0()).await.unwrap();

        // Back in Ready, still holding the token: a sibling stays blocked.
        assert_eq!(state_of(&store, holder.job_id).await, ExecutionState::Ready);
        let sibling = store
            .enqueue(request("default").with_concurrency_key("k"), t0())
            .await
            .unwrap();
        assert_eq!(sibling.state, ExecutionState::Blocked);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recurring executions
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_recurring_occurrence_fires_once() {
        let store = MemoryStore::new();
        let run_at = t0();

        let first = store
            .enqueue_recurring(request("default"), "cleanup", run_at, t0())
            .await
            .unwrap();
        let second = store
            .enqueue_recurring(request("default"), "cleanup", run_at, t0())
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.counts().await.unwrap().queue("default").ready, 1);

        // A different occurrence of the same task fires normally.
        let next = store
            .enqueue_recurring(request("default"), "cleanup", run_at + secs(60), t0())
            .await
            .unwrap();
        assert!(next.is_some());
    }
}
