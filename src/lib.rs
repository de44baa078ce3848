//! # Flywheel
//!
//! Persistent job queue and scheduling engine.
//!
//! ## Architecture
//!
//! - **Execution Store**: One row per job plus per-state execution tables
//!   (ready, claimed, blocked, scheduled, failed); every transition is a
//!   single atomic store operation
//! - **Worker**: Claims batches by priority, runs registered handlers with
//!   panic containment, reports success or failure back to the store
//! - **Dispatcher**: Promotes due scheduled jobs and expired blocked jobs
//!   on a polling loop
//! - **Recurring Scheduler**: Cron-driven submission with a uniqueness
//!   guard, so concurrent schedulers fire each occurrence exactly once
//! - **Supervisor**: Heartbeat registry, dead-process reaping, and
//!   crash recovery (claimed jobs return to their queues)
//! - **Concurrency Controls**: Per-key semaphores cap how many jobs with
//!   the same key run at once; waiters park in Blocked and promote in
//!   priority order
//! - **Engine**: [`engine::Flywheel`] bundles the store, the handler
//!   registry, and the four services behind one embeddable handle
//!
//! ## Delivery contract
//!
//! Execution is at-least-once. A job claimed by a process that dies is
//! reclaimed and runs again, so handlers must tolerate re-execution.
//! Within one store, a job is never claimed by two live processes at once.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod job;
pub mod recurring;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use error::{FlywheelError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{
        ConcurrencyConfig, DispatcherConfig, FlywheelConfig, ObservabilityConfig,
        RecurringConfig, SupervisorConfig, WorkerConfig,
    };
    pub use crate::dispatcher::Dispatcher;
    pub use crate::engine::Flywheel;
    pub use crate::error::{FlywheelError, Result};
    pub use crate::job::{
        ExecutionError, ExecutionState, Job, JobContext, JobId, JobRequest,
    };
    pub use crate::recurring::{RecurringScheduler, RecurringTask};
    pub use crate::registry::HandlerRegistry;
    pub use crate::store::{
        ClaimedJob, DispatchOutcome, Enqueued, ExecutionStore, FailedExecution,
        MemoryStore, ProcessId, ProcessKind, ProcessRecord, QueueCounts, ReapOutcome,
        SemaphoreState, StateCounts, UnblockOutcome,
    };
    pub use crate::supervisor::Supervisor;
    pub use crate::telemetry::init_telemetry;
    pub use crate::worker::Worker;
}
