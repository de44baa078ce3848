//! Configuration management.
//!
//! All durations accept humantime strings ("100ms", "5s", "15m") in config
//! files and environment variables. Environment variables use the `FLYWHEEL`
//! prefix with `__` as the section separator, e.g.
//! `FLYWHEEL__WORKER__POLL_INTERVAL=250ms`.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Main engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlywheelConfig {
    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Process supervision configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Recurring task engine configuration
    #[serde(default)]
    pub recurring: RecurringConfig,

    /// Concurrency-key semaphore defaults
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Queues this worker claims from. Empty means all queues.
    #[serde(default)]
    pub queues: Vec<String>,

    /// Jobs claimed (and executed concurrently) per poll cycle
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: usize,

    /// Sleep between empty polls (small jitter is added on top)
    #[serde(with = "humantime_serde", default = "default_worker_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            batch_size: default_worker_batch_size(),
            poll_interval: default_worker_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Sleep between dispatch ticks
    #[serde(with = "humantime_serde", default = "default_dispatcher_poll_interval")]
    pub poll_interval: Duration,

    /// Maximum scheduled/blocked rows moved per tick
    #[serde(default = "default_dispatch_batch_size")]
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_dispatcher_poll_interval(),
            batch_size: default_dispatch_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// How often each process refreshes its heartbeat
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Silence after which a process is considered dead. Should be several
    /// multiples of the heartbeat interval to tolerate transient delay.
    #[serde(with = "humantime_serde", default = "default_liveness_threshold")]
    pub liveness_threshold: Duration,

    /// Sleep between reaper scans
    #[serde(with = "humantime_serde", default = "default_reap_interval")]
    pub reap_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            liveness_threshold: default_liveness_threshold(),
            reap_interval: default_reap_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecurringConfig {
    /// Sleep between schedule evaluation ticks
    #[serde(with = "humantime_serde", default = "default_recurring_tick_interval")]
    pub tick_interval: Duration,
}

impl Default for RecurringConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_recurring_tick_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    /// Semaphore capacity used when a submission carries a concurrency key
    /// but no explicit limit
    #[serde(default = "default_concurrency_limit")]
    pub default_limit: u32,

    /// Semaphore expiry window, and the blocked-execution escape-valve
    /// horizon. Past this window a missed release no longer wedges the key.
    #[serde(with = "humantime_serde", default = "default_concurrency_duration")]
    pub duration: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_limit: default_concurrency_limit(),
            duration: default_concurrency_duration(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter (overridden by RUST_LOG when set)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_worker_batch_size() -> usize { 5 }
fn default_worker_poll_interval() -> Duration { Duration::from_millis(100) }
fn default_dispatcher_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_dispatch_batch_size() -> usize { 500 }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(60) }
fn default_liveness_threshold() -> Duration { Duration::from_secs(300) }
fn default_reap_interval() -> Duration { Duration::from_secs(30) }
fn default_recurring_tick_interval() -> Duration { Duration::from_secs(1) }
fn default_concurrency_limit() -> u32 { 1 }
fn default_concurrency_duration() -> Duration { Duration::from_secs(900) }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl FlywheelConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("FLYWHEEL").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("FLYWHEEL").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Convert a std duration to a chrono duration, saturating on overflow.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
