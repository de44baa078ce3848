//! Logging and metrics plumbing.
//!
//! Logging goes through `tracing`: [`init_telemetry`] installs a subscriber
//! with an env-filter (the `RUST_LOG` variable overrides the configured
//! level) and either JSON or human-readable output. Metrics go through the
//! `metrics` facade; the engine emits, and the embedding application decides
//! which recorder to install. [`describe_metrics`] registers units and help
//! text for every series the engine produces so exporters can surface them.

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

use crate::config::ObservabilityConfig;

/// Initialize the tracing subscriber.
///
/// Call this once at process startup, before the engine starts. Fails when
/// a global subscriber is already installed.
pub fn init_telemetry(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json_logging {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = fmt::layer().compact().with_target(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    }

    describe_metrics();
    Ok(())
}

/// Register descriptions for every metric series the engine emits.
///
/// Harmless without a recorder installed; call it after installing one so
/// exporters pick up the help text.
pub fn describe_metrics() {
    describe_counter!(
        "flywheel_submitted_total",
        "Jobs submitted, labeled by queue"
    );
    describe_counter!("flywheel_cancelled_total", "Jobs cancelled before claim");
    describe_counter!("flywheel_retried_total", "Failed jobs resubmitted");
    describe_counter!(
        "flywheel_jobs_total",
        "Executed jobs by queue and outcome (succeeded/failed)"
    );
    describe_histogram!(
        "flywheel_job_duration_seconds",
        Unit::Seconds,
        "Handler wall time for successful jobs, by queue and class"
    );
    describe_counter!(
        "flywheel_dispatched_total",
        "Due scheduled jobs promoted by the dispatcher, by destination (ready/blocked)"
    );
    describe_counter!(
        "flywheel_unblocked_total",
        "Blocked jobs released, by mode (acquired/forced)"
    );
    describe_counter!(
        "flywheel_recurring_triggered_total",
        "Recurring occurrences that produced a job, by task key"
    );
    describe_counter!(
        "flywheel_reaped_processes_total",
        "Registered processes removed after missing heartbeats"
    );
    describe_counter!(
        "flywheel_reclaimed_jobs_total",
        "Claimed jobs returned to their queues after their process died"
    );
    describe_gauge!(
        "flywheel_queue_depth",
        "Executions per queue and state, refreshed on each supervisor pass"
    );
    describe_counter!("flywheel_errors_total", "Errors by code");
}
