//! Prometheus metrics for core components.
//!
//! Sessions and quota accounting come from the scheduler; identity
//! provisioning and retirement from the identity manager.

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Sessions
// =============================================================================

/// Finished sessions by outcome.
pub static SESSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("isync_sessions_total", "Total transfer sessions by outcome"),
        &["outcome"], // "completed", "stalled", "crashed", "cancelled", "launch_failed"
    )
    .unwrap()
});

pub static SESSION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "isync_session_duration_seconds",
            "Wall-clock duration of transfer sessions",
        )
        .buckets(vec![10.0, 60.0, 300.0, 900.0, 3600.0, 4.0 * 3600.0, 12.0 * 3600.0]),
        &["outcome"],
    )
    .unwrap()
});

pub static BYTES_TRANSFERRED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "isync_bytes_transferred_total",
        "Bytes accounted across all sessions",
    )
    .unwrap()
});

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("isync_active_sessions", "Transfer sessions currently in flight").unwrap()
});

pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("isync_jobs_finished_total", "Jobs reaching a terminal state"),
        &["state"], // "completed", "failed", "cancelled"
    )
    .unwrap()
});

// =============================================================================
// Identities
// =============================================================================

pub static IDENTITIES_PROVISIONED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "isync_identities_provisioned_total",
        "Identities provisioned and activated",
    )
    .unwrap()
});

pub static IDENTITIES_RETIRED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("isync_identities_retired_total", "Identities torn down").unwrap()
});

pub static PROVISION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "isync_provision_failures_total",
            "Provisioning attempts that gave up",
        ),
        &["kind"], // DirectoryError kind or "pool_exhausted"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(SESSIONS_TOTAL.clone()),
        Box::new(SESSION_DURATION.clone()),
        Box::new(BYTES_TRANSFERRED.clone()),
        Box::new(ACTIVE_SESSIONS.clone()),
        Box::new(JOBS_FINISHED.clone()),
        Box::new(IDENTITIES_PROVISIONED.clone()),
        Box::new(IDENTITIES_RETIRED.clone()),
        Box::new(PROVISION_FAILURES.clone()),
    ]
}
