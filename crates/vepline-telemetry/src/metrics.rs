use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonically increasing counter.
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide pipeline counters. Shared behind an `Arc` by every stage.
#[derive(Default)]
pub struct PipelineMetrics {
    submitted: Counter,
    rejected: Counter,
    mode_fallbacks: Counter,
    annotated: Counter,
    no_annotations: Counter,
    degraded: Counter,
    errored: Counter,
    delivered: Counter,
    dropped: Counter,
    duplicates: Counter,
    heartbeat_frames: Counter,
    heartbeat_timeouts: Counter,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub mode_fallbacks: u64,
    pub annotated: u64,
    pub no_annotations: u64,
    pub degraded: u64,
    pub errored: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub heartbeat_frames: u64,
    pub heartbeat_timeouts: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.increment();
    }

    pub fn record_rejected(&self) {
        self.rejected.increment();
    }

    /// An unrecognized mode tag was downgraded to the default lane.
    pub fn record_mode_fallback(&self) {
        self.mode_fallbacks.increment();
    }

    /// Count a worker outcome by its status tag.
    pub fn record_outcome(&self, status: &str) {
        match status {
            "annotated" => self.annotated.increment(),
            "no_annotations" => self.no_annotations.increment(),
            "degraded" => self.degraded.increment(),
            _ => self.errored.increment(),
        }
    }

    pub fn record_delivered(&self) {
        self.delivered.increment();
    }

    pub fn record_dropped(&self) {
        self.dropped.increment();
    }

    pub fn record_duplicate(&self) {
        self.duplicates.increment();
    }

    pub fn record_heartbeat_frame(&self) {
        self.heartbeat_frames.increment();
    }

    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.increment();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.get(),
            rejected: self.rejected.get(),
            mode_fallbacks: self.mode_fallbacks.get(),
            annotated: self.annotated.get(),
            no_annotations: self.no_annotations.get(),
            degraded: self.degraded.get(),
            errored: self.errored.get(),
            delivered: self.delivered.get(),
            dropped: self.dropped.get(),
            duplicates: self.duplicates.get(),
            heartbeat_frames: self.heartbeat_frames.get(),
            heartbeat_timeouts: self.heartbeat_timeouts.get(),
        }
    }
}
