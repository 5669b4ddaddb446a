//! Relay counters.
//!
//! All counters are backed by atomics for lock-free concurrent access. They
//! are emitted as a structured log line on an interval and at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters for one relay process.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Requests returned by the chain reader.
    pub requests_seen: AtomicU64,
    /// Fulfillments mined successfully by this instance.
    pub fulfilled: AtomicU64,
    /// Fulfillments that reverted because another instance won the race.
    pub reverted: AtomicU64,
    /// Requests found already fulfilled before any gas was spent.
    pub skipped: AtomicU64,
    /// Attempts that failed for any other reason.
    pub failed: AtomicU64,
    /// Chain reader polls that failed.
    pub poll_failures: AtomicU64,
    /// Sum of request-to-fulfillment latencies in blocks.
    pub latency_blocks_sum: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_requests(&self, count: usize) {
        self.requests_seen.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_fulfillment(&self, latency_blocks: u64) {
        self.fulfilled.fetch_add(1, Ordering::Relaxed);
        self.latency_blocks_sum
            .fetch_add(latency_blocks, Ordering::Relaxed);
    }

    pub fn record_revert(&self) {
        self.reverted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean blocks-to-fulfill, or 0 if nothing was fulfilled.
    pub fn avg_latency_blocks(&self) -> u64 {
        let count = self.fulfilled.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.latency_blocks_sum.load(Ordering::Relaxed) / count
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_seen": self.requests_seen.load(Ordering::Relaxed),
            "fulfilled": self.fulfilled.load(Ordering::Relaxed),
            "reverted": self.reverted.load(Ordering::Relaxed),
            "skipped": self.skipped.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "poll_failures": self.poll_failures.load(Ordering::Relaxed),
            "avg_latency_blocks": self.avg_latency_blocks(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_ignores_reverts() {
        let metrics = RelayMetrics::new();
        assert_eq!(metrics.avg_latency_blocks(), 0);
        metrics.record_fulfillment(2);
        metrics.record_fulfillment(4);
        metrics.record_revert();
        assert_eq!(metrics.avg_latency_blocks(), 3);

        let json = metrics.to_json();
        assert_eq!(json["fulfilled"], 2);
        assert_eq!(json["reverted"], 1);
    }
}
