// =============================================================================
// Engine Statistics — process-wide observability counters
// =============================================================================
//
// Pure observability data, never part of a correctness invariant. Counters
// are lock-free atomics updated by the HTTP layer and the producer
// supervisors, and reported by /all.json.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

pub struct EngineStats {
    pub web_requests: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub points_served: AtomicU64,
    pub producer_faults: AtomicU64,
    start_time: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub web_requests: u64,
    pub bytes_sent: u64,
    pub points_served: u64,
    pub producer_faults: u64,
    pub uptime_seconds: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            web_requests: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            points_served: AtomicU64::new(0),
            producer_faults: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn count_request(&self) {
        self.web_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn count_points(&self, points: u64) {
        self.points_served.fetch_add(points, Ordering::Relaxed);
    }

    pub fn count_producer_fault(&self) {
        self.producer_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            web_requests: self.web_requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            points_served: self.points_served.load(Ordering::Relaxed),
            producer_faults: self.producer_faults.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}
