use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-stage counters for one run
#[derive(Debug, Clone)]
pub struct StageMetrics {
    name: &'static str,
    /// Elements received from upstream
    received: Arc<AtomicU64>,
    /// Elements delivered downstream
    emitted: Arc<AtomicU64>,
    /// Elements discarded by the stage (filtered, skipped, evicted)
    dropped: Arc<AtomicU64>,
    /// Number of `request` calls sent upstream
    requests: Arc<AtomicU64>,
    start_time: Instant,
}

impl StageMetrics {
    /// Create a new metrics collector for a stage
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            received: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            requests: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Elements emitted per second since the stage was instantiated
    pub fn throughput_eps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_emitted() as f64 / elapsed
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stage: self.name,
            received: self.total_received(),
            emitted: self.total_emitted(),
            dropped: self.total_dropped(),
            requests: self.total_requests(),
            throughput_eps: self.throughput_eps(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub stage: &'static str,
    pub received: u64,
    pub emitted: u64,
    pub dropped: u64,
    pub requests: u64,
    pub throughput_eps: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "{}: Received: {}, Emitted: {}, Dropped: {}, Requests: {}, \
             Throughput: {:.2} elem/s, Elapsed: {:.3}s",
            self.stage,
            self.received,
            self.emitted,
            self.dropped,
            self.requests,
            self.throughput_eps,
            self.elapsed.as_secs_f64()
        )
    }
}
