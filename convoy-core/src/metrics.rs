//! Prometheus metrics for monitoring
//!
//! Lock-free counters, gauges and histograms rendered in the Prometheus text
//! format. These types back the convoy metrics in [`standard`]: agent
//! lifecycle, evictions, reconciliation runs and command delivery. The
//! standard set is process-wide, so an in-process cluster reports totals
//! across its nodes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    /// Create a new counter
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    /// Create a new gauge
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with default buckets
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
    }

    /// Create with custom buckets
    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        let buckets = bounds
            .into_iter()
            .map(|b| (b, AtomicU64::new(0)))
            .collect();
        
        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Observe a value
    pub fn observe(&self, value: f64) {
        // Increment count
        self.count.fetch_add(1, Ordering::Relaxed);
        
        // Add to sum (as u64 micros for precision)
        let micros = (value * 1_000_000.0) as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);

        // Increment appropriate buckets
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observe an elapsed duration in seconds
    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    /// Time a closure and record the duration
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name, bound, count.load(Ordering::Relaxed)
            ));
        }

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!(
            "{}_count {}\n",
            self.name,
            self.count.load(Ordering::Relaxed)
        ));

        output
    }
}

/// Standard Convoy metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static AGENTS_STARTED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("convoy_agents_started_total", "Total agents started on this process")
    });

    pub static AGENTS_STOPPED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("convoy_agents_stopped_total", "Total agents stopped on this process")
    });

    pub static NODES_EVICTED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("convoy_nodes_evicted_total", "Total stale nodes evicted by the health monitor")
    });

    pub static RECONCILE_RUNS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("convoy_reconcile_runs_total", "Total assignment reconciliation runs")
    });

    pub static COMMANDS_SENT: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("convoy_commands_sent_total", "Total commands delivered")
    });

    pub static COMMAND_FAILURES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("convoy_command_failures_total", "Total commands that exhausted delivery retries")
    });

    pub static ACTIVE_NODES: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("convoy_active_nodes", "Nodes with a liveness record, as seen by the leader")
    });

    pub static RUNNING_AGENTS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("convoy_running_agents", "Agents running on this process")
    });

    pub static LEADERS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("convoy_leaders", "Nodes in this process currently holding leadership")
    });

    pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("convoy_reconcile_duration_seconds", "Assignment reconciliation latency")
    });
}

/// Helper to gather all standard metrics
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::AGENTS_STARTED.to_prometheus());
    output.push_str(&standard::AGENTS_STOPPED.to_prometheus());
    output.push_str(&standard::NODES_EVICTED.to_prometheus());
    output.push_str(&standard::RECONCILE_RUNS.to_prometheus());
    output.push_str(&standard::COMMANDS_SENT.to_prometheus());
    output.push_str(&standard::COMMAND_FAILURES.to_prometheus());

    // Gauges
    output.push_str(&standard::ACTIVE_NODES.to_prometheus());
    output.push_str(&standard::RUNNING_AGENTS.to_prometheus());
    output.push_str(&standard::LEADERS.to_prometheus());

    // Histograms
    output.push_str(&standard::RECONCILE_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);
        
        counter.inc();
        assert_eq!(counter.get(), 1);
        
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        assert_eq!(gauge.get(), 0);
        
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
        
        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");
        
        histogram.observe(0.001);
        histogram.observe(0.01);
        histogram.observe(0.1);
        
        let prometheus = histogram.to_prometheus();
        assert!(prometheus.contains("test_histogram_count 3"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"0.01\"} 2"));
    }

    #[test]
    fn test_gather_covers_standard_set() {
        standard::NODES_EVICTED.inc();
        let output = gather_system_metrics();
        assert!(output.contains("# TYPE convoy_nodes_evicted_total counter"));
        assert!(output.contains("# TYPE convoy_leaders gauge"));
        assert!(output.contains("convoy_reconcile_duration_seconds_count"));
    }
}
