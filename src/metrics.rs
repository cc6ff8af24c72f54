//! Statistics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time statistics of a pool
///
/// Gauges (`pool_*`, `requests_waiting`) describe the pool right now;
/// the other fields are counters accumulated since the pool was created
/// or since the last [`ConnectionPool::pop_stats`](crate::ConnectionPool::pop_stats).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct PoolStats {
    pub pool_min: u64,
    pub pool_max: u64,
    /// Connections owned by the pool: idle, borrowed, or being prepared
    pub pool_size: u64,
    /// Idle connections ready to be handed out
    pub pool_available: u64,
    /// Current length of the waiting queue
    pub requests_waiting: u64,

    /// Acquire requests received
    pub requests_num: u64,
    /// Requests that had to wait in the queue
    pub requests_queued: u64,
    /// Total time spent waiting in the queue
    pub requests_wait_ms: u64,
    /// Requests that failed with a timeout or were rejected
    pub requests_errors: u64,
    /// Total time connections were held by borrowers
    pub usage_ms: u64,
    /// Connections returned in a broken state
    pub returns_bad: u64,
    /// Connection attempts
    pub connections_num: u64,
    /// Total time spent opening connections
    pub connections_ms: u64,
    /// Failed connection attempts
    pub connections_errors: u64,
    /// Connections found dead by a pool check
    pub connections_lost: u64,
}

impl PoolStats {
    /// Export statistics as a name to value map
    pub fn export(&self) -> HashMap<String, u64> {
        [
            ("pool_min", self.pool_min),
            ("pool_max", self.pool_max),
            ("pool_size", self.pool_size),
            ("pool_available", self.pool_available),
            ("requests_waiting", self.requests_waiting),
            ("requests_num", self.requests_num),
            ("requests_queued", self.requests_queued),
            ("requests_wait_ms", self.requests_wait_ms),
            ("requests_errors", self.requests_errors),
            ("usage_ms", self.usage_ms),
            ("returns_bad", self.returns_bad),
            ("connections_num", self.connections_num),
            ("connections_ms", self.connections_ms),
            ("connections_errors", self.connections_errors),
            ("connections_lost", self.connections_lost),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

/// Current size gauges, read under the pool lock
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Gauges {
    pub min: usize,
    pub max: usize,
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export statistics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use connpool::{MetricsExporter, PoolStats};
    /// use std::collections::HashMap;
    ///
    /// let stats = PoolStats { pool_size: 4, pool_available: 3, ..Default::default() };
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&stats, "main", Some(&tags));
    /// assert!(output.contains("connpool_connections{pool=\"main\",service=\"api\"} 4"));
    /// ```
    pub fn export_prometheus(
        stats: &PoolStats,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let labels = Self::format_labels(pool_name, tags);
        let mut output = String::new();

        let gauges = [
            ("connpool_connections", "Connections owned by the pool", stats.pool_size),
            ("connpool_connections_idle", "Idle connections", stats.pool_available),
            ("connpool_connections_min", "Configured minimum size", stats.pool_min),
            ("connpool_connections_max", "Configured maximum size", stats.pool_max),
            ("connpool_requests_waiting", "Requests waiting in the queue", stats.requests_waiting),
        ];
        for (name, help, value) in gauges {
            Self::push_metric(&mut output, name, help, "gauge", &labels, value);
        }

        let counters = [
            ("connpool_requests_total", "Acquire requests", stats.requests_num),
            ("connpool_requests_queued_total", "Requests that waited", stats.requests_queued),
            ("connpool_requests_wait_ms_total", "Time spent waiting", stats.requests_wait_ms),
            ("connpool_requests_errors_total", "Failed requests", stats.requests_errors),
            ("connpool_usage_ms_total", "Time connections were borrowed", stats.usage_ms),
            ("connpool_returns_bad_total", "Broken connections returned", stats.returns_bad),
            ("connpool_connects_total", "Connection attempts", stats.connections_num),
            ("connpool_connects_ms_total", "Time spent connecting", stats.connections_ms),
            ("connpool_connects_errors_total", "Failed connection attempts", stats.connections_errors),
            ("connpool_connections_lost_total", "Connections lost", stats.connections_lost),
        ];
        for (name, help, value) in counters {
            Self::push_metric(&mut output, name, help, "counter", &labels, value);
        }

        output
    }

    fn push_metric(output: &mut String, name: &str, help: &str, kind: &str, labels: &str, value: u64) {
        output.push_str(&format!("# HELP {name} {help}\n"));
        output.push_str(&format!("# TYPE {name} {kind}\n"));
        output.push_str(&format!("{name}{{{labels}}} {value}\n"));
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal counters, updated lock-free from acquire, release and workers
#[derive(Default)]
pub(crate) struct StatsCollector {
    requests_num: AtomicU64,
    requests_queued: AtomicU64,
    requests_wait_ms: AtomicU64,
    requests_errors: AtomicU64,
    usage_ms: AtomicU64,
    returns_bad: AtomicU64,
    connections_num: AtomicU64,
    connections_ms: AtomicU64,
    connections_errors: AtomicU64,
    connections_lost: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    RequestsNum,
    RequestsQueued,
    RequestsErrors,
    ReturnsBad,
    ConnectionsNum,
    ConnectionsErrors,
    ConnectionsLost,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Timer {
    RequestsWait,
    Usage,
    Connections,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: Counter) {
        let slot = match counter {
            Counter::RequestsNum => &self.requests_num,
            Counter::RequestsQueued => &self.requests_queued,
            Counter::RequestsErrors => &self.requests_errors,
            Counter::ReturnsBad => &self.returns_bad,
            Counter::ConnectionsNum => &self.connections_num,
            Counter::ConnectionsErrors => &self.connections_errors,
            Counter::ConnectionsLost => &self.connections_lost,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, timer: Timer, elapsed: Duration) {
        let slot = match timer {
            Timer::RequestsWait => &self.requests_wait_ms,
            Timer::Usage => &self.usage_ms,
            Timer::Connections => &self.connections_ms,
        };
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        slot.fetch_add(ms, Ordering::Relaxed);
    }

    /// Live view of the counters
    pub fn snapshot(&self, gauges: Gauges) -> PoolStats {
        self.collect(gauges, |slot| slot.load(Ordering::Relaxed))
    }

    /// Counters accumulated so far; every counter restarts from zero
    pub fn take(&self, gauges: Gauges) -> PoolStats {
        self.collect(gauges, |slot| slot.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, gauges: Gauges, read: impl Fn(&AtomicU64) -> u64) -> PoolStats {
        let as_u64 = |value: usize| u64::try_from(value).unwrap_or(u64::MAX);
        PoolStats {
            pool_min: as_u64(gauges.min),
            pool_max: as_u64(gauges.max),
            pool_size: as_u64(gauges.size),
            pool_available: as_u64(gauges.available),
            requests_waiting: as_u64(gauges.waiting),
            requests_num: read(&self.requests_num),
            requests_queued: read(&self.requests_queued),
            requests_wait_ms: read(&self.requests_wait_ms),
            requests_errors: read(&self.requests_errors),
            usage_ms: read(&self.usage_ms),
            returns_bad: read(&self.returns_bad),
            connections_num: read(&self.connections_num),
            connections_ms: read(&self.connections_ms),
            connections_errors: read(&self.connections_errors),
            connections_lost: read(&self.connections_lost),
        }
    }
}
