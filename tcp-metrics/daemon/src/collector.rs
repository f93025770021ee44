//! Metrics collection and aggregation
//!
//! Aggregates receive and send records from the kernel and derives
//! bandwidth, throughput, RTT and jitter.
//!
//! Memory is bounded for runs without a duration: RTT percentiles come from
//! a ring of recent samples, and the per-process and per-connection tables
//! evict their least recently seen entry when full.

use crate::types::*;
use log::debug;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    hash::Hash,
};

/// Throughput samples kept per process for the median
const THROUGHPUT_WINDOW: usize = 3;

/// RTT and jitter samples kept per process for the moving average
const RTT_WINDOW: usize = 5;

/// Upper bound on a plausible throughput sample (kbps)
const MAX_THROUGHPUT_KBPS: f64 = 100_000.0;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Size bounds on the collector's tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorLimits {
    /// Bandwidth buckets retained for the report
    pub bandwidth_buckets: usize,
    /// Recent smoothed RTT samples used for percentiles
    pub rtt_samples: usize,
    /// Processes tracked on the receive side and on the send side
    pub processes: usize,
    /// Connections tracked on the send side
    pub connections: usize,
}

impl Default for CollectorLimits {
    fn default() -> Self {
        Self {
            bandwidth_buckets: 3600,
            rtt_samples: 65_536,
            processes: 4096,
            connections: 4096,
        }
    }
}

/// Running send-side state of one process
#[derive(Debug, Default)]
struct ProcessState {
    events: u64,
    /// Previous (cumulative bytes, timestamp) observation
    last: Option<(u64, u64)>,
    throughput: VecDeque<f64>,
    rtt_ms: VecDeque<f64>,
    jitter_ms: VecDeque<f64>,
}

impl ProcessState {
    fn record(&mut self, event: &SendEvent) {
        self.events += 1;

        if let Some((last_bytes, last_ns)) = self.last {
            if let Some(kbps) = throughput_kbps(
                last_bytes,
                last_ns,
                event.cumulative_bytes_sent,
                event.timestamp_ns,
            ) {
                push_window(&mut self.throughput, kbps, THROUGHPUT_WINDOW);
            }
        }
        self.last = Some((event.cumulative_bytes_sent, event.timestamp_ns));

        push_window(
            &mut self.rtt_ms,
            (event.smoothed_rtt_us as f64 / 1000.0).max(1.0),
            RTT_WINDOW,
        );
        push_window(
            &mut self.jitter_ms,
            (event.rtt_variance_us as f64 / 1000.0).max(0.1),
            RTT_WINDOW,
        );
    }

    fn last_seen_ns(&self) -> u64 {
        self.last.map(|(_, ts)| ts).unwrap_or(0)
    }

    fn metrics(&self) -> ProcessMetrics {
        ProcessMetrics {
            events: self.events,
            cumulative_bytes_sent: self.last.map(|(bytes, _)| bytes).unwrap_or(0),
            throughput_kbps: median(self.throughput.iter().copied()),
            rtt_ms: mean(&self.rtt_ms),
            jitter_ms: mean(&self.jitter_ms),
        }
    }
}

/// Throughput between two cumulative observations
///
/// Returns None when time did not advance, the counter went backwards, or
/// the result is outside the plausible range. Such pairs are skipped rather
/// than recorded as 0 kbps, so a reordered or raced record does not pull
/// the median down.
fn throughput_kbps(last_bytes: u64, last_ns: u64, bytes: u64, now_ns: u64) -> Option<f64> {
    if now_ns <= last_ns || bytes < last_bytes {
        return None;
    }

    let secs = (now_ns - last_ns) as f64 / 1e9;
    let kbps = (bytes - last_bytes) as f64 * 8.0 / secs / 1000.0;

    (0.0..=MAX_THROUGHPUT_KBPS).contains(&kbps).then_some(kbps)
}

fn push_window(window: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if window.len() >= capacity {
        window.pop_front();
    }
    window.push_back(value);
}

fn mean(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

/// Free a slot for `key` by dropping the least recently seen entry
///
/// Returns true if an entry was evicted.
fn make_room<K, V>(
    map: &mut HashMap<K, V>,
    key: &K,
    capacity: usize,
    last_seen_ns: impl Fn(&V) -> u64,
) -> bool
where
    K: Clone + Eq + Hash,
{
    if map.len() < capacity || map.contains_key(key) {
        return false;
    }

    let oldest = map
        .iter()
        .min_by_key(|(_, value)| last_seen_ns(value))
        .map(|(key, _)| key.clone());

    match oldest {
        Some(oldest) => map.remove(&oldest).is_some(),
        None => false,
    }
}

/// Bytes received by one process
#[derive(Debug, Default)]
struct ReceiveTotal {
    bytes: u64,
    last_seen_ns: u64,
}

/// Running state of one connection
#[derive(Debug)]
struct ConnectionState {
    source: String,
    destination: String,
    events: u64,
    min_rtt_us: u32,
    max_rtt_us: u32,
    rtt_sum_us: u64,
    last_seen_ns: u64,
}

/// Metrics collector for aggregating capture records
pub struct MetricsCollector {
    limits: CollectorLimits,
    /// Bandwidth bucket width in nanoseconds, never zero
    interval_ns: u64,
    recv_events: u64,
    recv_bytes: u64,
    recv_by_pid: HashMap<u32, ReceiveTotal>,
    /// Received bytes per bucket, keyed by `timestamp_ns / interval_ns`
    recv_buckets: BTreeMap<u64, u64>,
    send_events: u64,
    processes: HashMap<u32, ProcessState>,
    connections: HashMap<String, ConnectionState>,
    /// Recent smoothed RTT samples (for percentile calculation)
    rtt_samples_us: VecDeque<f64>,
    histogram: RttHistogram,
    evicted: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MetricsCollector {
    /// Create a collector with `interval_secs`-wide bandwidth buckets
    pub fn new(interval_secs: u64) -> Self {
        Self::with_limits(interval_secs, CollectorLimits::default())
    }

    /// Create a collector with explicit table bounds
    pub fn with_limits(interval_secs: u64, limits: CollectorLimits) -> Self {
        Self {
            limits,
            interval_ns: interval_secs.max(1).saturating_mul(NANOS_PER_SEC),
            recv_events: 0,
            recv_bytes: 0,
            recv_by_pid: HashMap::new(),
            recv_buckets: BTreeMap::new(),
            send_events: 0,
            processes: HashMap::new(),
            connections: HashMap::new(),
            rtt_samples_us: VecDeque::new(),
            histogram: RttHistogram::default(),
            evicted: 0,
        }
    }

    /// Add a record drained from either kernel channel
    pub fn add_event(&mut self, event: &CapturedEvent) {
        match event {
            CapturedEvent::Receive(event) => self.add_receive(event),
            CapturedEvent::Send(event) => self.add_send(event),
        }
    }

    fn note_eviction(&mut self, evicted: bool, table: &str) {
        if evicted {
            self.evicted += 1;
            debug!("{} table full, evicted least recently seen entry", table);
        }
    }

    /// Add a receive record
    pub fn add_receive(&mut self, event: &ReceiveEvent) {
        self.recv_events += 1;
        self.recv_bytes += event.bytes;

        let evicted = make_room(
            &mut self.recv_by_pid,
            &event.pid,
            self.limits.processes,
            |total| total.last_seen_ns,
        );
        self.note_eviction(evicted, "receive process");
        let total = self.recv_by_pid.entry(event.pid).or_default();
        total.bytes += event.bytes;
        total.last_seen_ns = event.timestamp_ns;

        let bucket = event.timestamp_ns / self.interval_ns;
        *self.recv_buckets.entry(bucket).or_insert(0) += event.bytes;
        while self.recv_buckets.len() > self.limits.bandwidth_buckets {
            self.recv_buckets.pop_first();
        }
    }

    /// Add a send record
    pub fn add_send(&mut self, event: &SendEvent) {
        self.send_events += 1;

        let evicted = make_room(
            &mut self.processes,
            &event.pid,
            self.limits.processes,
            ProcessState::last_seen_ns,
        );
        self.note_eviction(evicted, "send process");
        self.processes.entry(event.pid).or_default().record(event);

        let rtt_us = event.smoothed_rtt_us;
        let key = connection_key(event);
        let evicted = make_room(
            &mut self.connections,
            &key,
            self.limits.connections,
            |connection| connection.last_seen_ns,
        );
        self.note_eviction(evicted, "connection");
        let connection = self
            .connections
            .entry(key)
            .or_insert_with(|| ConnectionState {
                source: format_endpoint(event.src_addr, event.src_port),
                destination: format_endpoint(event.dst_addr, event.dst_port),
                events: 0,
                min_rtt_us: u32::MAX,
                max_rtt_us: 0,
                rtt_sum_us: 0,
                last_seen_ns: 0,
            });
        connection.events += 1;
        connection.min_rtt_us = connection.min_rtt_us.min(rtt_us);
        connection.max_rtt_us = connection.max_rtt_us.max(rtt_us);
        connection.rtt_sum_us += u64::from(rtt_us);
        connection.last_seen_ns = event.timestamp_ns;

        push_window(
            &mut self.rtt_samples_us,
            f64::from(rtt_us),
            self.limits.rtt_samples.max(1),
        );
        self.histogram.add_sample(f64::from(rtt_us));
    }

    /// Received bandwidth per bucket, oldest first
    pub fn bandwidth(&self) -> Vec<BandwidthSample> {
        let interval_secs = self.interval_ns as f64 / 1e9;

        self.recv_buckets
            .iter()
            .map(|(&bucket, &bytes)| BandwidthSample {
                start_ns: bucket * self.interval_ns,
                bytes,
                kbps: bytes as f64 * 8.0 / 1000.0 / interval_secs,
            })
            .collect()
    }

    /// Generate the report
    ///
    /// # Arguments
    ///
    /// * `elapsed_secs` - Duration of collection period in seconds
    /// * `port` - Monitored source port
    /// * `capture` - Kernel-side counters at the end of the run
    /// * `channel_lost` - Records dropped by the userspace queue
    pub fn generate_report(
        &self,
        elapsed_secs: u64,
        port: u16,
        capture: CaptureStats,
        channel_lost: u64,
    ) -> TcpMetricsReport {
        let processes = self
            .processes
            .iter()
            .map(|(&pid, state)| (pid, state.metrics()))
            .collect();

        let connections = self
            .connections
            .iter()
            .map(|(key, state)| {
                (
                    key.clone(),
                    ConnectionMetrics {
                        source: state.source.clone(),
                        destination: state.destination.clone(),
                        events: state.events,
                        min_rtt_us: state.min_rtt_us,
                        max_rtt_us: state.max_rtt_us,
                        avg_rtt_us: state.rtt_sum_us as f64 / state.events as f64,
                    },
                )
            })
            .collect();

        TcpMetricsReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            port,
            receive: ReceiveSummary {
                events: self.recv_events,
                total_bytes: self.recv_bytes,
                bytes_by_pid: self
                    .recv_by_pid
                    .iter()
                    .map(|(&pid, total)| (pid, total.bytes))
                    .collect(),
                bandwidth: self.bandwidth(),
            },
            send: SendSummary {
                events: self.send_events,
                processes,
                connections,
                rtt_histogram: self.histogram.clone(),
                rtt_percentiles: calculate_percentiles(
                    self.rtt_samples_us.iter().copied().collect(),
                ),
            },
            capture,
            channel_lost,
        }
    }

    /// Get current event count
    pub fn event_count(&self) -> u64 {
        self.recv_events + self.send_events
    }

    /// Get number of unique connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get number of sending processes
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// RTT samples currently held for percentiles
    pub fn rtt_sample_count(&self) -> usize {
        self.rtt_samples_us.len()
    }

    /// Table entries dropped to stay within the limits
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }
}
