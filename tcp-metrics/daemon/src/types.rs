//! Userspace type definitions
//!
//! Defines the data structures used by the userspace program for
//! metrics collection and export.
//!
//! ## Organization
//!
//! This module separates kernel and userspace types:
//! - **Kernel Types**: Records shared with the eBPF program (from tcp_metrics_common)
//! - **Userspace Types**: Types used only in userspace for aggregation and export

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::Ipv4Addr};
use tcp_metrics_common::constants::*;

// ============================================================================
// Kernel Types (from the eBPF program)
// ============================================================================

pub mod kernel {
    //! Types shared between the kernel eBPF program and userspace
    //!
    //! These are re-exported from the tcp-metrics-common crate and must
    //! maintain binary compatibility with the eBPF program.

    pub use tcp_metrics_common::constants;
    pub use tcp_metrics_common::types::{CaptureConfig, ReceiveEvent, SendEvent, SocketLayout};
    pub use tcp_metrics_common::wire::{WireError, WireRecord};
}

// Re-export commonly used kernel types at module level for convenience
pub use kernel::{ReceiveEvent, SendEvent};

/// A record drained from either kernel channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturedEvent {
    Receive(ReceiveEvent),
    Send(SendEvent),
}

impl From<ReceiveEvent> for CapturedEvent {
    fn from(event: ReceiveEvent) -> Self {
        CapturedEvent::Receive(event)
    }
}

impl From<SendEvent> for CapturedEvent {
    fn from(event: SendEvent) -> Self {
        CapturedEvent::Send(event)
    }
}

/// Aggregated metrics for export
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TcpMetricsReport {
    /// ISO 8601 timestamp when the report was generated
    pub timestamp: String,
    /// Duration of collection period in seconds
    pub duration_seconds: u64,
    /// Monitored source port
    pub port: u16,
    /// Receive-side totals and bandwidth
    pub receive: ReceiveSummary,
    /// Send-side metrics for the monitored port
    pub send: SendSummary,
    /// Kernel-side counters
    pub capture: CaptureStats,
    /// Records dropped by the userspace queue
    pub channel_lost: u64,
}

/// Receive-side summary
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct ReceiveSummary {
    /// Number of receive records
    pub events: u64,
    /// Total bytes received
    pub total_bytes: u64,
    /// Bytes received per process
    pub bytes_by_pid: HashMap<u32, u64>,
    /// Received bandwidth per interval, oldest first
    pub bandwidth: Vec<BandwidthSample>,
}

/// Received bandwidth over one interval
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BandwidthSample {
    /// Interval start, monotonic nanoseconds
    pub start_ns: u64,
    /// Bytes received during the interval
    pub bytes: u64,
    /// Bandwidth in kilobits per second
    pub kbps: f64,
}

/// Send-side summary
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct SendSummary {
    /// Number of send records
    pub events: u64,
    /// Per-process metrics
    pub processes: HashMap<u32, ProcessMetrics>,
    /// Per-connection metrics, keyed "saddr:sport -> daddr:dport"
    pub connections: HashMap<String, ConnectionMetrics>,
    /// Smoothed RTT histogram across all send records
    pub rtt_histogram: RttHistogram,
    /// Smoothed RTT percentiles (microseconds)
    pub rtt_percentiles: Percentiles,
}

/// Metrics for a single sending process
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessMetrics {
    /// Number of send records
    pub events: u64,
    /// Latest cumulative bytes sent reported by the kernel
    pub cumulative_bytes_sent: u64,
    /// Median of the recent throughput samples (kbps)
    pub throughput_kbps: f64,
    /// Moving average of the smoothed RTT (ms)
    pub rtt_ms: f64,
    /// Moving average of the RTT variance (ms)
    pub jitter_ms: f64,
}

/// Metrics for a single connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionMetrics {
    /// Source address:port
    pub source: String,
    /// Destination address:port
    pub destination: String,
    /// Number of send records for this connection
    pub events: u64,
    /// Minimum smoothed RTT in microseconds
    pub min_rtt_us: u32,
    /// Maximum smoothed RTT in microseconds
    pub max_rtt_us: u32,
    /// Average smoothed RTT in microseconds
    pub avg_rtt_us: f64,
}

/// Smoothed RTT histogram buckets
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct RttHistogram {
    /// 0-1ms bucket
    #[serde(rename = "0-1ms")]
    pub bucket_0_1ms: u64,
    /// 1-5ms bucket
    #[serde(rename = "1-5ms")]
    pub bucket_1_5ms: u64,
    /// 5-10ms bucket
    #[serde(rename = "5-10ms")]
    pub bucket_5_10ms: u64,
    /// 10-50ms bucket
    #[serde(rename = "10-50ms")]
    pub bucket_10_50ms: u64,
    /// 50-100ms bucket
    #[serde(rename = "50-100ms")]
    pub bucket_50_100ms: u64,
    /// 100ms+ bucket
    #[serde(rename = "100ms+")]
    pub bucket_100ms_plus: u64,
}

impl RttHistogram {
    /// Add a sample to the appropriate bucket
    ///
    /// # Arguments
    ///
    /// * `rtt_us` - Smoothed RTT in microseconds
    pub fn add_sample(&mut self, rtt_us: f64) {
        match rtt_us {
            r if r < 1000.0 => self.bucket_0_1ms += 1,
            r if r < 5000.0 => self.bucket_1_5ms += 1,
            r if r < 10000.0 => self.bucket_5_10ms += 1,
            r if r < 50000.0 => self.bucket_10_50ms += 1,
            r if r < 100000.0 => self.bucket_50_100ms += 1,
            _ => self.bucket_100ms_plus += 1,
        }
    }

    /// Get total count across all buckets
    pub fn total_count(&self) -> u64 {
        self.bucket_0_1ms
            + self.bucket_1_5ms
            + self.bucket_5_10ms
            + self.bucket_10_50ms
            + self.bucket_50_100ms
            + self.bucket_100ms_plus
    }
}

/// RTT percentiles
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Percentiles {
    /// 50th percentile (median)
    pub p50: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
}

/// Kernel-side counters, summed over all CPUs
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub recv_emitted: u64,
    pub recv_skipped: u64,
    pub recv_dropped: u64,
    pub send_emitted: u64,
    pub send_dropped: u64,
    pub send_null_socket: u64,
    pub send_not_tcp: u64,
    pub send_not_ipv4: u64,
    pub send_port_mismatch: u64,
    pub accountant_full: u64,
}

impl CaptureStats {
    /// Build from the STATS array, indexed by the STAT_* constants
    ///
    /// Missing slots read as zero.
    pub fn from_counters(counters: &[u64]) -> Self {
        let at = |index: u32| counters.get(index as usize).copied().unwrap_or(0);

        Self {
            recv_emitted: at(STAT_RECV_EMITTED),
            recv_skipped: at(STAT_RECV_SKIPPED),
            recv_dropped: at(STAT_RECV_DROPPED),
            send_emitted: at(STAT_SEND_EMITTED),
            send_dropped: at(STAT_SEND_DROPPED),
            send_null_socket: at(STAT_SEND_NULL_SOCKET),
            send_not_tcp: at(STAT_SEND_NOT_TCP),
            send_not_ipv4: at(STAT_SEND_NOT_IPV4),
            send_port_mismatch: at(STAT_SEND_PORT_MISMATCH),
            accountant_full: at(STAT_ACCOUNTANT_FULL),
        }
    }

    /// Records lost in the kernel ring buffers
    pub fn total_dropped(&self) -> u64 {
        self.recv_dropped + self.send_dropped
    }
}

/// Calculate percentiles from a vector of samples
///
/// # Arguments
///
/// * `samples` - Vector of values (will be sorted in place)
pub fn calculate_percentiles(mut samples: Vec<f64>) -> Percentiles {
    if samples.is_empty() {
        return Percentiles::default();
    }

    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let len = samples.len();

    let percentile = |p: usize| {
        let index = std::cmp::min((len * p / 100).saturating_sub(1), len - 1);
        samples[index]
    };

    Percentiles {
        p50: percentile(50),
        p90: percentile(90),
        p95: percentile(95),
        p99: percentile(99),
    }
}

/// Median of a small sample window, 0 when empty
pub fn median(samples: impl IntoIterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = samples.into_iter().collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted[sorted.len() / 2]
}

/// Format a kernel-stored IPv4 address and host-order port
///
/// The address is the raw `skc_*addr` value, so its in-memory bytes are
/// already in network order.
pub fn format_endpoint(addr: u32, port: u16) -> String {
    format!("{}:{}", Ipv4Addr::from(addr.to_ne_bytes()), port)
}

/// Connection key "saddr:sport -> daddr:dport" for a send record
pub fn connection_key(event: &SendEvent) -> String {
    format!(
        "{} -> {}",
        format_endpoint(event.src_addr, event.src_port),
        format_endpoint(event.dst_addr, event.dst_port)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_endpoint() {
        let addr = u32::from_ne_bytes([192, 168, 1, 20]);
        assert_eq!(format_endpoint(addr, 8000), "192.168.1.20:8000");
    }

    #[test]
    fn test_connection_key() {
        let event = SendEvent {
            src_addr: u32::from_ne_bytes([10, 0, 0, 1]),
            dst_addr: u32::from_ne_bytes([10, 0, 0, 2]),
            src_port: 8000,
            dst_port: 51000,
            ..Default::default()
        };
        assert_eq!(connection_key(&event), "10.0.0.1:8000 -> 10.0.0.2:51000");
    }

    #[test]
    fn test_median() {
        assert_eq!(median(Vec::new()), 0.0);
        assert_eq!(median([3.0, 1.0, 2.0]), 2.0);
        // Upper middle for even counts
        assert_eq!(median([4.0, 1.0]), 4.0);
    }

    #[test]
    fn test_percentiles() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        let p = calculate_percentiles(samples);
        assert_eq!(p.p50, 50.0);
        assert_eq!(p.p90, 90.0);
        assert_eq!(p.p99, 99.0);

        assert_eq!(calculate_percentiles(Vec::new()), Percentiles::default());
    }

    #[test]
    fn test_capture_stats_from_counters() {
        let mut counters = vec![0u64; MAX_STATS as usize];
        counters[STAT_SEND_EMITTED as usize] = 12;
        counters[STAT_SEND_DROPPED as usize] = 2;
        counters[STAT_RECV_DROPPED as usize] = 1;
        counters[STAT_ACCOUNTANT_FULL as usize] = 5;

        let stats = CaptureStats::from_counters(&counters);
        assert_eq!(stats.send_emitted, 12);
        assert_eq!(stats.accountant_full, 5);
        assert_eq!(stats.total_dropped(), 3);

        // Short slices read as zero
        assert_eq!(CaptureStats::from_counters(&[7]).recv_emitted, 7);
        assert_eq!(CaptureStats::from_counters(&[7]).send_emitted, 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let mut histogram = RttHistogram::default();
        for rtt_us in [500.0, 2000.0, 7000.0, 30000.0, 75000.0, 150000.0] {
            histogram.add_sample(rtt_us);
        }
        assert_eq!(histogram.bucket_0_1ms, 1);
        assert_eq!(histogram.bucket_100ms_plus, 1);
        assert_eq!(histogram.total_count(), 6);
    }
}
