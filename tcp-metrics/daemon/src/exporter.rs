//! Metrics exporters
//!
//! Provides JSON and Prometheus text exporters for the capture report.

use crate::types::TcpMetricsReport;
use anyhow::{bail, Context, Result};
use std::{fmt::Write as _, fs::File, io::Write, path::PathBuf, str::FromStr};

/// Trait for metrics exporters
pub trait MetricsExporter {
    /// Export metrics
    ///
    /// # Arguments
    ///
    /// * `report` - Aggregated report to export
    fn export(&self, report: &TcpMetricsReport) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus text format
    Prometheus,
}

impl FromStr for ExporterType {
    type Err = anyhow::Error;

    fn from_str(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "json" => Ok(ExporterType::Json),
            "prometheus" | "prom" => Ok(ExporterType::Prometheus),
            _ => bail!("Unsupported format: {}. Use json or prometheus", format),
        }
    }
}

impl ExporterType {
    /// Build the exporter writing to `output_path`
    pub fn exporter(self, output_path: PathBuf) -> Box<dyn MetricsExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
        }
    }
}

fn write_file(path: &PathBuf, data: &str) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(data.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, report: &TcpMetricsReport) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };

        write_file(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn header(output: &mut String, name: &str, kind: &str, help: &str) {
        let _ = writeln!(output, "# HELP {} {}", name, help);
        let _ = writeln!(output, "# TYPE {} {}", name, kind);
    }

    /// Convert a report to Prometheus format
    fn to_prometheus_format(report: &TcpMetricsReport) -> String {
        let mut output = String::new();

        // Receive side
        Self::header(&mut output, "tcp_metrics_recv_events_total", "counter", "Receive records collected");
        let _ = writeln!(output, "tcp_metrics_recv_events_total {}\n", report.receive.events);

        Self::header(&mut output, "tcp_metrics_recv_bytes_total", "counter", "Bytes received per process");
        let mut pids: Vec<_> = report.receive.bytes_by_pid.iter().collect();
        pids.sort();
        for (pid, bytes) in pids {
            let _ = writeln!(output, "tcp_metrics_recv_bytes_total{{pid=\"{}\"}} {}", pid, bytes);
        }
        output.push('\n');

        if let Some(last) = report.receive.bandwidth.last() {
            Self::header(&mut output, "tcp_metrics_recv_bandwidth_kbps", "gauge", "Received bandwidth over the last interval");
            let _ = writeln!(output, "tcp_metrics_recv_bandwidth_kbps {}\n", last.kbps);
        }

        // Send side
        Self::header(&mut output, "tcp_metrics_send_events_total", "counter", "Send records collected on the monitored port");
        let _ = writeln!(output, "tcp_metrics_send_events_total{{port=\"{}\"}} {}\n", report.port, report.send.events);

        let mut processes: Vec<_> = report.send.processes.iter().collect();
        processes.sort_by_key(|(pid, _)| **pid);

        Self::header(&mut output, "tcp_metrics_send_throughput_kbps", "gauge", "Median send throughput per process");
        for (pid, process) in &processes {
            let _ = writeln!(output, "tcp_metrics_send_throughput_kbps{{pid=\"{}\"}} {}", pid, process.throughput_kbps);
        }
        output.push('\n');

        Self::header(&mut output, "tcp_metrics_rtt_milliseconds", "gauge", "Average smoothed RTT per process");
        for (pid, process) in &processes {
            let _ = writeln!(output, "tcp_metrics_rtt_milliseconds{{pid=\"{}\"}} {}", pid, process.rtt_ms);
        }
        output.push('\n');

        Self::header(&mut output, "tcp_metrics_jitter_milliseconds", "gauge", "Average RTT variance per process");
        for (pid, process) in &processes {
            let _ = writeln!(output, "tcp_metrics_jitter_milliseconds{{pid=\"{}\"}} {}", pid, process.jitter_ms);
        }
        output.push('\n');

        // RTT distribution
        let p = &report.send.rtt_percentiles;
        Self::header(&mut output, "tcp_metrics_rtt_microseconds", "gauge", "Smoothed RTT percentiles in microseconds");
        let _ = writeln!(output, "tcp_metrics_rtt_microseconds{{percentile=\"0.50\"}} {}", p.p50);
        let _ = writeln!(output, "tcp_metrics_rtt_microseconds{{percentile=\"0.90\"}} {}", p.p90);
        let _ = writeln!(output, "tcp_metrics_rtt_microseconds{{percentile=\"0.95\"}} {}", p.p95);
        let _ = writeln!(output, "tcp_metrics_rtt_microseconds{{percentile=\"0.99\"}} {}\n", p.p99);

        let h = &report.send.rtt_histogram;
        Self::header(&mut output, "tcp_metrics_rtt_histogram_bucket", "gauge", "Smoothed RTT histogram buckets");
        let _ = writeln!(output, "tcp_metrics_rtt_histogram_bucket{{le=\"1000\"}} {}", h.bucket_0_1ms);
        let _ = writeln!(output, "tcp_metrics_rtt_histogram_bucket{{le=\"5000\"}} {}", h.bucket_1_5ms);
        let _ = writeln!(output, "tcp_metrics_rtt_histogram_bucket{{le=\"10000\"}} {}", h.bucket_5_10ms);
        let _ = writeln!(output, "tcp_metrics_rtt_histogram_bucket{{le=\"50000\"}} {}", h.bucket_10_50ms);
        let _ = writeln!(output, "tcp_metrics_rtt_histogram_bucket{{le=\"100000\"}} {}", h.bucket_50_100ms);
        let _ = writeln!(output, "tcp_metrics_rtt_histogram_bucket{{le=\"+Inf\"}} {}\n", h.bucket_100ms_plus);

        Self::header(&mut output, "tcp_metrics_connections_total", "gauge", "Unique connections seen on the monitored port");
        let _ = writeln!(output, "tcp_metrics_connections_total {}\n", report.send.connections.len());

        // Losses
        let c = &report.capture;
        Self::header(&mut output, "tcp_metrics_dropped_total", "counter", "Records lost before reaching the collector");
        let _ = writeln!(output, "tcp_metrics_dropped_total{{stage=\"recv_ring\"}} {}", c.recv_dropped);
        let _ = writeln!(output, "tcp_metrics_dropped_total{{stage=\"send_ring\"}} {}", c.send_dropped);
        let _ = writeln!(output, "tcp_metrics_dropped_total{{stage=\"channel\"}} {}\n", report.channel_lost);

        Self::header(&mut output, "tcp_metrics_filtered_total", "counter", "Send calls filtered out by stage");
        let _ = writeln!(output, "tcp_metrics_filtered_total{{stage=\"null_socket\"}} {}", c.send_null_socket);
        let _ = writeln!(output, "tcp_metrics_filtered_total{{stage=\"protocol\"}} {}", c.send_not_tcp);
        let _ = writeln!(output, "tcp_metrics_filtered_total{{stage=\"family\"}} {}", c.send_not_ipv4);
        let _ = writeln!(output, "tcp_metrics_filtered_total{{stage=\"port\"}} {}\n", c.send_port_mismatch);

        Self::header(&mut output, "tcp_metrics_accountant_full_total", "counter", "Accountant updates rejected because the table was full");
        let _ = writeln!(output, "tcp_metrics_accountant_full_total {}\n", c.accountant_full);

        Self::header(&mut output, "tcp_metrics_duration_seconds", "gauge", "Duration of collection period");
        let _ = writeln!(output, "tcp_metrics_duration_seconds {}", report.duration_seconds);

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, report: &TcpMetricsReport) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(report))
    }
}
