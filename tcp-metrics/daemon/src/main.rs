//! tcp-metrics - Userspace Program
//!
//! Loads the eBPF capture program, writes its configuration, attaches the
//! receive and send kprobes, drains their ring buffers, and exports
//! bandwidth, throughput, RTT and jitter metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Run for 60 seconds against the default port and export to JSON
//! sudo ./tcp-metrics --duration 60 --output metrics.json
//!
//! # Monitor a different port, send path only
//! sudo ./tcp-metrics --port 9090 --no-recv
//!
//! # Use external eBPF object file and a config file
//! sudo ./tcp-metrics --ebpf-object path/to/tcp-metrics --config probe.json
//!
//! # Export to Prometheus format
//! sudo ./tcp-metrics --duration 60 --format prometheus --output metrics.prom
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tcp_metrics_userspace::{
    collector::MetricsCollector,
    config::{ConfigOverrides, ProbeConfig},
    events::EventProcessor,
    exporter::ExporterType,
    loader::ProbeLoader,
    types::{ReceiveEvent, SendEvent, TcpMetricsReport},
};
use tokio::{
    signal,
    sync::Mutex,
    time::{sleep, Instant},
};

/// TCP bandwidth, throughput and RTT capture using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Duration to run the probe (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 60)]
    duration: u64,

    /// Output file for metrics
    #[clap(short, long, default_value = "tcp-metrics.json")]
    output: PathBuf,

    /// Output format (json, prometheus)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// JSON config file; command-line flags override its values
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Source port monitored by the send path
    #[clap(short, long)]
    port: Option<u16>,

    /// Kernel symbol for the receive entry point
    #[clap(long)]
    recv_symbol: Option<String>,

    /// Kernel symbol for the send entry point
    #[clap(long)]
    send_symbol: Option<String>,

    /// Size of each kernel ring buffer in bytes (power of two, >= 4096)
    #[clap(long)]
    ring_buffer_bytes: Option<u32>,

    /// Maximum number of processes tracked by the byte accountant
    #[clap(long)]
    accountant_capacity: Option<u32>,

    /// Records buffered between the ring buffer readers and the collector
    #[clap(long)]
    channel_capacity: Option<usize>,

    /// Do not attach the receive entry point
    #[clap(long)]
    no_recv: bool,

    /// Do not attach the send entry point
    #[clap(long)]
    no_send: bool,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Path to eBPF object file (if not embedded)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// Progress reporting interval in seconds
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            port: self.port,
            recv_symbol: self.recv_symbol.clone(),
            send_symbol: self.send_symbol.clone(),
            ring_buffer_bytes: self.ring_buffer_bytes,
            accountant_capacity: self.accountant_capacity,
            channel_capacity: self.channel_capacity,
            no_recv: self.no_recv,
            no_send: self.no_send,
        }
    }

    fn probe_config(&self) -> Result<ProbeConfig> {
        let mut config = match &self.config {
            Some(path) => ProbeConfig::from_file(path)?,
            None => ProbeConfig::default(),
        };
        config.apply(self.overrides());
        config.validate().context("Invalid probe configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let config = args.probe_config()?;
    let export_format: ExporterType = args.format.parse()?;

    info!("Starting TCP metrics probe...");
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Output: {:?}", args.output);
    info!("   Format: {:?}", export_format);
    info!("   Port: {}", config.port);

    // Load eBPF program
    let mut loader = ProbeLoader::load(args.ebpf_object.clone(), &config)?;

    // Initialize eBPF logger (optional)
    loader.init_logger();

    // The send path must see the configured port before its first call
    loader.write_config(&config.capture_config())?;
    loader.attach_kprobes(&config)?;

    let recv_ring = loader.take_recv_ring()?;
    let send_ring = loader.take_send_ring()?;
    let stats = Arc::new(Mutex::new(loader.take_stats()?));

    info!("Collecting metrics...");

    let collector = Arc::new(Mutex::new(MetricsCollector::new(
        config.bandwidth_interval_secs,
    )));

    let mut processor =
        EventProcessor::new(Arc::clone(&collector), config.channel_capacity, args.verbose);
    if !processor.spawn_collector() {
        anyhow::bail!("Collector task already running");
    }
    processor.spawn_ring_reader::<ReceiveEvent>("RECV_EVENTS", recv_ring);
    processor.spawn_ring_reader::<SendEvent>("SEND_EVENTS", send_ring);
    processor.spawn_progress_reporter(args.progress_interval, Arc::clone(&stats));

    // Run for specified duration or until interrupted
    let start_time = Instant::now();
    let duration = if args.duration > 0 {
        Some(Duration::from_secs(args.duration))
    } else {
        None
    };

    if let Some(d) = duration {
        tokio::select! {
            _ = sleep(d) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }

    let elapsed = start_time.elapsed().as_secs();

    // Records still queued must reach the collector before the report
    let channel_lost = processor.shutdown().await;

    info!("Generating metrics report...");

    let capture = match stats.lock().await.snapshot() {
        Ok(capture) => capture,
        Err(e) => {
            warn!("Failed to read capture stats: {}", e);
            Default::default()
        }
    };

    let report = collector.lock().await.generate_report(
        elapsed,
        config.port,
        capture,
        channel_lost,
    );

    export_format
        .exporter(args.output.clone())
        .export(&report)?;

    info!("Metrics written to {:?}", args.output);

    print_summary(&report);

    Ok(())
}

const BANNER: &str = r#"
╔═══════════════════════════════════════════════════╗
║                  tcp-metrics                      ║
║    TCP bandwidth, throughput and RTT capture      ║
╚═══════════════════════════════════════════════════╝
    "#;

fn print_banner() {
    println!("{}", BANNER);
}

fn print_summary(report: &TcpMetricsReport) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Duration:           {} seconds", report.duration_seconds);
    info!("  Receive events:     {}", report.receive.events);
    info!("  Bytes received:     {}", report.receive.total_bytes);
    info!("  Receiving pids:     {}", report.receive.bytes_by_pid.len());
    info!("  Send events:        {}", report.send.events);
    info!("  Sending pids:       {}", report.send.processes.len());
    info!("  Unique connections: {}", report.send.connections.len());
    info!("");
    info!("  Smoothed RTT Percentiles (μs):");
    info!("    p50:  {:>10.2}", report.send.rtt_percentiles.p50);
    info!("    p90:  {:>10.2}", report.send.rtt_percentiles.p90);
    info!("    p95:  {:>10.2}", report.send.rtt_percentiles.p95);
    info!("    p99:  {:>10.2}", report.send.rtt_percentiles.p99);
    info!("");
    info!("  Per-process send metrics:");
    let mut processes: Vec<_> = report.send.processes.iter().collect();
    processes.sort_by_key(|(pid, _)| **pid);
    for (pid, process) in processes {
        info!(
            "    pid {:>7}: {:>10.2} kbps, rtt {:>7.2} ms, jitter {:>6.2} ms",
            pid, process.throughput_kbps, process.rtt_ms, process.jitter_ms
        );
    }
    info!("");
    info!("  Losses:");
    info!("    recv ring buffer: {:>8}", report.capture.recv_dropped);
    info!("    send ring buffer: {:>8}", report.capture.send_dropped);
    info!("    userspace queue:  {:>8}", report.channel_lost);
    info!("    accountant full:  {:>8}", report.capture.accountant_full);
    info!("");
    info!("============================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_names_the_binary() {
        assert!(BANNER.contains("tcp-metrics"));
        assert!(BANNER.contains("RTT capture"));
    }
}
