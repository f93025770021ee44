//! eBPF program loader
//!
//! Handles sizing the maps, writing the capture config, and attaching the
//! two kprobes to their configured kernel symbols.

use crate::{config::ProbeConfig, types::CaptureStats};
use anyhow::{Context, Result};
use aya::{
    maps::{Array, MapData, PerCpuArray, RingBuf},
    programs::KProbe,
    Bpf, BpfLoader,
};
use aya_log::BpfLogger;
use log::{debug, info, warn};
use std::path::PathBuf;
use tcp_metrics_common::{constants::*, CaptureConfig};

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// Map capacities are taken from `config` before the object is loaded,
    /// since they cannot change afterwards.
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    /// * `config` - Probe configuration supplying the map sizes
    pub fn load(path: Option<PathBuf>, config: &ProbeConfig) -> Result<Self> {
        info!("Loading eBPF program...");

        let ebpf = if let Some(obj_path) = path {
            info!("Loading eBPF object from: {:?}", obj_path);
            let data = std::fs::read(&obj_path)
                .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?;
            Self::load_bytes(&data, config).context("Failed to load eBPF program")?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("Loading embedded eBPF program...");
                let data = aya::include_bytes_aligned!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../kernel/target/bpfel-unknown-none/release/tcp-metrics"
                ));
                Self::load_bytes(data, config).context("Failed to load embedded eBPF program")?
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "No eBPF object file provided. Use --ebpf-object or compile with 'embedded' feature"
                );
            }
        };

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    fn load_bytes(data: &[u8], config: &ProbeConfig) -> Result<Bpf> {
        debug!(
            "Map sizes: {}={} {}={} bytes {}={} bytes",
            MAP_PID_BYTES,
            config.accountant_capacity,
            MAP_RECV_EVENTS,
            config.ring_buffer_bytes,
            MAP_SEND_EVENTS,
            config.ring_buffer_bytes
        );

        Ok(BpfLoader::new()
            .set_max_entries(MAP_PID_BYTES, config.accountant_capacity)
            .set_max_entries(MAP_RECV_EVENTS, config.ring_buffer_bytes)
            .set_max_entries(MAP_SEND_EVENTS, config.ring_buffer_bytes)
            .load(data)?)
    }

    /// Initialize eBPF logger
    ///
    /// Forwards kernel-side log records, if the object carries any.
    /// Non-fatal if it fails.
    pub fn init_logger(&mut self) {
        if let Err(e) = BpfLogger::init(&mut self.ebpf) {
            warn!("eBPF logger not initialized: {}", e);
        }
    }

    /// Write the capture config read by the send path
    ///
    /// Must happen before attaching; until then the kernel falls back to
    /// its built-in defaults.
    pub fn write_config(&mut self, config: &CaptureConfig) -> Result<()> {
        let mut array: Array<_, CaptureConfig> = Array::try_from(
            self.ebpf
                .map_mut(MAP_CONFIG)
                .with_context(|| format!("{} map not found in eBPF object", MAP_CONFIG))?,
        )
        .with_context(|| format!("Failed to open {} as Array", MAP_CONFIG))?;

        array
            .set(0, config, 0)
            .context("Failed to write capture config")?;
        info!("Capture config written (port {})", config.port);

        Ok(())
    }

    /// Attach the enabled entry points to their configured symbols
    pub fn attach_kprobes(&mut self, config: &ProbeConfig) -> Result<()> {
        info!("Attaching kprobes...");

        if config.recv_enabled {
            self.attach_kprobe(RECV_PROGRAM, &config.recv_symbol)?;
        } else {
            info!("  - Receive capture disabled");
        }

        if config.send_enabled {
            self.attach_kprobe(SEND_PROGRAM, &config.send_symbol)?;
        } else {
            info!("  - Send capture disabled");
        }

        info!("All kprobes attached successfully");

        Ok(())
    }

    fn attach_kprobe(&mut self, program_name: &str, symbol: &str) -> Result<()> {
        let program: &mut KProbe = self
            .ebpf
            .program_mut(program_name)
            .with_context(|| format!("{} program not found in eBPF object", program_name))?
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", program_name))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", program_name))?;
        program
            .attach(symbol, 0)
            .with_context(|| format!("Failed to attach {} to {}", program_name, symbol))?;
        info!("  ✓ Attached {} to {}", program_name, symbol);

        Ok(())
    }

    /// Take the ring buffer carrying receive records
    pub fn take_recv_ring(&mut self) -> Result<RingBuf<MapData>> {
        self.take_ring(MAP_RECV_EVENTS)
    }

    /// Take the ring buffer carrying send records
    pub fn take_send_ring(&mut self) -> Result<RingBuf<MapData>> {
        self.take_ring(MAP_SEND_EVENTS)
    }

    fn take_ring(&mut self, name: &str) -> Result<RingBuf<MapData>> {
        let map = self
            .ebpf
            .take_map(name)
            .with_context(|| format!("{} map not found in eBPF object", name))?;

        RingBuf::try_from(map).with_context(|| format!("Failed to create RingBuf from {} map", name))
    }

    /// Take the per-CPU statistics array
    pub fn take_stats(&mut self) -> Result<StatsReader> {
        let map = self
            .ebpf
            .take_map(MAP_STATS)
            .with_context(|| format!("{} map not found in eBPF object", MAP_STATS))?;
        let stats = PerCpuArray::try_from(map)
            .with_context(|| format!("Failed to create PerCpuArray from {} map", MAP_STATS))?;

        Ok(StatsReader { stats })
    }
}

/// Reader for the kernel-side counters
pub struct StatsReader {
    stats: PerCpuArray<MapData, u64>,
}

impl StatsReader {
    /// Sum every counter across CPUs
    pub fn snapshot(&self) -> Result<CaptureStats> {
        let mut counters = [0u64; MAX_STATS as usize];
        for (index, counter) in counters.iter_mut().enumerate() {
            let values = self
                .stats
                .get(&(index as u32), 0)
                .with_context(|| format!("Failed to read stat {}", index))?;
            *counter = values.iter().sum();
        }

        Ok(CaptureStats::from_counters(&counters))
    }
}
