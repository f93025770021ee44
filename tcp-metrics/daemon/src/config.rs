//! Probe configuration
//!
//! Everything the kernel side used to hardcode is supplied here: the
//! monitored port, the attach symbols, map capacities and the socket field
//! offsets. Values come from defaults, then an optional JSON file, then
//! command-line overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tcp_metrics_common::{constants::*, CaptureConfig, SocketLayout};

/// Widest accepted bandwidth bucket, one day
pub const MAX_BANDWIDTH_INTERVAL_SECS: u64 = 86_400;

/// Full probe configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Source port kept by the send path
    pub port: u16,
    /// Kernel symbol for the receive entry point
    pub recv_symbol: String,
    /// Kernel symbol for the send entry point
    pub send_symbol: String,
    /// Attach the receive entry point
    pub recv_enabled: bool,
    /// Attach the send entry point
    pub send_enabled: bool,
    /// Size of each kernel ring buffer, in bytes
    pub ring_buffer_bytes: u32,
    /// Maximum number of processes in the byte accountant
    pub accountant_capacity: u32,
    /// Capacity of the userspace queue feeding the collector
    pub channel_capacity: usize,
    /// Width of the receive bandwidth buckets, in seconds
    pub bandwidth_interval_secs: u64,
    /// Socket field offsets for the running kernel
    pub socket_layout: LayoutConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_MONITORED_PORT,
            recv_symbol: DEFAULT_RECV_SYMBOL.to_string(),
            send_symbol: DEFAULT_SEND_SYMBOL.to_string(),
            recv_enabled: true,
            send_enabled: true,
            ring_buffer_bytes: DEFAULT_RING_BUFFER_BYTES,
            accountant_capacity: DEFAULT_ACCOUNTANT_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            bandwidth_interval_secs: 1,
            socket_layout: LayoutConfig::default(),
        }
    }
}

/// Serializable mirror of [`SocketLayout`]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub protocol: u32,
    pub family: u32,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u32,
    pub dst_port: u32,
    pub srtt_us: u32,
    pub mdev_us: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        SocketLayout::DEFAULT.into()
    }
}

impl From<SocketLayout> for LayoutConfig {
    fn from(layout: SocketLayout) -> Self {
        Self {
            protocol: layout.protocol,
            family: layout.family,
            src_addr: layout.src_addr,
            dst_addr: layout.dst_addr,
            src_port: layout.src_port,
            dst_port: layout.dst_port,
            srtt_us: layout.srtt_us,
            mdev_us: layout.mdev_us,
        }
    }
}

impl From<LayoutConfig> for SocketLayout {
    fn from(layout: LayoutConfig) -> Self {
        Self {
            protocol: layout.protocol,
            family: layout.family,
            src_addr: layout.src_addr,
            dst_addr: layout.dst_addr,
            src_port: layout.src_port,
            dst_port: layout.dst_port,
            srtt_us: layout.srtt_us,
            mdev_us: layout.mdev_us,
        }
    }
}

/// Command-line values that take precedence over the config file
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub recv_symbol: Option<String>,
    pub send_symbol: Option<String>,
    pub ring_buffer_bytes: Option<u32>,
    pub accountant_capacity: Option<u32>,
    pub channel_capacity: Option<usize>,
    pub no_recv: bool,
    pub no_send: bool,
}

impl ProbeConfig {
    /// Load a JSON config file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(symbol) = overrides.recv_symbol {
            self.recv_symbol = symbol;
        }
        if let Some(symbol) = overrides.send_symbol {
            self.send_symbol = symbol;
        }
        if let Some(bytes) = overrides.ring_buffer_bytes {
            self.ring_buffer_bytes = bytes;
        }
        if let Some(capacity) = overrides.accountant_capacity {
            self.accountant_capacity = capacity;
        }
        if let Some(capacity) = overrides.channel_capacity {
            self.channel_capacity = capacity;
        }
        if overrides.no_recv {
            self.recv_enabled = false;
        }
        if overrides.no_send {
            self.send_enabled = false;
        }
    }

    /// Reject values the kernel would refuse or that make no sense
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("Monitored port must be between 1 and 65535");
        }
        if !self.recv_enabled && !self.send_enabled {
            bail!("Both entry points are disabled; nothing to capture");
        }
        if self.recv_enabled && self.recv_symbol.trim().is_empty() {
            bail!("Receive attach symbol is empty");
        }
        if self.send_enabled && self.send_symbol.trim().is_empty() {
            bail!("Send attach symbol is empty");
        }
        if self.ring_buffer_bytes < RING_BUFFER_PAGE_SIZE
            || !self.ring_buffer_bytes.is_power_of_two()
        {
            bail!(
                "Ring buffer size must be a power of two and at least {} bytes, got {}",
                RING_BUFFER_PAGE_SIZE,
                self.ring_buffer_bytes
            );
        }
        if self.accountant_capacity == 0 {
            bail!("Accountant capacity must be >= 1");
        }
        if self.channel_capacity == 0 {
            bail!("Channel capacity must be >= 1");
        }
        if !(1..=MAX_BANDWIDTH_INTERVAL_SECS).contains(&self.bandwidth_interval_secs) {
            bail!(
                "Bandwidth interval must be between 1 and {} seconds, got {}",
                MAX_BANDWIDTH_INTERVAL_SECS,
                self.bandwidth_interval_secs
            );
        }
        Ok(())
    }

    /// Record written into the CONFIG map before attaching
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig::new(self.port, self.socket_layout.into())
    }
}
