//! BPF map definitions for TCP capture
//!
//! Defines the channels that carry records to userspace, the per-process
//! byte accountant, the attach-time configuration and the statistics
//! counters. Sizes here are defaults; the loader overrides them at load
//! time.

use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, PerCpuArray, RingBuf},
};
use tcp_metrics_common::{constants::*, types::CaptureConfig};

/// Attach-time configuration
///
/// Slot 0 is written by userspace before the programs are attached.
#[map]
pub static CONFIG: Array<CaptureConfig> = Array::with_max_entries(1, 0);

/// Cumulative bytes sent per process
///
/// Key: pid (thread-group id)
/// Value: u64 running total
///
/// Entries are never removed here; eviction belongs to userspace.
#[map]
pub static PID_BYTES: HashMap<u32, u64> =
    HashMap::with_max_entries(DEFAULT_ACCOUNTANT_CAPACITY, 0);

/// Ring buffer carrying ReceiveEvent records
#[map]
pub static RECV_EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RING_BUFFER_BYTES, 0);

/// Ring buffer carrying SendEvent records
#[map]
pub static SEND_EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RING_BUFFER_BYTES, 0);

/// Statistics counters, one slot per STAT_* index
///
/// Per-CPU so increments never contend; userspace sums the CPUs.
#[map]
pub static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MAX_STATS, 0);
