//! Kernel bindings for the capture pipeline traits
//!
//! Each type here adapts a BPF helper or map to one of the traits the
//! shared pipeline is written against.

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    maps::RingBuf,
};
use tcp_metrics_common::{
    capture::{ByteAccountant, EventSink, Submit, TaskContext},
    constants::STAT_ACCOUNTANT_FULL,
    types::CaptureConfig,
};

use crate::maps::{CONFIG, PID_BYTES, STATS};

/// Current task and clock, through BPF helpers
pub struct BpfTask;

impl TaskContext for BpfTask {
    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        unsafe { bpf_get_current_pid_tgid() }
    }

    #[inline(always)]
    fn monotonic_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }
}

/// Byte accountant backed by the PID_BYTES hash map
pub struct PidBytes;

impl ByteAccountant for PidBytes {
    #[inline(always)]
    fn get(&self, pid: u32) -> u64 {
        unsafe { PID_BYTES.get(&pid) }.copied().unwrap_or(0)
    }

    #[inline(always)]
    fn set(&self, pid: u32, total: u64) -> Result<(), i64> {
        PID_BYTES.insert(&pid, &total, 0).map_err(|err| {
            increment_stat(STAT_ACCOUNTANT_FULL);
            err
        })
    }
}

/// Channel producer backed by a ring buffer
///
/// A failed reservation means the buffer is full; the record is dropped
/// and `drop_stat` is incremented.
pub struct RingBufSink {
    ring: &'static RingBuf,
    drop_stat: u32,
}

impl RingBufSink {
    #[inline(always)]
    pub const fn new(ring: &'static RingBuf, drop_stat: u32) -> Self {
        Self { ring, drop_stat }
    }
}

impl<T: Copy + 'static> EventSink<T> for RingBufSink {
    #[inline(always)]
    fn submit(&self, record: &T) -> Submit {
        match self.ring.reserve::<T>(0) {
            Some(mut entry) => {
                entry.write(*record);
                entry.submit(0);
                Submit::Delivered
            }
            None => {
                increment_stat(self.drop_stat);
                Submit::Dropped
            }
        }
    }
}

/// Attach-time configuration, or the defaults if userspace never wrote it
#[inline(always)]
pub fn load_config() -> CaptureConfig {
    CONFIG.get(0).copied().unwrap_or(CaptureConfig::DEFAULT)
}

/// Increment a statistics counter on the current CPU
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    if let Some(count) = STATS.get_ptr_mut(stat_id) {
        unsafe { *count += 1 };
    }
}
