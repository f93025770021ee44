//! Fixed-offset reads from a kernel `struct sock`
//!
//! Only the socket pointer passed to the probe is ever read from. Offsets
//! come from the attach-time SocketLayout; no pointer stored inside the
//! socket is followed.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use tcp_metrics_common::capture::SocketReader;

/// A `struct sock *` taken from a probe argument
pub struct KernelSocket {
    base: *const u8,
}

impl KernelSocket {
    /// Socket from probe argument `n`, or None for a null pointer
    #[inline(always)]
    pub fn from_arg(ctx: &ProbeContext, n: usize) -> Option<Self> {
        let base = ctx.arg::<*const u8>(n)?;
        if base.is_null() {
            return None;
        }
        Some(Self { base })
    }

    /// Copy `size_of::<T>()` bytes at `offset` through bpf_probe_read_kernel
    #[inline(always)]
    fn read<T>(&self, offset: u32) -> Result<T, i64> {
        unsafe {
            let src = self.base.wrapping_add(offset as usize) as *const T;
            bpf_probe_read_kernel(src)
        }
    }
}

impl SocketReader for KernelSocket {
    #[inline(always)]
    fn read_u8(&self, offset: u32) -> Result<u8, i64> {
        self.read(offset)
    }

    #[inline(always)]
    fn read_u16(&self, offset: u32) -> Result<u16, i64> {
        self.read(offset)
    }

    #[inline(always)]
    fn read_u32(&self, offset: u32) -> Result<u32, i64> {
        self.read(offset)
    }
}
