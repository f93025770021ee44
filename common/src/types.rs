//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between the eBPF program and userspace code. Explicit padding fields
//! are always written as zero.

use crate::constants::DEFAULT_MONITORED_PORT;

/// Receive-completion record
///
/// Emitted once per receive call that copied at least one byte.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceiveEvent {
    /// Process ID (thread-group id) of the receiver
    pub pid: u32,
    /// Padding for alignment
    pub _padding: u32,
    /// Bytes copied to the process in this call (always >= 1)
    pub bytes: u64,
    /// Monotonic timestamp (nanoseconds)
    pub timestamp_ns: u64,
}

/// Send record for the monitored port
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendEvent {
    /// Process ID (thread-group id) of the sender
    pub pid: u32,
    /// Source IPv4 address, as stored by the kernel (network byte order)
    pub src_addr: u32,
    /// Destination IPv4 address, as stored by the kernel (network byte order)
    pub dst_addr: u32,
    /// Source port (host byte order)
    pub src_port: u16,
    /// Destination port (host byte order)
    pub dst_port: u16,
    /// Smoothed round-trip time, raw `srtt_us` value
    pub smoothed_rtt_us: u32,
    /// Round-trip time variance, raw `mdev_us` value
    pub rtt_variance_us: u32,
    /// Running total of bytes sent by this process, including this call
    pub cumulative_bytes_sent: u64,
    /// Monotonic timestamp (nanoseconds)
    pub timestamp_ns: u64,
}

/// Byte offsets of the socket fields the send path reads
///
/// All offsets are relative to the `struct sock` pointer handed to the
/// probe. `srtt_us` and `mdev_us` live in `struct tcp_sock`, which embeds
/// `struct sock` at offset zero, so the same base pointer is used.
///
/// Layouts change between kernel builds; the defaults match a Linux 6.1
/// x86_64 build and should be checked with `pahole -C tcp_sock vmlinux`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketLayout {
    /// `sk_protocol` (read as its low byte)
    pub protocol: u32,
    /// `__sk_common.skc_family`
    pub family: u32,
    /// `__sk_common.skc_rcv_saddr`
    pub src_addr: u32,
    /// `__sk_common.skc_daddr`
    pub dst_addr: u32,
    /// `__sk_common.skc_num`, host byte order
    pub src_port: u32,
    /// `__sk_common.skc_dport`, network byte order
    pub dst_port: u32,
    /// `tcp_sock.srtt_us`
    pub srtt_us: u32,
    /// `tcp_sock.mdev_us`
    pub mdev_us: u32,
}

impl SocketLayout {
    pub const DEFAULT: Self = Self {
        protocol: 516,
        family: 16,
        src_addr: 4,
        dst_addr: 0,
        src_port: 14,
        dst_port: 12,
        srtt_us: 1752,
        mdev_us: 1756,
    };
}

impl Default for SocketLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Attach-time configuration, stored in slot 0 of the CONFIG array map
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Source port the send path keeps (host byte order)
    pub port: u16,
    /// Padding for alignment
    pub _padding: u16,
    /// Socket field offsets
    pub layout: SocketLayout,
}

impl CaptureConfig {
    pub const DEFAULT: Self = Self {
        port: DEFAULT_MONITORED_PORT,
        _padding: 0,
        layout: SocketLayout::DEFAULT,
    };

    pub const fn new(port: u16, layout: SocketLayout) -> Self {
        Self {
            port,
            _padding: 0,
            layout,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// Compile-time layout checks
// The wire format depends on these exact sizes
const _: () = {
    assert!(core::mem::size_of::<ReceiveEvent>() == 24);
    assert!(core::mem::size_of::<SendEvent>() == 40);
    assert!(core::mem::size_of::<SocketLayout>() == 32);
    assert!(core::mem::size_of::<CaptureConfig>() == 36);
    assert!(core::mem::size_of::<CaptureConfig>() % core::mem::align_of::<CaptureConfig>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for ReceiveEvent {}
    unsafe impl aya::Pod for SendEvent {}
    unsafe impl aya::Pod for SocketLayout {}
    unsafe impl aya::Pod for CaptureConfig {}
}
