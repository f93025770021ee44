//! Shared constants for the tcp-metrics probes
//!
//! These constants are used by both the kernel program and the userspace
//! daemon so map names, sizes and statistic indices stay in agreement.

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Default number of processes the byte accountant can track
pub const DEFAULT_ACCOUNTANT_CAPACITY: u32 = 10240;

/// Default size of each event ring buffer, in bytes
pub const DEFAULT_RING_BUFFER_BYTES: u32 = 256 * 1024;

/// Ring buffer sizes must be a power-of-two multiple of the page size
pub const RING_BUFFER_PAGE_SIZE: u32 = 4096;

/// Default capacity of the userspace event queue between readers and the collector
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

// ============================================================================
// Filtering
// ============================================================================

/// Source port monitored by the send path unless configured otherwise
pub const DEFAULT_MONITORED_PORT: u16 = 8000;

/// TCP protocol number (linux/in.h)
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number (linux/in.h)
pub const IPPROTO_UDP: u8 = 17;

/// IPv4 address family
pub const AF_INET: u16 = 2;

/// IPv6 address family
pub const AF_INET6: u16 = 10;

// ============================================================================
// Program, Symbol and Map Names
// ============================================================================

/// Kernel symbol the receive entry point attaches to by default
pub const DEFAULT_RECV_SYMBOL: &str = "tcp_cleanup_rbuf";

/// Kernel symbol the send entry point attaches to by default
pub const DEFAULT_SEND_SYMBOL: &str = "tcp_sendmsg";

/// Receive-completion kprobe program in the eBPF object
pub const RECV_PROGRAM: &str = "tcp_recv_capture";

/// Send kprobe program in the eBPF object
pub const SEND_PROGRAM: &str = "tcp_send_capture";

pub const MAP_CONFIG: &str = "CONFIG";
pub const MAP_PID_BYTES: &str = "PID_BYTES";
pub const MAP_RECV_EVENTS: &str = "RECV_EVENTS";
pub const MAP_SEND_EVENTS: &str = "SEND_EVENTS";
pub const MAP_STATS: &str = "STATS";

// ============================================================================
// Statistics Counter Indices (for the STATS per-CPU array)
// ============================================================================

/// Receive events submitted to the ring buffer
pub const STAT_RECV_EMITTED: u32 = 0;

/// Receive calls that copied no payload
pub const STAT_RECV_SKIPPED: u32 = 1;

/// Receive events lost because the ring buffer was full
pub const STAT_RECV_DROPPED: u32 = 2;

/// Send events submitted to the ring buffer
pub const STAT_SEND_EMITTED: u32 = 3;

/// Send events lost because the ring buffer was full
pub const STAT_SEND_DROPPED: u32 = 4;

/// Send calls without a socket
pub const STAT_SEND_NULL_SOCKET: u32 = 5;

/// Send calls on a non-TCP socket
pub const STAT_SEND_NOT_TCP: u32 = 6;

/// Send calls on a non-IPv4 socket
pub const STAT_SEND_NOT_IPV4: u32 = 7;

/// Send calls whose source port is not the monitored port
pub const STAT_SEND_PORT_MISMATCH: u32 = 8;

/// Accountant updates rejected because the table was full
pub const STAT_ACCOUNTANT_FULL: u32 = 9;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 10;
