//! Capture pipeline for the receive and send entry points
//!
//! This code runs inside the kprobes: no allocation, no loops, no blocking,
//! and nothing is ever reported back to the probed kernel function. The
//! kernel specifics (BPF helpers, probe arguments, maps, ring buffers) sit
//! behind the traits below, so the same pipeline runs against mocks on the
//! host.
//!
//! ## Send path
//!
//! ```text
//! socket? -> protocol == TCP? -> family == AF_INET? -> extract fields
//!         -> sport == port? -> read RTT -> accountant += size -> submit
//! ```
//!
//! Each `?` is an early exit producing no record. Field reads never abort
//! the pipeline: an unreadable field is zero-filled.

use crate::{
    constants::{AF_INET, IPPROTO_TCP},
    types::{CaptureConfig, ReceiveEvent, SendEvent},
};

/// Process context and clock of the probed call
pub trait TaskContext {
    /// Combined `tgid << 32 | pid` of the current task
    fn pid_tgid(&self) -> u64;

    /// Monotonic clock, nanoseconds
    fn monotonic_ns(&self) -> u64;
}

/// Bounded, fallible reads at fixed offsets from a socket pointer
///
/// Implementations copy exactly the size of the requested integer and
/// never follow pointers found in the socket.
pub trait SocketReader {
    fn read_u8(&self, offset: u32) -> Result<u8, i64>;
    fn read_u16(&self, offset: u32) -> Result<u16, i64>;
    fn read_u32(&self, offset: u32) -> Result<u32, i64>;
}

/// Per-process cumulative byte table
///
/// No locking: two CPUs updating the same pid concurrently race and the
/// last writer wins.
pub trait ByteAccountant {
    /// Current total for `pid`, 0 if the pid has not been seen
    fn get(&self, pid: u32) -> u64;

    /// Store a new total; fails when the table is full
    fn set(&self, pid: u32, total: u64) -> Result<(), i64>;
}

/// Result of submitting a record to a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submit {
    Delivered,
    /// The channel was full; the record is gone and the loss counter was bumped
    Dropped,
}

/// Producer side of a bounded streaming channel
///
/// `submit` never blocks. On a full channel it drops the new record and
/// increments the channel's loss counter.
pub trait EventSink<T> {
    fn submit(&self, record: &T) -> Submit;
}

/// Pipeline stage that ended an invocation without a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStage {
    /// Receive call that copied nothing
    NoPayload,
    NullSocket,
    Protocol,
    Family,
    Port,
}

/// What one entry point invocation did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    Emitted,
    /// Record built but the channel was full
    Dropped,
    Filtered(FilterStage),
}

impl From<Submit> for CaptureOutcome {
    #[inline(always)]
    fn from(submit: Submit) -> Self {
        match submit {
            Submit::Delivered => CaptureOutcome::Emitted,
            Submit::Dropped => CaptureOutcome::Dropped,
        }
    }
}

/// Process id (thread-group id) from a combined pid/tgid value
#[inline(always)]
pub fn pid_of(pid_tgid: u64) -> u32 {
    (pid_tgid >> 32) as u32
}

/// Receive-completion entry point
///
/// `copied` is the number of bytes handed to the process by this call.
#[inline(always)]
pub fn capture_receive<C, K>(ctx: &C, copied: i32, sink: &K) -> CaptureOutcome
where
    C: TaskContext,
    K: EventSink<ReceiveEvent>,
{
    // Window updates and wake-ups without payload
    if copied <= 0 {
        return CaptureOutcome::Filtered(FilterStage::NoPayload);
    }

    let event = ReceiveEvent {
        pid: pid_of(ctx.pid_tgid()),
        _padding: 0,
        bytes: copied as u64,
        timestamp_ns: ctx.monotonic_ns(),
    };

    sink.submit(&event).into()
}

/// Send entry point
///
/// `size` is the length of the message being sent.
#[inline(always)]
pub fn capture_send<C, S, A, K>(
    ctx: &C,
    sock: Option<&S>,
    size: u64,
    config: &CaptureConfig,
    accountant: &A,
    sink: &K,
) -> CaptureOutcome
where
    C: TaskContext,
    S: SocketReader,
    A: ByteAccountant,
    K: EventSink<SendEvent>,
{
    let sock = match sock {
        Some(sock) => sock,
        None => return CaptureOutcome::Filtered(FilterStage::NullSocket),
    };
    let layout = &config.layout;

    if sock.read_u8(layout.protocol).unwrap_or(0) != IPPROTO_TCP {
        return CaptureOutcome::Filtered(FilterStage::Protocol);
    }

    if sock.read_u16(layout.family).unwrap_or(0) != AF_INET {
        return CaptureOutcome::Filtered(FilterStage::Family);
    }

    let mut event = SendEvent {
        pid: pid_of(ctx.pid_tgid()),
        timestamp_ns: ctx.monotonic_ns(),
        src_addr: sock.read_u32(layout.src_addr).unwrap_or(0),
        dst_addr: sock.read_u32(layout.dst_addr).unwrap_or(0),
        src_port: sock.read_u16(layout.src_port).unwrap_or(0),
        // skc_dport is stored in network byte order
        dst_port: u16::from_be(sock.read_u16(layout.dst_port).unwrap_or(0)),
        ..SendEvent::default()
    };

    if event.src_port != config.port {
        return CaptureOutcome::Filtered(FilterStage::Port);
    }

    event.smoothed_rtt_us = sock.read_u32(layout.srtt_us).unwrap_or(0);
    event.rtt_variance_us = sock.read_u32(layout.mdev_us).unwrap_or(0);

    // Unsynchronised read-modify-write. A full table leaves the stored total
    // stale but the record still carries the computed value.
    let total = accountant.get(event.pid).wrapping_add(size);
    let _ = accountant.set(event.pid, total);
    event.cumulative_bytes_sent = total;

    sink.submit(&event).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{constants::*, types::SocketLayout};
    use std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
        vec::Vec,
    };

    const PID_TGID: u64 = (4321u64 << 32) | 4330;

    struct FakeTask {
        now: Cell<u64>,
    }

    impl FakeTask {
        fn new() -> Self {
            Self {
                now: Cell::new(1_000),
            }
        }
    }

    impl TaskContext for FakeTask {
        fn pid_tgid(&self) -> u64 {
            PID_TGID
        }

        fn monotonic_ns(&self) -> u64 {
            let now = self.now.get();
            self.now.set(now + 10);
            now
        }
    }

    /// Socket memory image laid out with `SocketLayout::DEFAULT`
    struct FakeSocket {
        mem: Vec<u8>,
        unreadable_from: Option<u32>,
        reads: RefCell<Vec<u32>>,
    }

    impl FakeSocket {
        fn new(protocol: u8, family: u16, sport: u16, dport: u16) -> Self {
            let layout = SocketLayout::DEFAULT;
            let mut sock = Self {
                mem: vec![0; 2048],
                unreadable_from: None,
                reads: RefCell::new(Vec::new()),
            };
            sock.write(layout.protocol, &[protocol]);
            sock.write(layout.family, &family.to_ne_bytes());
            sock.write(layout.src_addr, &[10, 0, 0, 1]);
            sock.write(layout.dst_addr, &[10, 0, 0, 2]);
            sock.write(layout.src_port, &sport.to_ne_bytes());
            sock.write(layout.dst_port, &dport.to_be_bytes());
            sock.write(layout.srtt_us, &12_000u32.to_ne_bytes());
            sock.write(layout.mdev_us, &3_000u32.to_ne_bytes());
            sock
        }

        fn tcp(sport: u16, dport: u16) -> Self {
            Self::new(IPPROTO_TCP, AF_INET, sport, dport)
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) {
            let at = offset as usize;
            self.mem[at..at + bytes.len()].copy_from_slice(bytes);
        }

        fn read<const N: usize>(&self, offset: u32) -> Result<[u8; N], i64> {
            self.reads.borrow_mut().push(offset);
            if self.unreadable_from.is_some_and(|limit| offset >= limit) {
                return Err(-14);
            }
            let at = offset as usize;
            let mut out = [0u8; N];
            out.copy_from_slice(self.mem.get(at..at + N).ok_or(-14i64)?);
            Ok(out)
        }

        fn read_offsets(&self) -> Vec<u32> {
            self.reads.borrow().clone()
        }
    }

    impl SocketReader for FakeSocket {
        fn read_u8(&self, offset: u32) -> Result<u8, i64> {
            self.read::<1>(offset).map(|b| b[0])
        }

        fn read_u16(&self, offset: u32) -> Result<u16, i64> {
            self.read::<2>(offset).map(u16::from_ne_bytes)
        }

        fn read_u32(&self, offset: u32) -> Result<u32, i64> {
            self.read::<4>(offset).map(u32::from_ne_bytes)
        }
    }

    struct FakeAccountant {
        totals: RefCell<BTreeMap<u32, u64>>,
        capacity: usize,
    }

    impl FakeAccountant {
        fn with_capacity(capacity: usize) -> Self {
            Self {
                totals: RefCell::new(BTreeMap::new()),
                capacity,
            }
        }
    }

    impl ByteAccountant for FakeAccountant {
        fn get(&self, pid: u32) -> u64 {
            self.totals.borrow().get(&pid).copied().unwrap_or(0)
        }

        fn set(&self, pid: u32, total: u64) -> Result<(), i64> {
            let mut totals = self.totals.borrow_mut();
            if !totals.contains_key(&pid) && totals.len() >= self.capacity {
                return Err(-7);
            }
            totals.insert(pid, total);
            Ok(())
        }
    }

    struct FakeSink<T> {
        records: RefCell<Vec<T>>,
        capacity: usize,
        lost: Cell<u64>,
    }

    impl<T> FakeSink<T> {
        fn with_capacity(capacity: usize) -> Self {
            Self {
                records: RefCell::new(Vec::new()),
                capacity,
                lost: Cell::new(0),
            }
        }

        fn drained(&self) -> Vec<T> {
            self.records.take()
        }
    }

    impl<T: Copy> EventSink<T> for FakeSink<T> {
        fn submit(&self, record: &T) -> Submit {
            let mut records = self.records.borrow_mut();
            if records.len() >= self.capacity {
                self.lost.set(self.lost.get() + 1);
                return Submit::Dropped;
            }
            records.push(*record);
            Submit::Delivered
        }
    }

    fn send(
        sock: Option<&FakeSocket>,
        size: u64,
        config: &CaptureConfig,
        accountant: &FakeAccountant,
        sink: &FakeSink<SendEvent>,
    ) -> CaptureOutcome {
        capture_send(&FakeTask::new(), sock, size, config, accountant, sink)
    }

    #[test]
    fn test_receive_without_payload_emits_nothing() {
        let task = FakeTask::new();
        let sink = FakeSink::with_capacity(16);

        for copied in [0, -1, -11, i32::MIN] {
            assert_eq!(
                capture_receive(&task, copied, &sink),
                CaptureOutcome::Filtered(FilterStage::NoPayload)
            );
        }
        assert!(sink.drained().is_empty());
    }

    #[test]
    fn test_receive_emits_copied_bytes() {
        let task = FakeTask::new();
        let sink = FakeSink::with_capacity(16);

        assert_eq!(capture_receive(&task, 500, &sink), CaptureOutcome::Emitted);

        let events = sink.drained();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pid, 4321);
        assert_eq!(events[0].bytes, 500);
        assert_eq!(events[0].timestamp_ns, 1_000);
        assert_eq!(events[0]._padding, 0);
    }

    #[test]
    fn test_receive_timestamps_do_not_decrease() {
        let task = FakeTask::new();
        let sink = FakeSink::with_capacity(16);

        for copied in 1..=5 {
            capture_receive(&task, copied, &sink);
        }

        let events = sink.drained();
        assert!(events.windows(2).all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
        assert!(events.iter().all(|e| e.bytes > 0));
    }

    #[test]
    fn test_send_without_socket() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);

        let outcome = send(None, 100, &CaptureConfig::DEFAULT, &accountant, &sink);

        assert_eq!(outcome, CaptureOutcome::Filtered(FilterStage::NullSocket));
        assert!(sink.drained().is_empty());
    }

    #[test]
    fn test_udp_socket_never_reaches_extraction() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);
        // Port and addresses would otherwise match
        let sock = FakeSocket::new(IPPROTO_UDP, AF_INET, 8000, 8001);

        let outcome = send(Some(&sock), 100, &CaptureConfig::DEFAULT, &accountant, &sink);

        assert_eq!(outcome, CaptureOutcome::Filtered(FilterStage::Protocol));
        assert_eq!(sock.read_offsets(), vec![SocketLayout::DEFAULT.protocol]);
        assert!(sink.drained().is_empty());
        assert_eq!(accountant.get(4321), 0);
    }

    #[test]
    fn test_ipv6_socket_never_reaches_extraction() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);
        let sock = FakeSocket::new(IPPROTO_TCP, AF_INET6, 8000, 8001);

        let outcome = send(Some(&sock), 100, &CaptureConfig::DEFAULT, &accountant, &sink);

        let layout = SocketLayout::DEFAULT;
        assert_eq!(outcome, CaptureOutcome::Filtered(FilterStage::Family));
        assert_eq!(sock.read_offsets(), vec![layout.protocol, layout.family]);
        assert!(sink.drained().is_empty());
    }

    #[test]
    fn test_unreadable_protocol_is_treated_as_non_tcp() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);
        let mut sock = FakeSocket::tcp(8000, 8001);
        sock.unreadable_from = Some(0);

        let outcome = send(Some(&sock), 100, &CaptureConfig::DEFAULT, &accountant, &sink);

        assert_eq!(outcome, CaptureOutcome::Filtered(FilterStage::Protocol));
    }

    #[test]
    fn test_other_source_port_is_filtered() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);
        let sock = FakeSocket::tcp(443, 8000);

        let outcome = send(Some(&sock), 100, &CaptureConfig::DEFAULT, &accountant, &sink);

        assert_eq!(outcome, CaptureOutcome::Filtered(FilterStage::Port));
        assert!(sink.drained().is_empty());
        assert_eq!(accountant.get(4321), 0);
    }

    #[test]
    fn test_send_event_fields() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);
        let sock = FakeSocket::tcp(8000, 51234);

        let outcome = send(Some(&sock), 1448, &CaptureConfig::DEFAULT, &accountant, &sink);
        assert_eq!(outcome, CaptureOutcome::Emitted);

        let events = sink.drained();
        assert_eq!(events.len(), 1);
        let event = events[0];
        assert_eq!(event.pid, 4321);
        assert_eq!(event.src_addr, u32::from_ne_bytes([10, 0, 0, 1]));
        assert_eq!(event.dst_addr, u32::from_ne_bytes([10, 0, 0, 2]));
        assert_eq!(event.src_port, 8000);
        assert_eq!(event.dst_port, 51234);
        assert_eq!(event.smoothed_rtt_us, 12_000);
        assert_eq!(event.rtt_variance_us, 3_000);
        assert_eq!(event.cumulative_bytes_sent, 1448);
        assert_eq!(event.timestamp_ns, 1_000);
    }

    #[test]
    fn test_destination_port_is_converted_to_host_order() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);
        let mut sock = FakeSocket::tcp(8000, 0);
        let raw_dport = 8001u16.to_be();
        sock.write(SocketLayout::DEFAULT.dst_port, &raw_dport.to_ne_bytes());

        send(Some(&sock), 10, &CaptureConfig::DEFAULT, &accountant, &sink);

        let events = sink.drained();
        assert_eq!(events[0].dst_port, 8001);
        assert_eq!(events[0].dst_port, u16::from_be(raw_dport));
    }

    #[test]
    fn test_cumulative_bytes_follow_running_sum() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);
        let sock = FakeSocket::tcp(8000, 8001);

        for size in [100, 200, 50] {
            send(Some(&sock), size, &CaptureConfig::DEFAULT, &accountant, &sink);
        }

        let totals: Vec<u64> = sink
            .drained()
            .iter()
            .map(|e| e.cumulative_bytes_sent)
            .collect();
        assert_eq!(totals, vec![100, 300, 350]);
        assert_eq!(accountant.get(4321), 350);
    }

    #[test]
    fn test_unreadable_rtt_is_zero_filled() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);
        let mut sock = FakeSocket::tcp(8000, 8001);
        // Everything past sock_common is unmapped
        sock.unreadable_from = Some(SocketLayout::DEFAULT.protocol + 1);

        let outcome = send(Some(&sock), 64, &CaptureConfig::DEFAULT, &accountant, &sink);

        assert_eq!(outcome, CaptureOutcome::Emitted);
        let event = sink.drained()[0];
        assert_eq!(event.smoothed_rtt_us, 0);
        assert_eq!(event.rtt_variance_us, 0);
        assert_eq!(event.src_port, 8000);
        assert_eq!(event.cumulative_bytes_sent, 64);
    }

    #[test]
    fn test_full_accountant_still_emits() {
        let accountant = FakeAccountant::with_capacity(1);
        accountant.set(1, 10).unwrap();
        let sink = FakeSink::with_capacity(8);
        let sock = FakeSocket::tcp(8000, 8001);

        let outcome = send(Some(&sock), 300, &CaptureConfig::DEFAULT, &accountant, &sink);

        assert_eq!(outcome, CaptureOutcome::Emitted);
        assert_eq!(sink.drained()[0].cumulative_bytes_sent, 300);
        // The new pid was not stored
        assert_eq!(accountant.get(4321), 0);
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(2);
        let sock = FakeSocket::tcp(8000, 8001);

        for _ in 0..2 {
            send(Some(&sock), 1, &CaptureConfig::DEFAULT, &accountant, &sink);
        }
        assert_eq!(sink.lost.get(), 0);

        let outcome = send(Some(&sock), 1, &CaptureConfig::DEFAULT, &accountant, &sink);

        assert_eq!(outcome, CaptureOutcome::Dropped);
        assert_eq!(sink.lost.get(), 1);
        let drained = sink.drained();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|e| e.cumulative_bytes_sent <= 2));
    }

    #[test]
    fn test_configured_port() {
        let config = CaptureConfig::new(9090, SocketLayout::DEFAULT);
        let accountant = FakeAccountant::with_capacity(8);
        let sink = FakeSink::with_capacity(8);

        let default_port = FakeSocket::tcp(DEFAULT_MONITORED_PORT, 1000);
        assert_eq!(
            send(Some(&default_port), 1, &config, &accountant, &sink),
            CaptureOutcome::Filtered(FilterStage::Port)
        );

        let configured = FakeSocket::tcp(9090, 1000);
        assert_eq!(
            send(Some(&configured), 1, &config, &accountant, &sink),
            CaptureOutcome::Emitted
        );
        assert!(sink.drained().iter().all(|e| e.src_port == config.port));
    }

    #[test]
    fn test_pid_is_upper_half() {
        assert_eq!(pid_of(PID_TGID), 4321);
        assert_eq!(pid_of(u32::MAX as u64), 0);
    }
}
