//! Kprobe handlers for TCP capture
//!
//! Both handlers always return 0: whatever happens here, the probed kernel
//! function proceeds untouched.

use aya_ebpf::{macros::kprobe, programs::ProbeContext};
use tcp_metrics_common::{
    capture::{capture_receive, capture_send, CaptureOutcome, FilterStage},
    constants::*,
};

use crate::{
    helpers::*,
    maps::{RECV_EVENTS, SEND_EVENTS},
    socket_parser::KernelSocket,
};

/// Track bytes handed to a receiving process
///
/// Attached to: tcp_cleanup_rbuf(struct sock *sk, int copied)
#[kprobe]
pub fn tcp_recv_capture(ctx: ProbeContext) -> u32 {
    match try_tcp_recv_capture(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_tcp_recv_capture(ctx: &ProbeContext) -> Result<u32, i64> {
    let copied: i32 = ctx.arg(1).ok_or(-1i64)?;
    let sink = RingBufSink::new(&RECV_EVENTS, STAT_RECV_DROPPED);

    match capture_receive(&BpfTask, copied, &sink) {
        CaptureOutcome::Emitted => increment_stat(STAT_RECV_EMITTED),
        CaptureOutcome::Filtered(_) => increment_stat(STAT_RECV_SKIPPED),
        // Counted by the sink
        CaptureOutcome::Dropped => {}
    }

    Ok(0)
}

/// Track sends from the monitored port, with RTT and per-process totals
///
/// Attached to: tcp_sendmsg(struct sock *sk, struct msghdr *msg, size_t size)
#[kprobe]
pub fn tcp_send_capture(ctx: ProbeContext) -> u32 {
    match try_tcp_send_capture(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_tcp_send_capture(ctx: &ProbeContext) -> Result<u32, i64> {
    let size: usize = ctx.arg(2).ok_or(-1i64)?;
    let sock = KernelSocket::from_arg(ctx, 0);
    let config = load_config();
    let sink = RingBufSink::new(&SEND_EVENTS, STAT_SEND_DROPPED);

    let outcome = capture_send(
        &BpfTask,
        sock.as_ref(),
        size as u64,
        &config,
        &PidBytes,
        &sink,
    );

    match outcome {
        CaptureOutcome::Emitted => increment_stat(STAT_SEND_EMITTED),
        CaptureOutcome::Filtered(FilterStage::NullSocket) => increment_stat(STAT_SEND_NULL_SOCKET),
        CaptureOutcome::Filtered(FilterStage::Protocol) => increment_stat(STAT_SEND_NOT_TCP),
        CaptureOutcome::Filtered(FilterStage::Family) => increment_stat(STAT_SEND_NOT_IPV4),
        CaptureOutcome::Filtered(FilterStage::Port) => increment_stat(STAT_SEND_PORT_MISMATCH),
        CaptureOutcome::Filtered(FilterStage::NoPayload) | CaptureOutcome::Dropped => {}
    }

    Ok(0)
}
