//! tcp-metrics - Kernel Space Program
//!
//! Captures TCP receive completions and sends from inside the kernel and
//! streams fixed-layout records to userspace through two ring buffers.
//!
//! ## Architecture
//!
//! ```text
//! tcp_cleanup_rbuf() -> capture_receive -> RECV_EVENTS
//!
//! tcp_sendmsg()      -> capture_send -> PID_BYTES (running total)
//!                                    -> SEND_EVENTS
//!                  |
//!                  v
//! Userspace    -> Drain ring buffers, read STATS, aggregate, export
//! ```
//!
//! The filter chain and record building live in `tcp_metrics_common::capture`;
//! this crate only binds them to BPF helpers and maps.
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo +nightly build --release
//! ```
//!
//! The compiled bytecode is then loaded by the userspace program.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod socket_parser;

// Re-export kprobe functions so they're visible to the loader
pub use handlers::{tcp_recv_capture, tcp_send_capture};

// Re-export maps for verification
pub use maps::{CONFIG, PID_BYTES, RECV_EVENTS, SEND_EVENTS, STATS};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic - this should never be reached
    // The verifier should catch any potential panics
    loop {}
}
