//! Shared types and the capture pipeline for the tcp-metrics probes
//!
//! This crate provides the wire records, the attach-time configuration,
//! shared constants, and the capture pipeline itself. It is `no_std` so
//! the eBPF program can use it; the pipeline is generic over small traits
//! so it can be tested on the host.

#![cfg_attr(not(test), no_std)]

pub mod capture;
pub mod constants;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use capture::{
    capture_receive, capture_send, ByteAccountant, CaptureOutcome, EventSink, FilterStage,
    SocketReader, Submit, TaskContext,
};
pub use constants::*;
pub use types::{CaptureConfig, ReceiveEvent, SendEvent, SocketLayout};
pub use wire::{WireError, WireRecord};
