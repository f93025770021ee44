//! Fixed-layout encoding of the records carried by the event channels
//!
//! Records travel as raw copies of their `repr(C)` structs: native byte
//! order, no framing, no length prefix. The consumer knows which record
//! type a channel carries, so the size is always static.

use core::fmt;

use crate::types::{ReceiveEvent, SendEvent};

/// Error decoding or encoding a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
    /// The buffer is shorter than the record
    Truncated { expected: usize, actual: usize },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated { expected, actual } => {
                write!(f, "record truncated: expected {expected} bytes, got {actual}")
            }
        }
    }
}

/// A record with a statically known wire size
pub trait WireRecord: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write the record into the first `SIZE` bytes of `out`
    fn encode(&self, out: &mut [u8]) -> Result<usize, WireError>;

    /// Read a record from the first `SIZE` bytes of `bytes`
    ///
    /// Trailing bytes are ignored (ring buffer entries are 8-byte aligned).
    fn decode(bytes: &[u8]) -> Result<Self, WireError>;
}

fn check_len(len: usize, expected: usize) -> Result<(), WireError> {
    if len < expected {
        return Err(WireError::Truncated {
            expected,
            actual: len,
        });
    }
    Ok(())
}

// Callers check the length first, so the slices below never go out of bounds.

fn get_u16(bytes: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&bytes[at..at + 2]);
    u16::from_ne_bytes(raw)
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

fn put(out: &mut [u8], at: usize, raw: &[u8]) {
    out[at..at + raw.len()].copy_from_slice(raw);
}

impl WireRecord for ReceiveEvent {
    const SIZE: usize = 24;

    fn encode(&self, out: &mut [u8]) -> Result<usize, WireError> {
        check_len(out.len(), Self::SIZE)?;
        put(out, 0, &self.pid.to_ne_bytes());
        put(out, 4, &0u32.to_ne_bytes());
        put(out, 8, &self.bytes.to_ne_bytes());
        put(out, 16, &self.timestamp_ns.to_ne_bytes());
        Ok(Self::SIZE)
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        check_len(bytes.len(), Self::SIZE)?;
        Ok(Self {
            pid: get_u32(bytes, 0),
            _padding: 0,
            bytes: get_u64(bytes, 8),
            timestamp_ns: get_u64(bytes, 16),
        })
    }
}

impl WireRecord for SendEvent {
    const SIZE: usize = 40;

    fn encode(&self, out: &mut [u8]) -> Result<usize, WireError> {
        check_len(out.len(), Self::SIZE)?;
        put(out, 0, &self.pid.to_ne_bytes());
        put(out, 4, &self.src_addr.to_ne_bytes());
        put(out, 8, &self.dst_addr.to_ne_bytes());
        put(out, 12, &self.src_port.to_ne_bytes());
        put(out, 14, &self.dst_port.to_ne_bytes());
        put(out, 16, &self.smoothed_rtt_us.to_ne_bytes());
        put(out, 20, &self.rtt_variance_us.to_ne_bytes());
        put(out, 24, &self.cumulative_bytes_sent.to_ne_bytes());
        put(out, 32, &self.timestamp_ns.to_ne_bytes());
        Ok(Self::SIZE)
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        check_len(bytes.len(), Self::SIZE)?;
        Ok(Self {
            pid: get_u32(bytes, 0),
            src_addr: get_u32(bytes, 4),
            dst_addr: get_u32(bytes, 8),
            src_port: get_u16(bytes, 12),
            dst_port: get_u16(bytes, 14),
            smoothed_rtt_us: get_u32(bytes, 16),
            rtt_variance_us: get_u32(bytes, 20),
            cumulative_bytes_sent: get_u64(bytes, 24),
            timestamp_ns: get_u64(bytes, 32),
        })
    }
}

const _: () = {
    assert!(<ReceiveEvent as WireRecord>::SIZE == core::mem::size_of::<ReceiveEvent>());
    assert!(<SendEvent as WireRecord>::SIZE == core::mem::size_of::<SendEvent>());
};

#[cfg(test)]
mod tests {
    use super::*;

    /// View a repr(C) record the way the kernel copies it into the ring buffer
    fn struct_bytes<T>(value: &T) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
        }
    }

    fn sample_send() -> SendEvent {
        SendEvent {
            pid: 4242,
            src_addr: u32::from_ne_bytes([10, 0, 0, 1]),
            dst_addr: u32::from_ne_bytes([10, 0, 0, 2]),
            src_port: 8000,
            dst_port: 51234,
            smoothed_rtt_us: 80_512,
            rtt_variance_us: 20_004,
            cumulative_bytes_sent: 1 << 40,
            timestamp_ns: 987_654_321_000,
        }
    }

    #[test]
    fn test_send_event_round_trip() {
        let event = sample_send();
        let mut buf = [0u8; SendEvent::SIZE];

        assert_eq!(event.encode(&mut buf), Ok(40));
        assert_eq!(SendEvent::decode(&buf), Ok(event));
    }

    #[test]
    fn test_receive_event_round_trip() {
        let event = ReceiveEvent {
            pid: 7,
            _padding: 0,
            bytes: 500,
            timestamp_ns: u64::MAX - 1,
        };
        let mut buf = [0xAAu8; ReceiveEvent::SIZE];

        event.encode(&mut buf).unwrap();
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(ReceiveEvent::decode(&buf), Ok(event));
    }

    #[test]
    fn test_encoding_matches_kernel_struct_copy() {
        let event = sample_send();
        let mut buf = [0u8; SendEvent::SIZE];
        event.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], struct_bytes(&event));

        let recv = ReceiveEvent {
            pid: 1,
            _padding: 0,
            bytes: 2,
            timestamp_ns: 3,
        };
        let mut buf = [0u8; ReceiveEvent::SIZE];
        recv.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], struct_bytes(&recv));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let event = sample_send();
        // Ring buffer entries are rounded up to 8 bytes
        let mut buf = [0u8; 48];
        event.encode(&mut buf).unwrap();

        assert_eq!(SendEvent::decode(&buf), Ok(event));
    }

    #[test]
    fn test_truncated_record() {
        let buf = [0u8; 23];
        assert_eq!(
            ReceiveEvent::decode(&buf),
            Err(WireError::Truncated {
                expected: 24,
                actual: 23
            })
        );

        let mut short = [0u8; 10];
        assert!(sample_send().encode(&mut short).is_err());
    }
}
