//! Fixed-size sensor frame
//!
//! One frame is one reading as streamed by the peripheral: 13 payload bytes
//! followed by a NUL terminator. Frames are moved, never cloned, from the
//! acquisition thread into the mailbox and from there to the publisher.

use crate::{FRAME_LEN, FRAME_PAYLOAD_LEN};
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One captured sensor reading
#[derive(Debug, PartialEq, Eq)]
pub struct SensorFrame {
    bytes: [u8; FRAME_LEN],
    sequence: u64,
    captured_at: DateTime<Utc>,
}

impl SensorFrame {
    /// Build a frame from raw device bytes
    ///
    /// At most `FRAME_PAYLOAD_LEN` bytes are copied; the remainder is zero
    /// filled, so the frame is always NUL terminated.
    pub fn new(sequence: u64, raw: &[u8]) -> Self {
        let mut bytes = [0u8; FRAME_LEN];
        let len = raw.len().min(FRAME_PAYLOAD_LEN);
        bytes[..len].copy_from_slice(&raw[..len]);
        Self {
            bytes,
            sequence,
            captured_at: Utc::now(),
        }
    }

    /// Reading bytes up to the first NUL, without the trailing line ending
    pub fn payload(&self) -> &[u8] {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FRAME_PAYLOAD_LEN);
        let mut payload = &self.bytes[..end];
        while let [rest @ .., b'\r' | b'\n'] = payload {
            payload = rest;
        }
        payload
    }

    /// Payload as an owned buffer for the broker client
    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(self.payload())
    }

    /// Capture sequence number assigned by the acquisition thread
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Age of the frame in milliseconds
    pub fn age_millis(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.captured_at)
            .num_milliseconds()
            .max(0) as u64
    }
}
