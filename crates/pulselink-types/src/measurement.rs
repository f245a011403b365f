//! Heart-rate measurement samples and the binary payload decoder.
//!
//! The BLE Heart Rate Measurement characteristic (0x2A37) carries a small
//! flags-driven binary format:
//!
//! - byte 0: flags
//!   - bit 0: heart-rate value is 16-bit little-endian (else 8-bit)
//!   - bit 3: a 2-byte "energy expended" field follows the value
//!   - bit 4: zero or more trailing 2-byte little-endian RR-interval
//!     fields follow, each in 1/1024ths of a second
//! - byte 1..: heart-rate value, then the optional fields in the order above
//!
//! Decoding is a pure function with no side effects and is safe to run
//! against arbitrary byte sequences.

use std::time::Instant;

use bytes::Buf;

use crate::error::{DecodeError, DecodeResult};

/// Lower bound of the physiological acceptance gate, in BPM.
///
/// Samples below this are sensor artifacts and are dropped by the session
/// before they reach the conditioning pipeline.
pub const PHYSIOLOGICAL_MIN_BPM: u16 = 30;

/// Upper bound of the physiological acceptance gate, in BPM.
pub const PHYSIOLOGICAL_MAX_BPM: u16 = 250;

/// RR intervals are transmitted in 1/1024ths of a second.
const RR_TICKS_PER_SECOND: f64 = 1024.0;

/// One decoded heart-rate measurement.
///
/// Produced by [`HeartRateSample::from_bytes`] from a single inbound
/// notification payload. Immutable; consumed once by the signal conditioner.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateSample {
    /// Heart rate in beats per minute.
    pub bpm: u16,
    /// RR intervals in seconds, in transmission order. Zero-valued entries
    /// (sensor contact artifacts) are dropped during decode.
    pub rr_intervals: Vec<f64>,
    /// The raw notification payload this sample was decoded from.
    pub raw_bytes: Vec<u8>,
    /// Monotonic capture timestamp.
    pub captured_at: Instant,
}

impl HeartRateSample {
    /// Decode a Heart Rate Measurement payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] when the fields declared by the
    /// flags byte exceed the payload length (including a dangling odd byte
    /// in the RR region), and [`DecodeError::OutOfRange`] when the decoded
    /// value is not in the protocol sanity bound `(0, 255)`.
    ///
    /// # Example
    ///
    /// ```
    /// use pulselink_types::HeartRateSample;
    ///
    /// // flags: RR present, 8-bit value
    /// let sample = HeartRateSample::from_bytes(&[0x10, 70, 0x64, 0x02]).unwrap();
    /// assert_eq!(sample.bpm, 70);
    /// assert_eq!(sample.rr_intervals, vec![0x0264 as f64 / 1024.0]);
    /// ```
    pub fn from_bytes(payload: &[u8]) -> DecodeResult<Self> {
        if payload.is_empty() {
            return Err(DecodeError::Truncated {
                expected: 1,
                actual: 0,
            });
        }

        let flags = payload[0];
        let wide_value = flags & 0x01 != 0;
        let energy_present = flags & 0x08 != 0;
        let rr_present = flags & 0x10 != 0;

        let mut buf = &payload[1..];
        let value_len = if wide_value { 2 } else { 1 };

        if buf.remaining() < value_len {
            return Err(DecodeError::Truncated {
                expected: 1 + value_len,
                actual: payload.len(),
            });
        }
        let bpm = if wide_value {
            buf.get_u16_le()
        } else {
            u16::from(buf.get_u8())
        };

        // Energy expended is not surfaced, only skipped.
        if energy_present {
            if buf.remaining() < 2 {
                return Err(DecodeError::Truncated {
                    expected: 1 + value_len + 2,
                    actual: payload.len(),
                });
            }
            buf.advance(2);
        }

        let mut rr_intervals = Vec::new();
        if rr_present {
            if buf.remaining() % 2 != 0 {
                return Err(DecodeError::Truncated {
                    expected: payload.len() + 1,
                    actual: payload.len(),
                });
            }
            while buf.has_remaining() {
                let raw = buf.get_u16_le();
                if raw != 0 {
                    rr_intervals.push(f64::from(raw) / RR_TICKS_PER_SECOND);
                }
            }
        }

        if bpm == 0 || bpm >= 255 {
            return Err(DecodeError::OutOfRange { bpm });
        }

        Ok(Self {
            bpm,
            rr_intervals,
            raw_bytes: payload.to_vec(),
            captured_at: Instant::now(),
        })
    }

    /// Whether this sample passes the physiological acceptance gate
    /// ([`PHYSIOLOGICAL_MIN_BPM`]–[`PHYSIOLOGICAL_MAX_BPM`]).
    #[must_use]
    pub fn in_physiological_range(&self) -> bool {
        (PHYSIOLOGICAL_MIN_BPM..=PHYSIOLOGICAL_MAX_BPM).contains(&self.bpm)
    }
}
