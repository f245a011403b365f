//! Error types for payload decoding in pulselink-types.

use thiserror::Error;

/// Errors that can occur when decoding a heart-rate measurement payload.
///
/// This error type is transport-agnostic and does not include BLE-specific
/// errors (those belong in pulselink-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    /// The flags byte declared fields that exceed the payload length.
    #[error("truncated payload: declared fields need {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum payload length the flags byte declared.
        expected: usize,
        /// Actual payload length received.
        actual: usize,
    },

    /// The decoded heart-rate value is outside the protocol sanity bound (0, 255).
    #[error("heart rate value {bpm} outside protocol bound (0, 255)")]
    OutOfRange {
        /// The decoded value.
        bpm: u16,
    },
}

/// Result type alias using pulselink-types' DecodeError type.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
