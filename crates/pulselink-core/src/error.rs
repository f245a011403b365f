//! Error types for pulselink-core.
//!
//! This module defines all error types that can occur while scanning for,
//! connecting to, and streaming from a heart-rate sensor.
//!
//! # Retry policy
//!
//! Connect failures fall into two classes:
//!
//! | Error | Strategy |
//! |-------|----------|
//! | [`Error::Timeout`] | Retried up to the session's `max_retries` |
//! | [`Error::Bluetooth`] | Retried, usually transient radio congestion |
//! | [`Error::ConnectFailed`] | Terminal: retries were already exhausted |
//! | [`Error::ServiceNotFound`] | Not retried, the peripheral lacks the GATT layout |
//! | [`Error::CharacteristicNotFound`] | Not retried, same reason |
//! | [`Error::Decode`] | Per-sample, dropped with a diagnostic event |
//! | [`Error::OutOfPhysiologicalRange`] | Per-sample, dropped with a diagnostic event |
//!
//! Decode and range errors never abort a session; they are surfaced as
//! [`SessionEvent::SampleDropped`](crate::events::SessionEvent) and the
//! stream continues with the next notification.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use pulselink_types::DecodeError;

/// Errors that can occur in the sensor-session pipeline.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this host.
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    /// Operation timed out.
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Connection retries were exhausted.
    #[error("connection to {address} failed after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        /// The peripheral address that could not be reached.
        address: String,
        /// How many attempts were made.
        attempts: u32,
        /// The last failure observed.
        reason: ConnectFailureReason,
    },

    /// The heart-rate service is absent from the peripheral's GATT layout.
    ///
    /// Not retried: retrying will not change peripheral capabilities.
    #[error("heart-rate service {uuid} not found on peripheral")]
    ServiceNotFound {
        /// The service UUID that was searched for.
        uuid: Uuid,
    },

    /// The measurement characteristic is absent from the heart-rate service.
    ///
    /// Not retried, for the same reason as [`Error::ServiceNotFound`].
    #[error("measurement characteristic {uuid} not found in heart-rate service")]
    CharacteristicNotFound {
        /// The characteristic UUID that was searched for.
        uuid: Uuid,
    },

    /// A notification payload failed to decode.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A decoded sample failed the physiological acceptance gate (30-250 BPM).
    #[error("heart rate {bpm} BPM outside physiological range (30-250)")]
    OutOfPhysiologicalRange {
        /// The rejected value.
        bpm: u16,
    },

    /// The link layer could not locate the peripheral for an address.
    ///
    /// Transient: the sensor may advertise again on the next attempt.
    #[error("sensor '{identifier}' not found")]
    SensorNotFound {
        /// The address or identifier that was searched for.
        identifier: String,
    },

    /// Operation attempted while no link is open.
    #[error("not connected to a sensor")]
    NotConnected,

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error (control-bridge socket).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a control-bridge frame.
    #[error("bridge message error: {0}")]
    Json(#[from] serde_json::Error),

    /// A control-bridge frame declared a length beyond the protocol maximum.
    #[error("bridge frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared frame length.
        len: usize,
        /// Protocol maximum.
        max: usize,
    },

    /// Invalid configuration provided.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The last failure observed when connection retries were exhausted.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectFailureReason {
    /// The attempt timed out.
    Timeout,
    /// The peripheral was not found by the link layer.
    PeripheralNotFound,
    /// Transient link-layer failure.
    Transient(String),
}

impl std::fmt::Display for ConnectFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "connection timed out"),
            Self::PeripheralNotFound => write!(f, "peripheral not found"),
            Self::Transient(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a retries-exhausted connection error.
    pub fn connect_failed(
        address: impl Into<String>,
        attempts: u32,
        reason: ConnectFailureReason,
    ) -> Self {
        Self::ConnectFailed {
            address: address.into(),
            attempts,
            reason,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error indicates the peripheral's GATT layout is missing
    /// the heart-rate profile. These failures are reported, not retried.
    #[must_use]
    pub fn is_gatt_layout(&self) -> bool {
        matches!(
            self,
            Self::ServiceNotFound { .. } | Self::CharacteristicNotFound { .. }
        )
    }
}

/// Result type alias using pulselink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
