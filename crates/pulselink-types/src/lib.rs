//! Platform-agnostic types for heart-rate telemetry.
//!
//! This crate provides the shared value types used by the session and
//! signal-conditioning pipeline in `pulselink-core`:
//!
//! - [`HeartRateSample`] and its binary decoder for the standard BLE
//!   Heart Rate Measurement payload
//! - [`ConditionedSample`] and [`MetricFrame`], the values emitted to
//!   downstream automation consumers
//! - UUID constants for the Heart Rate GATT service
//! - [`DecodeError`] for payload parsing failures
//!
//! Nothing in this crate touches a radio or an async runtime; everything
//! here is pure data and can be exercised directly in tests.

pub mod error;
pub mod measurement;
pub mod signal;
pub mod uuid;

pub use error::{DecodeError, DecodeResult};
pub use measurement::{HeartRateSample, PHYSIOLOGICAL_MAX_BPM, PHYSIOLOGICAL_MIN_BPM};
pub use signal::{ConditionedSample, MetricFrame, TuningParams, WetDrySource};
pub use uuid as uuids;
