//! Conditioned-signal value types emitted to downstream consumers.
//!
//! [`ConditionedSample`] is the per-sample output of the signal
//! conditioner. [`MetricFrame`] wraps it together with the active tuning
//! parameters and the normalized `[0, 1]` forms that control-surface
//! mappers (MIDI CC, OSC) consume. The mappers themselves live outside
//! this repository; they only see these values.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lower bound of the documented BPM working range for normalization and
/// the baseline wet/dry mapping.
pub const BPM_FLOOR: f64 = 40.0;

/// Upper bound of the documented BPM working range.
pub const BPM_CEILING: f64 = 180.0;

/// Smoothing factor range accepted by the conditioner.
pub const SMOOTHING_FACTOR_MIN: f64 = 0.1;
/// See [`SMOOTHING_FACTOR_MIN`].
pub const SMOOTHING_FACTOR_MAX: f64 = 10.0;

/// Offset parameters (heart-rate and wet/dry) are bounded to ±100.
pub const OFFSET_MIN: f64 = -100.0;
/// See [`OFFSET_MIN`].
pub const OFFSET_MAX: f64 = 100.0;

/// The wet/dry ratio is always clamped to this range after offset
/// application, regardless of the upstream blend result.
pub const WET_DRY_MIN: f64 = 1.0;
/// See [`WET_DRY_MIN`].
pub const WET_DRY_MAX: f64 = 100.0;

/// Linearly map `value` from `[min, max]` to `[0, 1]`, clamped.
#[must_use]
pub fn normalized(value: f64, min: f64, max: f64) -> f64 {
    ((value - min) / (max - min)).clamp(0.0, 1.0)
}

/// Which source feeds the wet/dry derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WetDrySource {
    /// Use the offset-applied raw BPM.
    Raw,
    /// Use the smoothed BPM (default).
    #[default]
    Smoothed,
}

impl WetDrySource {
    /// Toggle between the two sources.
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::Raw => Self::Smoothed,
            Self::Smoothed => Self::Raw,
        }
    }
}

/// One conditioned sample, as produced by the signal conditioner.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConditionedSample {
    /// Offset-applied raw BPM.
    pub raw_bpm: f64,
    /// Exponentially smoothed BPM.
    pub smoothed_bpm: f64,
    /// Composite wet/dry ratio, always in `[1, 100]`.
    pub wet_dry_ratio: f64,
    /// Which source the wet/dry derivation used for this sample.
    pub source_used: WetDrySource,
}

/// The tuning parameters active when a frame was produced.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TuningParams {
    /// Additive BPM offset, in `[-100, 100]`.
    pub hr_offset: f64,
    /// Smoothing factor, in `[0.1, 10.0]`.
    pub smoothing_factor: f64,
    /// Additive wet/dry offset, in `[-100, 100]`.
    pub wet_dry_offset: f64,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            hr_offset: 0.0,
            smoothing_factor: SMOOTHING_FACTOR_MIN,
            wet_dry_offset: 0.0,
        }
    }
}

/// A complete outbound frame: the conditioned values, the active tuning
/// parameters, and normalized `[0, 1]` forms of each, computed by linear
/// mapping over the documented range of each value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetricFrame {
    /// Offset-applied raw BPM.
    pub raw_bpm: f64,
    /// Smoothed BPM.
    pub smoothed_bpm: f64,
    /// Wet/dry ratio in `[1, 100]`.
    pub wet_dry_ratio: f64,
    /// Raw BPM mapped from `[40, 180]` to `[0, 1]`.
    pub raw_bpm_norm: f64,
    /// Smoothed BPM mapped from `[40, 180]` to `[0, 1]`.
    pub smoothed_bpm_norm: f64,
    /// Wet/dry ratio mapped from `[0, 100]` to `[0, 1]`.
    pub wet_dry_norm: f64,
    /// The tuning parameters active for this frame.
    pub params: TuningParams,
    /// `hr_offset` mapped from `[-100, 100]` to `[0, 1]`.
    pub hr_offset_norm: f64,
    /// `smoothing_factor` mapped from `[0.1, 10.0]` to `[0, 1]`.
    pub smoothing_norm: f64,
    /// `wet_dry_offset` mapped from `[-100, 100]` to `[0, 1]`.
    pub wet_dry_offset_norm: f64,
}

impl MetricFrame {
    /// Build a frame from a conditioned sample and the active parameters.
    #[must_use]
    pub fn new(sample: &ConditionedSample, params: TuningParams) -> Self {
        Self {
            raw_bpm: sample.raw_bpm,
            smoothed_bpm: sample.smoothed_bpm,
            wet_dry_ratio: sample.wet_dry_ratio,
            raw_bpm_norm: normalized(sample.raw_bpm, BPM_FLOOR, BPM_CEILING),
            smoothed_bpm_norm: normalized(sample.smoothed_bpm, BPM_FLOOR, BPM_CEILING),
            wet_dry_norm: normalized(sample.wet_dry_ratio, 0.0, WET_DRY_MAX),
            params,
            hr_offset_norm: normalized(params.hr_offset, OFFSET_MIN, OFFSET_MAX),
            smoothing_norm: normalized(
                params.smoothing_factor,
                SMOOTHING_FACTOR_MIN,
                SMOOTHING_FACTOR_MAX,
            ),
            wet_dry_offset_norm: normalized(params.wet_dry_offset, OFFSET_MIN, OFFSET_MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(raw: f64, smoothed: f64, ratio: f64) -> ConditionedSample {
        ConditionedSample {
            raw_bpm: raw,
            smoothed_bpm: smoothed,
            wet_dry_ratio: ratio,
            source_used: WetDrySource::Smoothed,
        }
    }

    #[test]
    fn normalized_clamps_to_unit_range() {
        assert_eq!(normalized(20.0, 40.0, 180.0), 0.0);
        assert_eq!(normalized(250.0, 40.0, 180.0), 1.0);
        assert!((normalized(110.0, 40.0, 180.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn frame_norms_use_documented_ranges() {
        let frame = MetricFrame::new(&sample(110.0, 110.0, 50.0), TuningParams::default());
        assert!((frame.raw_bpm_norm - 0.5).abs() < 1e-12);
        assert!((frame.smoothed_bpm_norm - 0.5).abs() < 1e-12);
        assert!((frame.wet_dry_norm - 0.5).abs() < 1e-12);
        assert_eq!(frame.hr_offset_norm, 0.5);
        assert_eq!(frame.smoothing_norm, 0.0);
    }

    #[test]
    fn param_norms_cover_full_range() {
        let params = TuningParams {
            hr_offset: 100.0,
            smoothing_factor: 10.0,
            wet_dry_offset: -100.0,
        };
        let frame = MetricFrame::new(&sample(72.0, 72.0, 30.0), params);
        assert_eq!(frame.hr_offset_norm, 1.0);
        assert!((frame.smoothing_norm - 1.0).abs() < 1e-12);
        assert_eq!(frame.wet_dry_offset_norm, 0.0);
    }

    #[test]
    fn source_toggle_round_trips() {
        assert_eq!(WetDrySource::Raw.toggled(), WetDrySource::Smoothed);
        assert_eq!(WetDrySource::Smoothed.toggled(), WetDrySource::Raw);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn frame_serializes_for_external_consumers() {
        let frame = MetricFrame::new(&sample(72.0, 72.5, 48.0), TuningParams::default());
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"wet_dry_ratio\":48.0"));
        assert!(json.contains("\"smoothing_factor\":0.1"));
    }
}
