//! Signal conditioning: smoothing and the composite wet/dry metric.
//!
//! The conditioner turns a stream of (offset-applied) BPM values into a
//! bounded control signal. Smoothing is a plain EMA with
//! `alpha = 1 / (1 + smoothing_factor)`, seeded from the first accepted
//! value so the signal never ramps up from zero on a cold start.
//!
//! The wet/dry ratio is a composite:
//!
//! 1. Baseline: the selected source (raw or smoothed) mapped linearly
//!    from 40-180 BPM to 10-90, clamped before scaling.
//! 2. If at least two RR intervals arrived with the sample, blend in an
//!    HRV component (60/40) derived from their standard deviation.
//! 3. Otherwise, with enough recent history, blend in a short-term
//!    variability component (70/30) from the last ten source values.
//! 4. Apply the wet/dry offset and clamp to [1, 100]. Always.

use std::collections::VecDeque;
use std::time::Duration;

use pulselink_types::signal::{
    BPM_CEILING, BPM_FLOOR, ConditionedSample, OFFSET_MAX, OFFSET_MIN, SMOOTHING_FACTOR_MAX,
    SMOOTHING_FACTOR_MIN, WET_DRY_MAX, WET_DRY_MIN, WetDrySource,
};

use crate::error::{Error, Result};

/// Baseline band the BPM working range maps onto.
const BASELINE_MIN: f64 = 10.0;
const BASELINE_SPAN: f64 = 80.0;

/// RR standard deviation (seconds) mapping into the HRV component:
/// `min(100, std / 120 * 100)`.
const HRV_STD_SCALE: f64 = 120.0;

/// Source-history standard deviation (BPM) saturating the variability
/// component; ~5 BPM of micro fluctuation maps to full scale.
const VARIABILITY_STD_SCALE: f64 = 5.0;

/// Samples needed before the variability fallback engages.
const VARIABILITY_MIN_HISTORY: usize = 5;

/// Window of recent source samples the variability fallback inspects.
const VARIABILITY_WINDOW: usize = 10;

/// Options for the signal conditioner.
#[derive(Debug, Clone)]
pub struct ConditionerOptions {
    /// Smoothing factor, in `[0.1, 10.0]`. Higher is smoother.
    pub smoothing_factor: f64,
    /// Additive wet/dry offset, in `[-100, 100]`.
    pub wet_dry_offset: f64,
    /// Which source feeds the wet/dry derivation.
    pub source: WetDrySource,
    /// Nominal interval between samples, used only to express the EMA
    /// half-life in seconds for observability.
    pub sample_period: Duration,
    /// How many recent samples to retain per source.
    pub history_capacity: usize,
}

impl Default for ConditionerOptions {
    fn default() -> Self {
        Self {
            smoothing_factor: SMOOTHING_FACTOR_MIN,
            wet_dry_offset: 0.0,
            source: WetDrySource::Smoothed,
            sample_period: Duration::from_secs(1),
            history_capacity: 300,
        }
    }
}

impl ConditionerOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the smoothing factor.
    #[must_use]
    pub fn smoothing_factor(mut self, factor: f64) -> Self {
        self.smoothing_factor = factor;
        self
    }

    /// Set the wet/dry offset.
    #[must_use]
    pub fn wet_dry_offset(mut self, offset: f64) -> Self {
        self.wet_dry_offset = offset;
        self
    }

    /// Set the wet/dry source.
    #[must_use]
    pub fn source(mut self, source: WetDrySource) -> Self {
        self.source = source;
        self
    }

    /// Set the nominal sample period.
    #[must_use]
    pub fn sample_period(mut self, period: Duration) -> Self {
        self.sample_period = period;
        self
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if !(SMOOTHING_FACTOR_MIN..=SMOOTHING_FACTOR_MAX).contains(&self.smoothing_factor) {
            return Err(Error::invalid_config(format!(
                "smoothing_factor must be in [{}, {}]",
                SMOOTHING_FACTOR_MIN, SMOOTHING_FACTOR_MAX
            )));
        }
        if !(OFFSET_MIN..=OFFSET_MAX).contains(&self.wet_dry_offset) {
            return Err(Error::invalid_config(format!(
                "wet_dry_offset must be in [{}, {}]",
                OFFSET_MIN, OFFSET_MAX
            )));
        }
        if self.history_capacity < VARIABILITY_WINDOW {
            return Err(Error::invalid_config(format!(
                "history_capacity must be >= {}",
                VARIABILITY_WINDOW
            )));
        }
        Ok(())
    }
}

/// EMA half-life in samples for a given alpha: `ln 0.5 / ln(1 - alpha)`.
///
/// An alpha of 1 (no smoothing at all) has no meaningful half-life; it is
/// reported as zero rather than dividing by zero.
#[must_use]
pub fn half_life_samples(alpha: f64) -> f64 {
    if alpha >= 1.0 {
        return 0.0;
    }
    (0.5f64).ln() / (1.0 - alpha).ln()
}

/// Stateful conditioner over one sample stream.
///
/// Owned exclusively by the session owner; mutated once per accepted
/// sample and never shared across contexts.
#[derive(Debug)]
pub struct SignalConditioner {
    options: ConditionerOptions,
    ema: Option<f64>,
    raw_history: VecDeque<f64>,
    smoothed_history: VecDeque<f64>,
}

impl SignalConditioner {
    /// Create a conditioner, validating the options.
    pub fn new(options: ConditionerOptions) -> Result<Self> {
        options.validate()?;
        let capacity = options.history_capacity;
        Ok(Self {
            options,
            ema: None,
            raw_history: VecDeque::with_capacity(capacity),
            smoothed_history: VecDeque::with_capacity(capacity),
        })
    }

    /// Accept one offset-applied BPM value and its RR intervals, and
    /// produce the conditioned sample.
    pub fn accept(&mut self, raw_bpm: f64, rr_intervals: &[f64]) -> ConditionedSample {
        let alpha = self.alpha();
        let smoothed = match self.ema {
            None => raw_bpm,
            Some(prev) => alpha * raw_bpm + (1.0 - alpha) * prev,
        };
        self.ema = Some(smoothed);

        push_bounded(&mut self.raw_history, raw_bpm, self.options.history_capacity);
        push_bounded(
            &mut self.smoothed_history,
            smoothed,
            self.options.history_capacity,
        );

        let source_value = match self.options.source {
            WetDrySource::Raw => raw_bpm,
            WetDrySource::Smoothed => smoothed,
        };

        let baseline = ((source_value - BPM_FLOOR) / (BPM_CEILING - BPM_FLOOR)).clamp(0.0, 1.0);
        let baseline_scaled = BASELINE_MIN + baseline * BASELINE_SPAN;

        let combined = if rr_intervals.len() >= 2 {
            let (_, std) = mean_std(rr_intervals);
            let hrv_component = (std / HRV_STD_SCALE * 100.0).min(100.0);
            0.6 * baseline_scaled + 0.4 * hrv_component
        } else {
            let history = match self.options.source {
                WetDrySource::Raw => &self.raw_history,
                WetDrySource::Smoothed => &self.smoothed_history,
            };
            if history.len() >= VARIABILITY_MIN_HISTORY {
                let start = history.len().saturating_sub(VARIABILITY_WINDOW);
                let recent: Vec<f64> = history.iter().skip(start).copied().collect();
                let (_, std) = mean_std(&recent);
                let variability = (std / VARIABILITY_STD_SCALE).clamp(0.0, 1.0);
                0.7 * baseline_scaled + 0.3 * (variability * 100.0)
            } else {
                baseline_scaled
            }
        };

        let wet_dry_ratio =
            (combined + self.options.wet_dry_offset).clamp(WET_DRY_MIN, WET_DRY_MAX);

        ConditionedSample {
            raw_bpm,
            smoothed_bpm: smoothed,
            wet_dry_ratio,
            source_used: self.options.source,
        }
    }

    /// The EMA coefficient: `1 / (1 + smoothing_factor)`.
    #[must_use]
    pub fn alpha(&self) -> f64 {
        1.0 / (1.0 + self.options.smoothing_factor)
    }

    /// EMA half-life in samples for the current smoothing factor.
    #[must_use]
    pub fn half_life_samples(&self) -> f64 {
        half_life_samples(self.alpha())
    }

    /// EMA half-life in wall time, using the nominal sample period.
    #[must_use]
    pub fn half_life(&self) -> Duration {
        Duration::from_secs_f64(self.half_life_samples() * self.options.sample_period.as_secs_f64())
    }

    /// The current smoothing factor.
    #[must_use]
    pub fn smoothing_factor(&self) -> f64 {
        self.options.smoothing_factor
    }

    /// Set the smoothing factor, clamped to its valid range.
    pub fn set_smoothing_factor(&mut self, factor: f64) {
        self.options.smoothing_factor =
            factor.clamp(SMOOTHING_FACTOR_MIN, SMOOTHING_FACTOR_MAX);
    }

    /// The current wet/dry offset.
    #[must_use]
    pub fn wet_dry_offset(&self) -> f64 {
        self.options.wet_dry_offset
    }

    /// Set the wet/dry offset, clamped to ±100.
    pub fn set_wet_dry_offset(&mut self, offset: f64) {
        self.options.wet_dry_offset = offset.clamp(OFFSET_MIN, OFFSET_MAX);
    }

    /// The current wet/dry source.
    #[must_use]
    pub fn source(&self) -> WetDrySource {
        self.options.source
    }

    /// Select the wet/dry source.
    pub fn set_source(&mut self, source: WetDrySource) {
        self.options.source = source;
    }

    /// The most recent smoothed value, if any sample was accepted.
    #[must_use]
    pub fn last_smoothed(&self) -> Option<f64> {
        self.ema
    }

    /// The most recent raw value, if any sample was accepted.
    #[must_use]
    pub fn last_raw(&self) -> Option<f64> {
        self.raw_history.back().copied()
    }

    /// Clear the EMA seed and all history.
    pub fn reset(&mut self) {
        self.ema = None;
        self.raw_history.clear();
        self.smoothed_history.clear();
    }
}

fn push_bounded(history: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if history.len() == capacity {
        history.pop_front();
    }
    history.push_back(value);
}

/// Mean and population standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
