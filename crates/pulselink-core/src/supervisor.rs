//! Reconnect supervision with synthetic-sample fallback.
//!
//! When the peer drops the link while the hold-lock is enabled, the
//! supervisor keeps downstream consumers fed: a bounded random-walk
//! generator emits one synthetic sample per tick through the same event
//! path as live samples, while a second timer periodically retries the
//! last known address. Both timers are cancellable individually and
//! starting a new run cancels any previous one, so a timer can never
//! fire twice per tick.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pulselink_types::HeartRateSample;

use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};
use crate::session::ConnectionSession;

/// Options for the reconnect supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Interval between synthetic samples.
    pub sim_tick: Duration,
    /// Interval between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Frames over which the owner blends from the last synthetic value
    /// to live values after a reconnect.
    pub blend_frames: u32,
    /// Maximum per-tick random-walk step, in BPM.
    pub max_step_bpm: f64,
    /// Lower bound of the synthetic walk.
    pub sim_floor: f64,
    /// Upper bound of the synthetic walk.
    pub sim_ceiling: f64,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            sim_tick: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(5),
            blend_frames: 10,
            max_step_bpm: 0.6,
            sim_floor: 40.0,
            sim_ceiling: 180.0,
        }
    }
}

impl SupervisorOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the synthetic-sample tick.
    #[must_use]
    pub fn sim_tick(mut self, tick: Duration) -> Self {
        self.sim_tick = tick;
        self
    }

    /// Set the reconnect attempt interval.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the post-reconnect blend window length.
    #[must_use]
    pub fn blend_frames(mut self, frames: u32) -> Self {
        self.blend_frames = frames;
        self
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sim_tick.is_zero() || self.reconnect_interval.is_zero() {
            return Err(Error::invalid_config("supervisor intervals must be > 0"));
        }
        if self.blend_frames == 0 {
            return Err(Error::invalid_config("blend_frames must be >= 1"));
        }
        if self.max_step_bpm <= 0.0 {
            return Err(Error::invalid_config("max_step_bpm must be > 0"));
        }
        if self.sim_floor >= self.sim_ceiling {
            return Err(Error::invalid_config("sim_floor must be < sim_ceiling"));
        }
        Ok(())
    }
}

/// Owns the synthetic generator and reconnect timers after a link loss.
pub struct ReconnectSupervisor {
    options: SupervisorOptions,
    cancel: Option<CancellationToken>,
    last_value: Arc<StdMutex<f64>>,
}

impl std::fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ReconnectSupervisor {
    /// Create a supervisor, validating the options.
    pub fn new(options: SupervisorOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            cancel: None,
            last_value: Arc::new(StdMutex::new(0.0)),
        })
    }

    /// The configured options.
    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Whether a supervised run is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| !token.is_cancelled())
    }

    /// The most recent synthetic value.
    #[must_use]
    pub fn last_value(&self) -> f64 {
        *self.last_value.lock().expect("last_value lock")
    }

    /// Begin supervision: start the synthetic generator seeded from
    /// `seed_bpm`, and, when a session and address are given, schedule
    /// periodic reconnect attempts against them.
    ///
    /// Any previous run is cancelled first.
    pub fn start(
        &mut self,
        seed_bpm: f64,
        events: EventSender,
        reconnect: Option<(Arc<Mutex<ConnectionSession>>, String)>,
    ) {
        self.stop();

        let options = self.options.clone();
        *self.last_value.lock().expect("last_value lock") =
            seed_bpm.clamp(options.sim_floor, options.sim_ceiling);

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());

        info!(seed = seed_bpm, "starting synthetic sample generator");
        let sim_token = token.clone();
        let last_value = Arc::clone(&self.last_value);
        let sim_options = options.clone();
        tokio::spawn(async move {
            let mut tick = interval(sim_options.sim_tick);
            loop {
                tokio::select! {
                    biased;
                    _ = sim_token.cancelled() => break,
                    _ = tick.tick() => {
                        let bpm = {
                            let mut value = last_value.lock().expect("last_value lock");
                            let drift = rand::rng()
                                .random_range(-sim_options.max_step_bpm..=sim_options.max_step_bpm);
                            *value = (*value + drift)
                                .clamp(sim_options.sim_floor, sim_options.sim_ceiling);
                            *value
                        };
                        if events.send(SessionEvent::Sample { sample: synthetic_sample(bpm) }).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        if let Some((session, address)) = reconnect {
            let reconnect_token = token;
            tokio::spawn(async move {
                let mut tick = interval(options.reconnect_interval);
                // interval fires immediately; the first attempt should
                // wait one full period.
                tick.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        _ = reconnect_token.cancelled() => break,
                        _ = tick.tick() => {
                            info!("attempting reconnect to {}", address);
                            let mut session = session.lock().await;
                            match session.connect(&address).await {
                                Ok(()) => {
                                    info!("reconnected after link loss");
                                    break;
                                }
                                Err(e) => warn!("reconnect attempt failed: {}", e),
                            }
                        }
                    }
                }
            });
        }
    }

    /// Cancel both timers and return the last synthetic value, for the
    /// owner's blend window.
    pub fn stop(&mut self) -> f64 {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.last_value()
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

fn synthetic_sample(bpm: f64) -> HeartRateSample {
    HeartRateSample {
        bpm: bpm.round() as u16,
        rr_intervals: Vec::new(),
        raw_bytes: Vec::new(),
        captured_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;

    #[test]
    fn options_validation() {
        assert!(SupervisorOptions::new().validate().is_ok());
        assert!(SupervisorOptions::new().blend_frames(0).validate().is_err());
        assert!(
            SupervisorOptions::new()
                .sim_tick(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn generator_emits_bounded_samples() {
        let mut supervisor = ReconnectSupervisor::new(SupervisorOptions::default()).unwrap();
        let (tx, mut rx) = event_channel();

        supervisor.start(178.0, tx, None);
        assert!(supervisor.is_running());

        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        supervisor.stop();

        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            let SessionEvent::Sample { sample } = event else {
                panic!("generator emits only samples");
            };
            assert!((40..=180).contains(&sample.bpm), "bpm {} out of walk bounds", sample.bpm);
            assert!(sample.rr_intervals.is_empty());
            count += 1;
        }
        assert!(count >= 20, "one sample per tick, got {count}");
    }

    #[tokio::test(start_paused = true)]
    async fn seed_is_clamped_to_walk_bounds() {
        let mut supervisor = ReconnectSupervisor::new(SupervisorOptions::default()).unwrap();
        let (tx, _rx) = event_channel();
        supervisor.start(300.0, tx, None);
        assert!(supervisor.last_value() <= 180.0);
        supervisor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_generation() {
        let mut supervisor = ReconnectSupervisor::new(SupervisorOptions::default()).unwrap();
        let (tx, mut rx) = event_channel();

        supervisor.start(80.0, tx, None);
        tokio::time::advance(Duration::from_secs(3)).await;
        let last = supervisor.stop();
        assert!(!supervisor.is_running());
        assert!((40.0..=180.0).contains(&last));

        while rx.try_recv().is_ok() {}
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "no samples after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_run() {
        let mut supervisor = ReconnectSupervisor::new(SupervisorOptions::default()).unwrap();
        let (tx, mut rx) = event_channel();

        supervisor.start(60.0, tx.clone(), None);
        supervisor.start(120.0, tx, None);
        assert!(supervisor.is_running());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        // Only the second generator is live; every sample walks near the
        // second seed, far from the first.
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Sample { sample } = event {
                assert!(sample.bpm > 100, "sample {} from a cancelled generator", sample.bpm);
            }
        }
        supervisor.stop();
    }
}
