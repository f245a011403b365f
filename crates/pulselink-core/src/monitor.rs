//! The session owner: one consumer for the whole pipeline.
//!
//! [`HeartRateMonitor`] owns the event receiver, the signal conditioner,
//! the heart-rate offset, the hold-lock flag, and the post-reconnect
//! blend window. Every event — live sample, synthetic sample, state
//! change, disconnect notice — is handled to completion on this one
//! consumer before the next is read, so no conditioner state is ever
//! touched from two contexts.
//!
//! Conditioned output leaves through a single frame channel obtained once
//! via [`HeartRateMonitor::take_frames`].

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulselink_types::{
    HeartRateSample, MetricFrame, PHYSIOLOGICAL_MAX_BPM, PHYSIOLOGICAL_MIN_BPM, TuningParams,
    signal::{OFFSET_MAX, OFFSET_MIN},
};

use crate::conditioner::{ConditionerOptions, SignalConditioner};
use crate::error::{Error, Result};
use crate::events::{EventReceiver, EventSender, SessionEvent, event_channel};
use crate::link::SensorLink;
use crate::scan::{DiscoveredSensor, ScanOptions, Scanner};
use crate::session::{ConnectionSession, SessionConfig, SessionState};
use crate::supervisor::{ReconnectSupervisor, SupervisorOptions};

/// Seed used for the synthetic generator when no sample was ever accepted.
const DEFAULT_SEED_BPM: f64 = 70.0;

/// Options for the monitor and its owned components.
#[derive(Debug, Clone, Default)]
pub struct MonitorOptions {
    /// Connection behavior.
    pub session: SessionConfig,
    /// Signal conditioning parameters.
    pub conditioner: ConditionerOptions,
    /// Reconnect/simulation behavior.
    pub supervisor: SupervisorOptions,
    /// Additive BPM offset applied before conditioning, in `[-100, 100]`.
    pub hr_offset: f64,
    /// When enabled, an unexpected link loss starts the synthetic
    /// fallback and periodic reconnection instead of going quiet.
    pub hold_lock: bool,
}

impl MonitorOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heart-rate offset.
    #[must_use]
    pub fn hr_offset(mut self, offset: f64) -> Self {
        self.hr_offset = offset;
        self
    }

    /// Enable or disable the hold-lock.
    #[must_use]
    pub fn hold_lock(mut self, on: bool) -> Self {
        self.hold_lock = on;
        self
    }

    /// Set the conditioner options.
    #[must_use]
    pub fn conditioner(mut self, options: ConditionerOptions) -> Self {
        self.conditioner = options;
        self
    }

    /// Set the session config.
    #[must_use]
    pub fn session(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Set the supervisor options.
    #[must_use]
    pub fn supervisor(mut self, options: SupervisorOptions) -> Self {
        self.supervisor = options;
        self
    }

    /// Validate the monitor-owned parameters.
    pub fn validate(&self) -> Result<()> {
        if !(OFFSET_MIN..=OFFSET_MAX).contains(&self.hr_offset) {
            return Err(Error::invalid_config(format!(
                "hr_offset must be in [{}, {}]",
                OFFSET_MIN, OFFSET_MAX
            )));
        }
        Ok(())
    }
}

/// Post-reconnect blend from the last synthetic value to live values.
#[derive(Debug)]
struct BlendWindow {
    from: f64,
    remaining: u32,
    total: u32,
}

/// The single consumer of the pipeline's event stream.
pub struct HeartRateMonitor {
    session: Option<Arc<Mutex<ConnectionSession>>>,
    events: EventReceiver,
    sender: EventSender,
    conditioner: SignalConditioner,
    supervisor: ReconnectSupervisor,
    hr_offset: f64,
    hold_lock: bool,
    blend: Option<BlendWindow>,
    frames_tx: mpsc::UnboundedSender<MetricFrame>,
    frames_rx: Option<mpsc::UnboundedReceiver<MetricFrame>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for HeartRateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartRateMonitor")
            .field("hold_lock", &self.hold_lock)
            .field("hr_offset", &self.hr_offset)
            .field("detached", &self.session.is_none())
            .finish_non_exhaustive()
    }
}

impl HeartRateMonitor {
    /// Create a monitor over a sensor link.
    pub fn new(link: Box<dyn SensorLink>, options: MonitorOptions) -> Result<Self> {
        options.validate()?;
        let (sender, events) = event_channel();
        let session = ConnectionSession::new(link, options.session.clone(), sender.clone())?;
        Self::build(Some(Arc::new(Mutex::new(session))), sender, events, options)
    }

    /// Create a monitor with no radio session, for alternate ingestion
    /// paths such as the control bridge. The hold-lock fallback still
    /// runs the synthetic generator on link loss, but reconnection is
    /// left to the transport on the far side of the bridge.
    pub fn detached(options: MonitorOptions) -> Result<Self> {
        options.validate()?;
        let (sender, events) = event_channel();
        Self::build(None, sender, events, options)
    }

    fn build(
        session: Option<Arc<Mutex<ConnectionSession>>>,
        sender: EventSender,
        events: EventReceiver,
        options: MonitorOptions,
    ) -> Result<Self> {
        let conditioner = SignalConditioner::new(options.conditioner)?;
        let supervisor = ReconnectSupervisor::new(options.supervisor)?;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Ok(Self {
            session,
            events,
            sender,
            conditioner,
            supervisor,
            hr_offset: options.hr_offset,
            hold_lock: options.hold_lock,
            blend: None,
            frames_tx,
            frames_rx: Some(frames_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// The shared session handle, for issuing connect/disconnect, or
    /// `None` for a detached monitor.
    pub fn session(&self) -> Option<Arc<Mutex<ConnectionSession>>> {
        self.session.clone()
    }

    /// A sender into the pipeline's event channel, for alternate
    /// ingestion paths (control bridge) and tests.
    pub fn event_sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Take the frame receiver. There is exactly one; subsequent calls
    /// return `None`.
    pub fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<MetricFrame>> {
        self.frames_rx.take()
    }

    /// A token that stops [`run`](Self::run) when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Set the heart-rate offset, clamped to ±100.
    pub fn set_hr_offset(&mut self, offset: f64) {
        self.hr_offset = offset.clamp(OFFSET_MIN, OFFSET_MAX);
    }

    /// The current heart-rate offset.
    #[must_use]
    pub fn hr_offset(&self) -> f64 {
        self.hr_offset
    }

    /// Enable or disable the hold-lock. Disabling stops any running
    /// synthetic fallback immediately.
    pub fn set_hold_lock(&mut self, on: bool) {
        self.hold_lock = on;
        if !on && self.supervisor.is_running() {
            info!("hold-lock disabled, stopping synthetic fallback");
            self.supervisor.stop();
        }
    }

    /// The signal conditioner, for reading derived metrics.
    pub fn conditioner(&self) -> &SignalConditioner {
        &self.conditioner
    }

    /// Mutable access to the conditioner, for live parameter changes
    /// before [`run`](Self::run) takes ownership.
    pub fn conditioner_mut(&mut self) -> &mut SignalConditioner {
        &mut self.conditioner
    }

    /// Run a discovery pass on behalf of this monitor's session,
    /// surfacing each hit as a [`SessionEvent::SensorFound`].
    pub async fn scan(
        &self,
        scanner: &Scanner,
        options: ScanOptions,
    ) -> Result<Vec<DiscoveredSensor>> {
        if let Some(session) = &self.session {
            session.lock().await.mark_scanning();
        }
        let result = scanner.scan(options).await;
        if let Some(session) = &self.session {
            session.lock().await.mark_idle();
        }

        let sensors = result?;
        for sensor in &sensors {
            let _ = self.sender.send(SessionEvent::SensorFound {
                id: sensor.identifier.clone(),
                name: sensor.name.clone(),
                rssi: sensor.rssi,
            });
        }
        Ok(sensors)
    }

    /// Consume the monitor and process events until the cancellation
    /// token fires.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.supervisor.stop();
                    debug!("monitor cancelled");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Sample { sample } => self.on_sample(&sample),
            SessionEvent::StateChanged { state } => {
                debug!(%state, "session state");
                if state == SessionState::Connected && self.supervisor.is_running() {
                    let from = self.supervisor.stop();
                    let total = self.supervisor.options().blend_frames;
                    self.blend = Some(BlendWindow {
                        from,
                        remaining: total,
                        total,
                    });
                    info!("live samples resumed, blending over {} frames", total);
                }
            }
            SessionEvent::UnexpectedDisconnect { reason } => {
                warn!("unexpected disconnect: {}", reason);
                let mut reconnect = None;
                if let Some(session) = &self.session {
                    let mut guard = session.lock().await;
                    guard.acknowledge_link_loss();
                    if let Some(address) = guard.last_address() {
                        reconnect = Some((Arc::clone(session), address.to_string()));
                    }
                }
                if self.hold_lock {
                    let seed = self
                        .conditioner
                        .last_smoothed()
                        .or_else(|| self.conditioner.last_raw())
                        .unwrap_or(DEFAULT_SEED_BPM);
                    self.supervisor.start(seed, self.sender.clone(), reconnect);
                }
            }
            SessionEvent::SensorFound { id, name, rssi } => {
                debug!(?name, %id, ?rssi, "sensor found");
            }
            SessionEvent::SampleDropped { reason } => {
                debug!("sample dropped: {}", reason);
            }
        }
    }

    fn on_sample(&mut self, sample: &HeartRateSample) {
        let incoming = f64::from(sample.bpm) + self.hr_offset;

        let mut value = incoming;
        if let Some(window) = self.blend.as_mut() {
            let weight = f64::from(window.remaining) / f64::from(window.total);
            window.remaining -= 1;
            value = (weight * window.from + (1.0 - weight) * incoming).clamp(
                f64::from(PHYSIOLOGICAL_MIN_BPM),
                f64::from(PHYSIOLOGICAL_MAX_BPM),
            );
        }
        if matches!(self.blend, Some(BlendWindow { remaining: 0, .. })) {
            self.blend = None;
        }

        let conditioned = self.conditioner.accept(value, &sample.rr_intervals);
        let params = TuningParams {
            hr_offset: self.hr_offset,
            smoothing_factor: self.conditioner.smoothing_factor(),
            wet_dry_offset: self.conditioner.wet_dry_offset(),
        };
        let _ = self.frames_tx.send(MetricFrame::new(&conditioned, params));
    }
}
