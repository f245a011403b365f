//! Sensor connection session and its state machine.
//!
//! [`ConnectionSession`] owns one physical link at a time and drives it
//! through an explicit state machine:
//!
//! ```text
//! Idle -> Connecting(1) -> ... -> Connecting(n) -> Connected
//!                 |                     |
//!                 |                     +-> Failed(reason) -> Idle
//!                 +-> (fatal GATT error) -> Failed(reason) -> Idle
//! Connected -> Disconnecting -> Idle
//! ```
//!
//! Transitions are serialized by construction: every mutating method takes
//! `&mut self`, so a disconnect can never start while a connect attempt is
//! mid-flight, and no two transitions are ever in flight concurrently.
//!
//! Each inbound notification payload is decoded and passed through the
//! physiological acceptance gate before it is forwarded; rejects surface
//! as per-sample diagnostic events, never as session failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use pulselink_types::HeartRateSample;

use crate::error::{ConnectFailureReason, Error, Result};
use crate::events::{EventSender, SessionEvent};
use crate::link::{PayloadHandler, SensorLink};

/// The session state. Owned exclusively by [`ConnectionSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No link, no activity.
    Idle,
    /// Discovery is running on behalf of this session.
    Scanning,
    /// Connect attempt `n` of the configured maximum is in flight.
    Connecting(u32),
    /// Link open, notifications streaming.
    Connected,
    /// Teardown in progress.
    Disconnecting,
    /// Retries exhausted or a fatal GATT-layout error; carries the reason.
    /// The session resets to [`SessionState::Idle`] immediately after.
    Failed(String),
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting(attempt) => write!(f, "connecting (attempt {})", attempt),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Configuration for connection behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout applied to each connect attempt.
    pub connect_timeout: Duration,
    /// Maximum connect attempts per [`ConnectionSession::connect`] call.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum number of connect attempts.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the fixed delay between attempts.
    #[must_use]
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Validate the config and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::invalid_config("max_retries must be >= 1"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Owns one physical sensor link and the session state machine.
///
/// The session is reusable: after a failure or disconnect it returns to
/// [`SessionState::Idle`] and [`connect`](Self::connect) may be called
/// again.
pub struct ConnectionSession {
    link: Box<dyn SensorLink>,
    config: SessionConfig,
    state: SessionState,
    last_address: Option<String>,
    events: EventSender,
    /// Set while teardown is locally requested, so the link-lost handler
    /// does not report an expected disconnect as unexpected.
    expected_teardown: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("state", &self.state)
            .field("last_address", &self.last_address)
            .finish_non_exhaustive()
    }
}

impl ConnectionSession {
    /// Create a session over a link, validating the config.
    ///
    /// Installs the link-lost handler: a peer-initiated disconnect emits
    /// [`SessionEvent::UnexpectedDisconnect`], distinct from locally
    /// requested teardown.
    pub fn new(
        mut link: Box<dyn SensorLink>,
        config: SessionConfig,
        events: EventSender,
    ) -> Result<Self> {
        config.validate()?;

        let expected_teardown = Arc::new(AtomicBool::new(false));
        {
            let events = events.clone();
            let expected = Arc::clone(&expected_teardown);
            link.set_link_lost_handler(Box::new(move || {
                if !expected.load(Ordering::SeqCst) {
                    let _ = events.send(SessionEvent::UnexpectedDisconnect {
                        reason: "peer closed the link".to_string(),
                    });
                }
            }));
        }

        Ok(Self {
            link,
            config,
            state: SessionState::Idle,
            last_address: None,
            events,
            expected_teardown,
        })
    }

    /// The current session state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The address of the last successfully connected sensor.
    pub fn last_address(&self) -> Option<&str> {
        self.last_address.as_deref()
    }

    /// Connect to the sensor at `address` with bounded retries.
    ///
    /// Each attempt discards any stale link handle, opens a fresh one with
    /// the configured timeout, verifies it, resolves the heart-rate
    /// service and measurement characteristic, and subscribes to
    /// notifications. Only then does the session report `Connected` and
    /// record `address` for reconnection.
    ///
    /// # Errors
    ///
    /// GATT-layout errors (service or characteristic absent) are fatal and
    /// returned without retrying. Transient failures are retried up to
    /// `max_retries` with a fixed backoff; exhaustion returns
    /// [`Error::ConnectFailed`] carrying the last failure. Either way the
    /// session passes through `Failed(reason)` and resets to `Idle`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn connect(&mut self, address: &str) -> Result<()> {
        // A new connect always tears down whatever link came before it.
        if matches!(self.state, SessionState::Connected) {
            self.disconnect().await;
        }

        let mut last_error: Option<Error> = None;

        for attempt in 1..=self.config.max_retries {
            self.set_state(SessionState::Connecting(attempt));

            // Discard any stale link handle from a previous attempt.
            if let Err(e) = self.link.close().await {
                debug!("stale link teardown failed: {}", e);
            }

            match self.try_attempt(address).await {
                Ok(()) => {
                    self.last_address = Some(address.to_string());
                    self.set_state(SessionState::Connected);
                    info!("connected, streaming heart-rate notifications");
                    return Ok(());
                }
                Err(e) if e.is_gatt_layout() => {
                    // Retrying will not change peripheral capabilities.
                    warn!("fatal connect error: {}", e);
                    self.fail(e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "connect attempt {}/{} failed: {}",
                        attempt, self.config.max_retries, e
                    );
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }

        let reason = match &last_error {
            Some(Error::Timeout { .. }) => ConnectFailureReason::Timeout,
            Some(Error::SensorNotFound { .. }) => ConnectFailureReason::PeripheralNotFound,
            Some(e) => ConnectFailureReason::Transient(e.to_string()),
            None => ConnectFailureReason::Transient("no attempts made".to_string()),
        };
        let error = Error::connect_failed(address, self.config.max_retries, reason);
        self.fail(error.to_string());
        Err(error)
    }

    async fn try_attempt(&mut self, address: &str) -> Result<()> {
        self.link
            .open(address, self.config.connect_timeout)
            .await?;
        if !self.link.is_open().await {
            return Err(Error::NotConnected);
        }
        self.link
            .subscribe(payload_handler(self.events.clone()))
            .await
    }

    /// Disconnect from the sensor.
    ///
    /// Unsubscribe and link teardown are both best-effort: failures are
    /// logged but never prevent the state reset to `Idle`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(&mut self) {
        self.expected_teardown.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Disconnecting);

        if let Err(e) = self.link.unsubscribe().await {
            warn!("unsubscribe failed: {}", e);
        }
        if let Err(e) = self.link.close().await {
            warn!("link teardown failed: {}", e);
        }

        self.set_state(SessionState::Idle);
        self.expected_teardown.store(false, Ordering::SeqCst);
    }

    /// Record a peer-initiated link loss reported by the event stream.
    ///
    /// Called by the session owner after it receives
    /// [`SessionEvent::UnexpectedDisconnect`], so that the state
    /// transition happens in the consumer context like every other one.
    pub fn acknowledge_link_loss(&mut self) {
        if self.state == SessionState::Connected {
            self.set_state(SessionState::Disconnecting);
            self.set_state(SessionState::Idle);
        }
    }

    /// Mark the session as scanning on behalf of a discovery pass.
    pub fn mark_scanning(&mut self) {
        if self.state == SessionState::Idle {
            self.set_state(SessionState::Scanning);
        }
    }

    /// Return from [`SessionState::Scanning`] to idle.
    pub fn mark_idle(&mut self) {
        if self.state == SessionState::Scanning {
            self.set_state(SessionState::Idle);
        }
    }

    fn fail(&mut self, reason: String) {
        self.set_state(SessionState::Failed(reason));
        self.set_state(SessionState::Idle);
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(from = %self.state, to = %state, "session state change");
        self.state = state.clone();
        let _ = self.events.send(SessionEvent::StateChanged { state });
    }
}

/// Build the notification handler: decode, gate, forward.
fn payload_handler(events: EventSender) -> PayloadHandler {
    Box::new(move |payload| match HeartRateSample::from_bytes(&payload) {
        Ok(sample) if sample.in_physiological_range() => {
            let _ = events.send(SessionEvent::Sample { sample });
        }
        Ok(sample) => {
            warn!("dropping sample outside physiological range: {} BPM", sample.bpm);
            let _ = events.send(SessionEvent::SampleDropped {
                reason: Error::OutOfPhysiologicalRange { bpm: sample.bpm }.to_string(),
            });
        }
        Err(e) => {
            warn!("dropping undecodable notification: {}", e);
            let _ = events.send(SessionEvent::SampleDropped {
                reason: e.to_string(),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::mock::MockLink;

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.retry_backoff, Duration::from_secs(1));
    }

    #[test]
    fn config_rejects_zero_retries() {
        assert!(SessionConfig::new().max_retries(0).validate().is_err());
    }

    #[test]
    fn state_display() {
        assert_eq!(SessionState::Connecting(2).to_string(), "connecting (attempt 2)");
        assert_eq!(
            SessionState::Failed("out of range".into()).to_string(),
            "failed: out of range"
        );
    }

    #[tokio::test]
    async fn new_session_starts_idle() {
        let (link, _ctl) = MockLink::new();
        let (tx, _rx) = event_channel();
        let session =
            ConnectionSession::new(Box::new(link), SessionConfig::default(), tx).unwrap();
        assert_eq!(*session.state(), SessionState::Idle);
        assert!(session.last_address().is_none());
    }

    #[tokio::test]
    async fn scanning_marks_round_trip() {
        let (link, _ctl) = MockLink::new();
        let (tx, _rx) = event_channel();
        let mut session =
            ConnectionSession::new(Box::new(link), SessionConfig::default(), tx).unwrap();
        session.mark_scanning();
        assert_eq!(*session.state(), SessionState::Scanning);
        session.mark_idle();
        assert_eq!(*session.state(), SessionState::Idle);
    }
}
