//! Cross-context event delivery for the session pipeline.
//!
//! Everything the background context produces (scan hits, state changes,
//! decoded samples, disconnect notices) flows through one typed channel to
//! exactly one consumer: the session owner. The channel gives three
//! guarantees the pipeline relies on:
//!
//! - **Ordering**: events are delivered in emission order.
//! - **Serialization**: there is a single receiver, so the consumer never
//!   observes two events concurrently; each is handled to completion
//!   before the next is read.
//! - **Non-blocking producers**: the channel is unbounded and sends after
//!   the receiver is torn down are silently dropped (the session is
//!   assumed to be shutting down).
//!
//! The single-consumer invariant is structural: [`event_channel`] hands
//! out one [`EventReceiver`] and `tokio::sync::mpsc` receivers cannot be
//! cloned.

use tokio::sync::mpsc;

use pulselink_types::HeartRateSample;

use crate::session::SessionState;

/// Events produced by the background context for the session owner.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SessionEvent {
    /// A heart-rate-capable sensor was discovered.
    SensorFound {
        /// Connection identifier (peripheral ID or MAC address).
        id: String,
        /// Advertised name, if any.
        name: Option<String>,
        /// RSSI signal strength, if reported.
        rssi: Option<i16>,
    },
    /// The connection session moved to a new state.
    StateChanged {
        /// The state entered.
        state: SessionState,
    },
    /// A decoded, gate-passing sample arrived.
    Sample {
        /// The sample.
        sample: HeartRateSample,
    },
    /// A notification was dropped before reaching the pipeline.
    ///
    /// Decode failures and physiological-range rejects never abort the
    /// session; they surface here once per dropped sample.
    SampleDropped {
        /// Human-readable reason.
        reason: String,
    },
    /// The peer closed the link without a local disconnect request.
    UnexpectedDisconnect {
        /// Human-readable reason.
        reason: String,
    },
}

/// Sender half of the event channel. Cloneable; used by the link layer,
/// the reconnect supervisor, and the control bridge.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Receiver half of the event channel. Exactly one exists per pipeline.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create the pipeline event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
