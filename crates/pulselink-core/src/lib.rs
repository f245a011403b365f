//! Sensor-session and signal-conditioning pipeline for BLE heart-rate
//! telemetry.
//!
//! This crate ingests live samples from a wireless low-energy heart-rate
//! sensor, keeps the session alive across a flaky radio link, and turns
//! raw BPM values into a smoothed, bounded control signal for downstream
//! automation (audio/MIDI/OSC parameter mapping, visualization).
//!
//! # Pipeline
//!
//! ```text
//! Scanner --> ConnectionSession --> decode + gate --> event channel
//!                                                        |
//!                  ReconnectSupervisor (on loss) ---------+
//!                                                        v
//!                                           HeartRateMonitor
//!                                                        |
//!                                  SignalConditioner -> MetricFrame
//! ```
//!
//! - [`scan::Scanner`] discovers heart-rate-capable peripherals.
//! - [`session::ConnectionSession`] owns one link at a time: bounded
//!   connect retries, notification subscription, disconnect detection.
//! - [`events`] delivers everything to exactly one consumer, in order.
//! - [`conditioner::SignalConditioner`] smooths and derives the
//!   composite wet/dry metric.
//! - [`supervisor::ReconnectSupervisor`] keeps consumers fed with
//!   synthetic samples after an unexpected link loss while it retries
//!   the last known address.
//! - [`bridge`] is an equivalent ingestion path over a local socket for
//!   hosts that keep radio access in a helper process.
//!
//! # Quick start
//!
//! ```no_run
//! use pulselink_core::{BleLink, HeartRateMonitor, MonitorOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = BleLink::new().await?;
//!     let mut monitor = HeartRateMonitor::new(Box::new(link), MonitorOptions::new())?;
//!     let mut frames = monitor.take_frames().expect("first take");
//!     let session = monitor.session().expect("radio-backed monitor");
//!
//!     tokio::spawn(monitor.run());
//!     session.lock().await.connect("AA:BB:CC:DD:EE:FF").await?;
//!
//!     while let Some(frame) = frames.recv().await {
//!         println!("{:.1} bpm -> wet/dry {:.1}", frame.smoothed_bpm, frame.wet_dry_ratio);
//!     }
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod conditioner;
pub mod error;
pub mod events;
pub mod link;
pub mod mock;
pub mod monitor;
pub mod scan;
pub mod session;
pub mod supervisor;

pub use conditioner::{ConditionerOptions, SignalConditioner};
pub use error::{ConnectFailureReason, Error, Result};
pub use events::{EventReceiver, EventSender, SessionEvent, event_channel};
pub use link::{BleLink, SensorLink};
pub use mock::{MockLink, MockLinkController};
pub use monitor::{HeartRateMonitor, MonitorOptions};
pub use scan::{DiscoveredSensor, ScanOptions, Scanner};
pub use session::{ConnectionSession, SessionConfig, SessionState};
pub use supervisor::{ReconnectSupervisor, SupervisorOptions};

// Re-export the value types external consumers see.
pub use pulselink_types::{
    ConditionedSample, DecodeError, HeartRateSample, MetricFrame, TuningParams, WetDrySource,
};
