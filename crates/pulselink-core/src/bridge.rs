//! Local control-bridge protocol: an alternate ingestion path.
//!
//! Some hosts keep radio access in a separate helper process. The helper
//! speaks a small framed protocol over a local socket: a 4-byte
//! big-endian length prefix (at most 64 KiB) followed by a UTF-8 JSON
//! object with a `type` discriminator. This module decodes those frames
//! and feeds the same [`SessionEvent`]s into the pipeline as the BLE
//! path, physiological gate included, so the consumer cannot tell the
//! transports apart.
//!
//! Framing and decoding are generic over [`AsyncRead`], so the protocol
//! is fully testable without a socket. [`connect_and_pump`] wires it to a
//! Unix domain socket on platforms that have one.

use std::time::Instant;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use pulselink_types::{HeartRateSample, PHYSIOLOGICAL_MAX_BPM, PHYSIOLOGICAL_MIN_BPM};

use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};
use crate::session::SessionState;

/// Maximum frame payload the protocol allows.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Messages the bridge helper can send.
///
/// Unknown optional fields are tolerated; unknown `type` values fail the
/// frame (and only the frame).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// The helper finished starting up.
    Ready,
    /// Radio permission state changed on the helper's side.
    Permission {
        /// Platform-specific state string (e.g. "granted", "denied").
        state: String,
    },
    /// The helper discovered a peripheral.
    DeviceFound {
        /// Connection identifier.
        id: String,
        /// RSSI signal strength, if reported.
        #[serde(default)]
        rssi: Option<i16>,
        /// Advertised name, if any.
        #[serde(default)]
        name: Option<String>,
        /// Advertised service UUIDs, if reported.
        #[serde(default)]
        services: Vec<String>,
    },
    /// The helper connected to a peripheral.
    Connected {
        /// The peripheral the helper connected to.
        id: String,
    },
    /// One heart-rate report.
    HrData {
        /// Heart rate in BPM.
        bpm: f64,
        /// Helper-side timestamp. Ignored; samples are stamped with a
        /// local monotonic clock at ingestion.
        #[serde(default)]
        ts: Option<f64>,
        /// RR intervals in seconds, if the sensor reported them.
        #[serde(default)]
        rr: Vec<f64>,
    },
    /// The helper lost or closed its connection.
    Disconnected {
        /// Human-readable reason.
        reason: String,
    },
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream (EOF at a frame boundary).
///
/// # Errors
///
/// Returns [`Error::FrameTooLarge`] when the prefix exceeds
/// [`MAX_FRAME_LEN`], [`Error::Io`] on transport errors (including EOF
/// mid-frame), and [`Error::Json`] when the payload is not a valid
/// message.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<BridgeMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Translate one bridge message into pipeline events.
///
/// `hr_data` passes through the same physiological gate as the BLE path;
/// rejects surface as [`SessionEvent::SampleDropped`].
pub fn apply_message(message: BridgeMessage, events: &EventSender) {
    match message {
        BridgeMessage::Ready => {
            info!("bridge helper ready");
        }
        BridgeMessage::Permission { state } => {
            info!("bridge radio permission: {}", state);
        }
        BridgeMessage::DeviceFound {
            id,
            rssi,
            name,
            services,
        } => {
            debug!(?services, "bridge device found");
            let _ = events.send(SessionEvent::SensorFound { id, name, rssi });
        }
        BridgeMessage::Connected { id } => {
            info!("bridge connected to {}", id);
            let _ = events.send(SessionEvent::StateChanged {
                state: SessionState::Connected,
            });
        }
        BridgeMessage::HrData { bpm, ts: _, rr } => {
            let in_range = bpm >= f64::from(PHYSIOLOGICAL_MIN_BPM)
                && bpm <= f64::from(PHYSIOLOGICAL_MAX_BPM);
            if !in_range {
                warn!("dropping bridge sample outside physiological range: {} BPM", bpm);
                let _ = events.send(SessionEvent::SampleDropped {
                    reason: Error::OutOfPhysiologicalRange {
                        bpm: bpm.max(0.0).round() as u16,
                    }
                    .to_string(),
                });
                return;
            }
            let sample = HeartRateSample {
                bpm: bpm.round() as u16,
                rr_intervals: rr.into_iter().filter(|v| v.is_finite() && *v > 0.0).collect(),
                raw_bytes: Vec::new(),
                captured_at: Instant::now(),
            };
            let _ = events.send(SessionEvent::Sample { sample });
        }
        BridgeMessage::Disconnected { reason } => {
            let _ = events.send(SessionEvent::UnexpectedDisconnect { reason });
        }
    }
}

/// Decode frames from `reader` until end of stream, feeding the pipeline.
pub async fn pump<R>(mut reader: R, events: EventSender) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(message) = read_frame(&mut reader).await? {
        apply_message(message, &events);
    }
    debug!("bridge stream ended");
    Ok(())
}

/// Connect to the bridge helper's Unix domain socket and pump it into
/// the pipeline until the helper closes the stream.
#[cfg(unix)]
pub async fn connect_and_pump(
    path: impl AsRef<std::path::Path>,
    events: EventSender,
) -> Result<()> {
    let path = path.as_ref();
    info!("connecting to bridge socket at {}", path.display());
    let stream = tokio::net::UnixStream::connect(path).await?;
    pump(stream, events).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;

    fn frame(json: &str) -> Vec<u8> {
        let mut bytes = (json.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(json.as_bytes());
        bytes
    }

    #[tokio::test]
    async fn reads_framed_messages_and_clean_eof() {
        let mut data = frame(r#"{"type":"ready"}"#);
        data.extend(frame(r#"{"type":"hr_data","bpm":72,"ts":12.5}"#));
        let mut reader = data.as_slice();

        assert!(matches!(
            read_frame(&mut reader).await.unwrap(),
            Some(BridgeMessage::Ready)
        ));
        match read_frame(&mut reader).await.unwrap() {
            Some(BridgeMessage::HrData { bpm, ts, rr }) => {
                assert_eq!(bpm, 72.0);
                assert_eq!(ts, Some(12.5));
                assert!(rr.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_prefix_is_rejected() {
        let data = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        let mut reader = data.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let mut data = frame(r#"{"type":"ready"}"#);
        data.truncate(data.len() - 3);
        let mut reader = data.as_slice();
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn malformed_json_is_an_error() {
        let data = frame(r#"{"type":"hr_data""#);
        let mut reader = data.as_slice();
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn pump_translates_the_session_lifecycle() {
        let mut data = frame(r#"{"type":"device_found","id":"D1","rssi":-58,"name":"Polar H10"}"#);
        data.extend(frame(r#"{"type":"connected","id":"D1"}"#));
        data.extend(frame(r#"{"type":"hr_data","bpm":71,"rr":[0.84,0.86]}"#));
        data.extend(frame(r#"{"type":"disconnected","reason":"out of range"}"#));

        let (tx, mut rx) = event_channel();
        pump(data.as_slice(), tx).await.unwrap();

        match rx.try_recv().unwrap() {
            SessionEvent::SensorFound { id, name, rssi } => {
                assert_eq!(id, "D1");
                assert_eq!(name.as_deref(), Some("Polar H10"));
                assert_eq!(rssi, Some(-58));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::StateChanged {
                state: SessionState::Connected
            }
        ));
        match rx.try_recv().unwrap() {
            SessionEvent::Sample { sample } => {
                assert_eq!(sample.bpm, 71);
                assert_eq!(sample.rr_intervals, vec![0.84, 0.86]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::UnexpectedDisconnect { .. }
        ));
    }

    #[tokio::test]
    async fn bridge_samples_pass_the_same_gate() {
        let mut data = frame(r#"{"type":"hr_data","bpm":20}"#);
        data.extend(frame(r#"{"type":"hr_data","bpm":260}"#));
        data.extend(frame(r#"{"type":"hr_data","bpm":72}"#));

        let (tx, mut rx) = event_channel();
        pump(data.as_slice(), tx).await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::SampleDropped { .. }));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::SampleDropped { .. }));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Sample { .. }));
    }
}
