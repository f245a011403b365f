//! Integration tests for the session pipeline, driven over a mock link.
//!
//! These cover the cross-module behavior a real radio would exercise:
//! the connect state machine, the decode/gate path into the event
//! channel, the monitor's conditioning loop, and the synthetic-fallback
//! supervisor.

use std::time::Duration;

use pulselink_core::{
    ConnectFailureReason, Error, HeartRateMonitor, MockLink, MonitorOptions, SessionConfig,
    SessionEvent, SessionState, SupervisorOptions, WetDrySource, bridge, event_channel,
};
use pulselink_core::{ConditionerOptions, ConnectionSession};

fn fast_config() -> SessionConfig {
    SessionConfig::new()
        .connect_timeout(Duration::from_secs(1))
        .retry_backoff(Duration::from_millis(1))
}

fn drain_states(rx: &mut pulselink_core::EventReceiver) -> Vec<SessionState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::StateChanged { state } = event {
            states.push(state);
        }
    }
    states
}

// --- ConnectionSession state machine ---

#[tokio::test]
async fn unreachable_address_exhausts_exactly_max_retries() {
    let (link, ctl) = MockLink::new();
    let (tx, mut rx) = event_channel();
    let mut session = ConnectionSession::new(Box::new(link), fast_config(), tx).unwrap();
    ctl.fail_all_opens(true);

    let err = session.connect("AA:BB:CC:DD:EE:FF").await.unwrap_err();
    match err {
        Error::ConnectFailed {
            attempts, reason, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(reason, ConnectFailureReason::Timeout);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(ctl.open_attempts(), 3);
    assert_eq!(ctl.teardowns(), 3, "each attempt tears down the prior handle");
    assert_eq!(*session.state(), SessionState::Idle);
    assert!(session.last_address().is_none());

    let states = drain_states(&mut rx);
    assert_eq!(
        states,
        vec![
            SessionState::Connecting(1),
            SessionState::Connecting(2),
            SessionState::Connecting(3),
            SessionState::Failed(err_string(&states)),
            SessionState::Idle,
        ]
    );
}

// The Failed state carries a human-readable reason; recover it from the
// observed sequence so the assertion above can compare full vectors.
fn err_string(states: &[SessionState]) -> String {
    states
        .iter()
        .find_map(|s| match s {
            SessionState::Failed(reason) => Some(reason.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn transient_failures_then_success() {
    let (link, ctl) = MockLink::new();
    let (tx, mut rx) = event_channel();
    let mut session = ConnectionSession::new(Box::new(link), fast_config(), tx).unwrap();
    ctl.fail_next_opens(2);

    session.connect("AA:BB").await.unwrap();

    assert_eq!(*session.state(), SessionState::Connected);
    assert_eq!(session.last_address(), Some("AA:BB"));
    assert_eq!(ctl.open_attempts(), 3);
    assert!(ctl.is_subscribed());

    let states = drain_states(&mut rx);
    assert_eq!(
        states,
        vec![
            SessionState::Connecting(1),
            SessionState::Connecting(2),
            SessionState::Connecting(3),
            SessionState::Connected,
        ]
    );
}

#[tokio::test]
async fn missing_service_is_fatal_and_not_retried() {
    let (link, ctl) = MockLink::new();
    let (tx, _rx) = event_channel();
    let mut session = ConnectionSession::new(Box::new(link), fast_config(), tx).unwrap();
    ctl.missing_service(true);

    let err = session.connect("AA:BB").await.unwrap_err();
    assert!(matches!(err, Error::ServiceNotFound { .. }));
    assert_eq!(ctl.open_attempts(), 1, "GATT layout errors must not retry");
    assert_eq!(*session.state(), SessionState::Idle);
}

#[tokio::test]
async fn missing_characteristic_is_fatal_and_not_retried() {
    let (link, ctl) = MockLink::new();
    let (tx, _rx) = event_channel();
    let mut session = ConnectionSession::new(Box::new(link), fast_config(), tx).unwrap();
    ctl.missing_characteristic(true);

    let err = session.connect("AA:BB").await.unwrap_err();
    assert!(matches!(err, Error::CharacteristicNotFound { .. }));
    assert_eq!(ctl.open_attempts(), 1);
}

#[tokio::test]
async fn reconnect_tears_down_the_previous_link_first() {
    let (link, ctl) = MockLink::new();
    let (tx, _rx) = event_channel();
    let mut session = ConnectionSession::new(Box::new(link), fast_config(), tx).unwrap();

    session.connect("AA:BB").await.unwrap();
    let teardowns_after_first = ctl.teardowns();

    session.connect("CC:DD").await.unwrap();
    assert!(ctl.teardowns() > teardowns_after_first);
    assert_eq!(session.last_address(), Some("CC:DD"));
    assert_eq!(*session.state(), SessionState::Connected);
}

#[tokio::test]
async fn disconnect_resets_to_idle_and_stops_notifications() {
    let (link, ctl) = MockLink::new();
    let (tx, mut rx) = event_channel();
    let mut session = ConnectionSession::new(Box::new(link), fast_config(), tx).unwrap();

    session.connect("AA:BB").await.unwrap();
    while rx.try_recv().is_ok() {}

    session.disconnect().await;
    assert_eq!(*session.state(), SessionState::Idle);
    assert!(!ctl.is_open());
    assert!(!ctl.is_subscribed());

    // Notifications after teardown go nowhere.
    ctl.push_payload(&[0x00, 72]);
    let states = drain_states(&mut rx);
    assert_eq!(
        states,
        vec![SessionState::Disconnecting, SessionState::Idle]
    );
}

#[tokio::test]
async fn deliberate_disconnect_is_not_reported_as_unexpected() {
    let (link, ctl) = MockLink::new();
    let (tx, mut rx) = event_channel();
    let mut session = ConnectionSession::new(Box::new(link), fast_config(), tx).unwrap();

    session.connect("AA:BB").await.unwrap();
    session.disconnect().await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, SessionEvent::UnexpectedDisconnect { .. }),
            "local teardown must not look peer-initiated"
        );
    }

    // A peer-initiated drop, by contrast, is surfaced.
    session.connect("AA:BB").await.unwrap();
    while rx.try_recv().is_ok() {}
    ctl.drop_link();
    let mut saw_unexpected = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, SessionEvent::UnexpectedDisconnect { .. }) {
            saw_unexpected = true;
        }
    }
    assert!(saw_unexpected);
}

// --- Decode and gate on the live path ---

#[tokio::test]
async fn payloads_are_decoded_gated_and_forwarded() {
    let (link, ctl) = MockLink::new();
    let (tx, mut rx) = event_channel();
    let mut session = ConnectionSession::new(Box::new(link), fast_config(), tx).unwrap();
    session.connect("AA:BB").await.unwrap();
    while rx.try_recv().is_ok() {}

    ctl.push_payload(&[0x10, 70, 0x64, 0x02]); // valid, one RR interval
    ctl.push_payload(&[0x00, 20]); // below the physiological gate
    ctl.push_payload(&[0x01, 72]); // truncated 16-bit value
    ctl.push_payload(&[0x00, 75]); // valid

    let mut samples = Vec::new();
    let mut dropped = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            SessionEvent::Sample { sample } => samples.push(sample),
            SessionEvent::SampleDropped { .. } => dropped += 1,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].bpm, 70);
    assert_eq!(samples[0].rr_intervals, vec![612.0 / 1024.0]);
    assert_eq!(samples[1].bpm, 75);
    assert_eq!(dropped, 2, "one range reject, one decode reject");
}

// --- Monitor pipeline ---

#[tokio::test]
async fn monitor_conditions_live_samples_end_to_end() {
    let (link, ctl) = MockLink::new();
    let mut monitor = HeartRateMonitor::new(
        Box::new(link),
        MonitorOptions::new().conditioner(
            ConditionerOptions::new()
                .smoothing_factor(0.1)
                .source(WetDrySource::Raw),
        ),
    )
    .unwrap();
    let mut frames = monitor.take_frames().unwrap();
    let session = monitor.session().unwrap();
    let cancel = monitor.cancellation_token();
    let task = tokio::spawn(monitor.run());

    session.lock().await.connect("AA:BB").await.unwrap();
    ctl.push_payload(&[0x00, 72]);
    ctl.push_payload(&[0x00, 80]);

    let first = frames.recv().await.unwrap();
    assert_eq!(first.raw_bpm, 72.0);
    assert_eq!(first.smoothed_bpm, 72.0, "EMA seeds from the first sample");
    // baseline for 72 BPM: (72-40)/140 -> 10 + 0.2286 * 80 = 28.29
    assert!((first.wet_dry_ratio - 28.2857).abs() < 1e-3);

    let second = frames.recv().await.unwrap();
    assert_eq!(second.raw_bpm, 80.0);
    assert!((second.smoothed_bpm - 79.27).abs() < 0.01);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn link_loss_with_hold_lock_feeds_synthetic_samples() {
    let (link, ctl) = MockLink::new();
    let mut monitor = HeartRateMonitor::new(
        Box::new(link),
        MonitorOptions::new()
            .hold_lock(true)
            // Long reconnect interval keeps this test on the synthetic path.
            .supervisor(SupervisorOptions::new().reconnect_interval(Duration::from_secs(3600))),
    )
    .unwrap();
    let mut frames = monitor.take_frames().unwrap();
    let session = monitor.session().unwrap();
    let cancel = monitor.cancellation_token();
    let task = tokio::spawn(monitor.run());

    session.lock().await.connect("AA:BB").await.unwrap();
    ctl.push_payload(&[0x00, 80]);
    let live = frames.recv().await.unwrap();
    assert_eq!(live.raw_bpm, 80.0);

    ctl.drop_link();

    // Synthetic samples keep arriving, seeded near the last value and
    // bounded to the walk range.
    for _ in 0..5 {
        let frame = frames.recv().await.unwrap();
        assert!((40.0..=180.0).contains(&frame.raw_bpm));
        assert!((frame.raw_bpm - 80.0).abs() < 10.0, "walk stays near its seed");
    }

    assert_eq!(
        *session.lock().await.state(),
        SessionState::Idle,
        "loss acknowledged in the consumer context"
    );

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_stops_simulation_and_blends_to_live() {
    let (link, ctl) = MockLink::new();
    let mut monitor = HeartRateMonitor::new(
        Box::new(link),
        MonitorOptions::new()
            .hold_lock(true)
            .session(fast_config()),
    )
    .unwrap();
    let mut frames = monitor.take_frames().unwrap();
    let session = monitor.session().unwrap();
    let cancel = monitor.cancellation_token();
    let task = tokio::spawn(monitor.run());

    session.lock().await.connect("AA:BB").await.unwrap();
    ctl.push_payload(&[0x00, 80]);
    let _ = frames.recv().await.unwrap();

    // Peer drops the link; the supervisor simulates and schedules
    // reconnection against the recorded address.
    ctl.drop_link();
    let _ = frames.recv().await.unwrap(); // at least one synthetic frame

    // The mock accepts the reconnect on the supervisor's next attempt.
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if *session.lock().await.state() == SessionState::Connected {
            break;
        }
    }

    // Let the monitor process the state change, then drain leftovers.
    tokio::time::sleep(Duration::from_millis(10)).await;
    while frames.try_recv().is_ok() {}

    // Live samples now blend from the last synthetic value to the
    // incoming value over the fixed window; no discontinuity.
    let mut observed = Vec::new();
    for _ in 0..12 {
        ctl.push_payload(&[0x00, 100]);
    }
    for _ in 0..12 {
        observed.push(frames.recv().await.unwrap().raw_bpm);
    }

    assert!(
        (observed[0] - 100.0).abs() > 5.0,
        "first post-reconnect frame starts at the synthetic value, got {}",
        observed[0]
    );
    for pair in observed.windows(2) {
        assert!(pair[1] >= pair[0] - 1e-9, "blend approaches live monotonically");
    }
    assert_eq!(*observed.last().unwrap(), 100.0, "blend window ends on live values");

    cancel.cancel();
    task.await.unwrap();
}

// --- Control bridge as an equivalent ingestion path ---

fn frame_bytes(json: &str) -> Vec<u8> {
    let mut bytes = (json.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(json.as_bytes());
    bytes
}

#[tokio::test]
async fn bridge_stream_drives_a_detached_monitor() {
    let mut monitor = HeartRateMonitor::detached(MonitorOptions::new()).unwrap();
    let mut frames = monitor.take_frames().unwrap();
    let events = monitor.event_sender();
    let cancel = monitor.cancellation_token();
    let task = tokio::spawn(monitor.run());

    let mut data = frame_bytes(r#"{"type":"ready"}"#);
    data.extend(frame_bytes(r#"{"type":"connected","id":"D1"}"#));
    data.extend(frame_bytes(r#"{"type":"hr_data","bpm":72,"rr":[0.84,0.86]}"#));
    bridge::pump(data.as_slice(), events).await.unwrap();

    let frame = frames.recv().await.unwrap();
    assert_eq!(frame.raw_bpm, 72.0);
    assert_eq!(frame.smoothed_bpm, 72.0);
    assert!(frame.wet_dry_ratio >= 1.0 && frame.wet_dry_ratio <= 100.0);

    cancel.cancel();
    task.await.unwrap();
}
