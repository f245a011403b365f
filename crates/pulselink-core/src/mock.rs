//! Mock sensor link for testing without BLE hardware.
//!
//! [`MockLink`] implements [`SensorLink`] so the full connection state
//! machine, gate, and pipeline can be driven from tests. The paired
//! [`MockLinkController`] stays on the test side and can inject
//! notification payloads, trigger peer-initiated link loss, and script
//! failures:
//!
//! - **Transient failures**: fail the next N opens, or all of them
//! - **GATT-layout failures**: report the service or characteristic missing
//! - **Latency**: delay opens to exercise timeouts

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use pulselink_types::uuids::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};

use crate::error::{Error, Result};
use crate::link::{LinkLostHandler, PayloadHandler, SensorLink};

#[derive(Default)]
struct MockShared {
    open: AtomicBool,
    subscribed: AtomicBool,
    open_attempts: AtomicU32,
    teardowns: AtomicU32,
    remaining_open_failures: AtomicU32,
    fail_all_opens: AtomicBool,
    missing_service: AtomicBool,
    missing_characteristic: AtomicBool,
    open_latency_ms: AtomicU64,
    last_address: Mutex<Option<String>>,
    payload_handler: Mutex<Option<PayloadHandler>>,
    link_lost_handler: Mutex<Option<LinkLostHandler>>,
}

/// A scriptable [`SensorLink`] backed by no radio at all.
pub struct MockLink {
    shared: Arc<MockShared>,
}

/// Test-side handle to a [`MockLink`].
#[derive(Clone)]
pub struct MockLinkController {
    shared: Arc<MockShared>,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("open", &self.shared.open.load(Ordering::Relaxed))
            .field("subscribed", &self.shared.subscribed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MockLink {
    /// Create a link/controller pair.
    pub fn new() -> (Self, MockLinkController) {
        let shared = Arc::new(MockShared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockLinkController { shared },
        )
    }
}

impl MockLinkController {
    /// Fail the next `n` open calls with a timeout, then succeed.
    pub fn fail_next_opens(&self, n: u32) {
        self.shared.remaining_open_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every open call (an unreachable address).
    pub fn fail_all_opens(&self, on: bool) {
        self.shared.fail_all_opens.store(on, Ordering::SeqCst);
    }

    /// Report the heart-rate service as absent on subscribe.
    pub fn missing_service(&self, on: bool) {
        self.shared.missing_service.store(on, Ordering::SeqCst);
    }

    /// Report the measurement characteristic as absent on subscribe.
    pub fn missing_characteristic(&self, on: bool) {
        self.shared.missing_characteristic.store(on, Ordering::SeqCst);
    }

    /// Delay each open by `latency`.
    pub fn open_latency(&self, latency: Duration) {
        self.shared
            .open_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Deliver a notification payload, as the radio would.
    ///
    /// Silently ignored when no subscription is active, matching a real
    /// stack dropping notifications after unsubscribe.
    pub fn push_payload(&self, payload: &[u8]) {
        if !self.shared.subscribed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handler) = self.shared.payload_handler.lock().expect("handler lock").as_ref() {
            handler(payload.to_vec());
        }
    }

    /// Drop the link as the peer would: closes it and fires the
    /// link-lost handler.
    pub fn drop_link(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.subscribed.store(false, Ordering::SeqCst);
        if let Some(handler) = self
            .shared
            .link_lost_handler
            .lock()
            .expect("handler lock")
            .as_ref()
        {
            handler();
        }
    }

    /// How many times `open` was called.
    pub fn open_attempts(&self) -> u32 {
        self.shared.open_attempts.load(Ordering::SeqCst)
    }

    /// How many times `close` was called.
    pub fn teardowns(&self) -> u32 {
        self.shared.teardowns.load(Ordering::SeqCst)
    }

    /// Whether the link is currently open.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Whether a subscription is active.
    pub fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::SeqCst)
    }

    /// The address the link was last opened to.
    pub fn last_address(&self) -> Option<String> {
        self.shared.last_address.lock().expect("address lock").clone()
    }
}

#[async_trait]
impl SensorLink for MockLink {
    async fn open(&mut self, address: &str, timeout: Duration) -> Result<()> {
        self.shared.open_attempts.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_address.lock().expect("address lock") = Some(address.to_string());

        let latency = self.shared.open_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            sleep(Duration::from_millis(latency)).await;
        }

        if self.shared.fail_all_opens.load(Ordering::SeqCst) {
            return Err(Error::timeout("connect", timeout));
        }
        if self.shared.remaining_open_failures.load(Ordering::SeqCst) > 0 {
            self.shared
                .remaining_open_failures
                .fetch_sub(1, Ordering::SeqCst);
            return Err(Error::timeout("connect", timeout));
        }

        self.shared.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn subscribe(&mut self, handler: PayloadHandler) -> Result<()> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if self.shared.missing_service.load(Ordering::SeqCst) {
            return Err(Error::ServiceNotFound {
                uuid: HEART_RATE_SERVICE,
            });
        }
        if self.shared.missing_characteristic.load(Ordering::SeqCst) {
            return Err(Error::CharacteristicNotFound {
                uuid: HEART_RATE_MEASUREMENT,
            });
        }
        *self.shared.payload_handler.lock().expect("handler lock") = Some(handler);
        self.shared.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if !self.shared.subscribed.swap(false, Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        *self.shared.payload_handler.lock().expect("handler lock") = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.teardowns.fetch_add(1, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.subscribed.store(false, Ordering::SeqCst);
        *self.shared.payload_handler.lock().expect("handler lock") = None;
        Ok(())
    }

    fn set_link_lost_handler(&mut self, handler: LinkLostHandler) {
        *self.shared.link_lost_handler.lock().expect("handler lock") = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_close_round_trip() {
        let (mut link, ctl) = MockLink::new();
        link.open("AA:BB", Duration::from_secs(1)).await.unwrap();
        assert!(ctl.is_open());
        assert_eq!(ctl.last_address().as_deref(), Some("AA:BB"));
        link.close().await.unwrap();
        assert!(!ctl.is_open());
        assert_eq!(ctl.open_attempts(), 1);
        assert_eq!(ctl.teardowns(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let (mut link, ctl) = MockLink::new();
        ctl.fail_next_opens(2);
        assert!(link.open("X", Duration::from_secs(1)).await.is_err());
        assert!(link.open("X", Duration::from_secs(1)).await.is_err());
        assert!(link.open("X", Duration::from_secs(1)).await.is_ok());
        assert_eq!(ctl.open_attempts(), 3);
    }

    #[tokio::test]
    async fn payloads_reach_the_handler_only_while_subscribed() {
        let (mut link, ctl) = MockLink::new();
        link.open("X", Duration::from_secs(1)).await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        link.subscribe(Box::new(move |payload| {
            sink.lock().unwrap().push(payload);
        }))
        .await
        .unwrap();

        ctl.push_payload(&[0x00, 72]);
        link.unsubscribe().await.unwrap();
        ctl.push_payload(&[0x00, 73]);

        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drop_link_fires_the_handler() {
        let (mut link, ctl) = MockLink::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        link.set_link_lost_handler(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        link.open("X", Duration::from_secs(1)).await.unwrap();
        ctl.drop_link();
        assert!(fired.load(Ordering::SeqCst));
        assert!(!ctl.is_open());
    }
}
