//! The radio seam: an abstract sensor link and its btleplug implementation.
//!
//! [`SensorLink`] is the boundary between the connection state machine and
//! the physical transport. The session drives it with awaited calls and
//! receives inbound payloads and link-loss notices through registered
//! handlers, so tests can drive the full state machine without a real
//! radio (see [`crate::mock::MockLink`]).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pulselink_types::uuids::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};

use crate::error::{Error, Result};
use crate::scan;

/// Handler invoked with each inbound notification payload.
pub type PayloadHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Handler invoked when the peer drops the link.
pub type LinkLostHandler = Box<dyn Fn() + Send + Sync>;

/// Extra discovery pass used when the peripheral is not in the adapter's
/// cache at open time. Advertisements are easy to miss, one short scan
/// usually recovers them.
const DISCOVERY_PASS: Duration = Duration::from_secs(2);

/// An open-close-subscribe view of one physical sensor link.
///
/// Implementations own the transport handle and any background tasks
/// needed to pump notifications; the session owns the policy (retries,
/// gating, state transitions).
#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Open the physical link to the peripheral at `address`, bounded by
    /// `timeout`. Any previously open link must be discarded first via
    /// [`close`](SensorLink::close).
    async fn open(&mut self, address: &str, timeout: Duration) -> Result<()>;

    /// Whether the transport reports an active link.
    async fn is_open(&self) -> bool;

    /// Resolve the heart-rate service and measurement characteristic and
    /// begin streaming notification payloads to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] / [`Error::CharacteristicNotFound`]
    /// when the expected GATT layout is absent. A characteristic without
    /// notify capability is subscribed anyway, with a warning.
    async fn subscribe(&mut self, handler: PayloadHandler) -> Result<()>;

    /// Best-effort unsubscribe from measurement notifications.
    async fn unsubscribe(&mut self) -> Result<()>;

    /// Tear the link down. Safe to call on an already-closed link.
    async fn close(&mut self) -> Result<()>;

    /// Register the handler invoked when the peer drops the link.
    ///
    /// The handler must not fire for locally requested teardown.
    fn set_link_lost_handler(&mut self, handler: LinkLostHandler);
}

/// [`SensorLink`] over a btleplug adapter.
pub struct BleLink {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    notify_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
    link_lost: Arc<Mutex<Option<LinkLostHandler>>>,
}

impl std::fmt::Debug for BleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleLink")
            .field("connected", &self.peripheral.is_some())
            .finish_non_exhaustive()
    }
}

impl BleLink {
    /// Create a link over the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAdapter`] when the host has none.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(scan::default_adapter().await?))
    }

    /// Create a link over a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripheral: None,
            notify_task: None,
            watch_task: None,
            link_lost: Arc::new(Mutex::new(None)),
        }
    }

    async fn locate(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = scan::find_peripheral(&self.adapter, address).await? {
            return Ok(peripheral);
        }

        // Not in the adapter cache; run one short discovery pass.
        debug!("peripheral not cached, running a {:?} scan", DISCOVERY_PASS);
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(DISCOVERY_PASS).await;
        self.adapter.stop_scan().await?;

        scan::find_peripheral(&self.adapter, address)
            .await?
            .ok_or_else(|| Error::SensorNotFound {
                identifier: address.to_string(),
            })
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SensorLink for BleLink {
    async fn open(&mut self, address: &str, timeout: Duration) -> Result<()> {
        let peripheral = self.locate(address).await?;

        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect", timeout))??;

        // The stack can report success while the link is already gone.
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Err(Error::NotConnected);
        }

        // Watch the adapter event stream for peer-initiated disconnects.
        let mut events = self.adapter.events().await?;
        let id = peripheral.id();
        let link_lost = Arc::clone(&self.link_lost);
        self.watch_task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event
                    && disconnected == id
                {
                    if let Some(handler) = link_lost.lock().expect("handler lock").as_ref() {
                        handler();
                    }
                    break;
                }
            }
        }));

        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn is_open(&self) -> bool {
        match &self.peripheral {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn subscribe(&mut self, handler: PayloadHandler) -> Result<()> {
        let peripheral = self.peripheral.as_ref().ok_or(Error::NotConnected)?;

        peripheral.discover_services().await?;
        let service = peripheral
            .services()
            .into_iter()
            .find(|service| service.uuid == HEART_RATE_SERVICE)
            .ok_or(Error::ServiceNotFound {
                uuid: HEART_RATE_SERVICE,
            })?;
        let characteristic = service
            .characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == HEART_RATE_MEASUREMENT)
            .cloned()
            .ok_or(Error::CharacteristicNotFound {
                uuid: HEART_RATE_MEASUREMENT,
            })?;

        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            warn!(
                properties = ?characteristic.properties,
                "measurement characteristic does not advertise notify, subscribing anyway"
            );
        }

        peripheral.subscribe(&characteristic).await?;

        let mut stream = peripheral.notifications().await?;
        let char_uuid = characteristic.uuid;
        self.notify_task = Some(tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == char_uuid {
                    handler(notification.value);
                }
            }
        }));

        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        let peripheral = self.peripheral.as_ref().ok_or(Error::NotConnected)?;
        let characteristic = peripheral
            .services()
            .into_iter()
            .flat_map(|service| service.characteristics)
            .find(|characteristic| characteristic.uuid == HEART_RATE_MEASUREMENT)
            .ok_or(Error::CharacteristicNotFound {
                uuid: HEART_RATE_MEASUREMENT,
            })?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Abort the watcher first so a local teardown never reads as
        // peer-initiated.
        self.abort_tasks();
        if let Some(peripheral) = self.peripheral.take() {
            if let Err(e) = peripheral.disconnect().await {
                debug!("best-effort disconnect failed: {}", e);
            }
        }
        Ok(())
    }

    fn set_link_lost_handler(&mut self, handler: LinkLostHandler) {
        *self.link_lost.lock().expect("handler lock") = Some(handler);
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
