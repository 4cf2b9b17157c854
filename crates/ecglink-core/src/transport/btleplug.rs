//! Desktop BLE backend over `btleplug`

use async_trait::async_trait;
use ::btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble::{Advertisement, BleAdapter, GattClient};
use crate::error::DeviceError;

/// Bound on `Peripheral::connect`; some stacks block forever on an absent device
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on service discovery after connecting
pub const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

const SCAN_CHANNEL_CAPACITY: usize = 64;
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

impl From<::btleplug::Error> for DeviceError {
    fn from(err: ::btleplug::Error) -> Self {
        match err {
            ::btleplug::Error::PermissionDenied => {
                DeviceError::PermissionDenied("bluetooth access denied".to_string())
            }
            ::btleplug::Error::NotConnected => DeviceError::NotConnected,
            ::btleplug::Error::TimedOut(_) => DeviceError::Timeout,
            other => DeviceError::Transport(other.to_string()),
        }
    }
}

fn peripheral_key(id: &PeripheralId) -> String {
    format!("{:?}", id)
}

/// [`BleAdapter`] over the first adapter `btleplug` reports
#[derive(Default)]
pub struct BtleplugAdapter {
    adapter: OnceCell<Adapter>,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    scan: Mutex<Option<CancellationToken>>,
}

impl BtleplugAdapter {
    /// Create the backend. The platform adapter is opened on first use.
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<&Adapter, DeviceError> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager.adapters().await?.into_iter().next().ok_or_else(|| {
                    DeviceError::TransportUnavailable("no bluetooth adapter found".to_string())
                })?;
                Ok::<_, DeviceError>(adapter)
            })
            .await
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn ensure_ready(&self) -> Result<(), DeviceError> {
        let adapter = self.adapter().await?;
        match adapter.adapter_state().await? {
            CentralState::PoweredOff => Err(DeviceError::TransportUnavailable(
                "bluetooth is powered off".to_string(),
            )),
            state => {
                debug!("ble: adapter state {:?}", state);
                Ok(())
            }
        }
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, DeviceError> {
        let adapter = self.adapter().await?.clone();
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let token = CancellationToken::new();
        if let Some(previous) = self
            .scan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let peripherals = self.peripherals.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => event,
                };
                let id = match event {
                    Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => id,
                    Some(_) => continue,
                    None => break,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    _ => continue,
                };

                let key = peripheral_key(&id);
                peripherals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.clone(), peripheral);
                let advertisement = Advertisement {
                    id: key,
                    name: properties.local_name,
                    rssi: properties.rssi,
                };
                if tx.send(advertisement).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), DeviceError> {
        if let Some(token) = self.scan.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        self.adapter().await?.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn GattClient>, DeviceError> {
        let adapter = self.adapter().await?.clone();
        let peripheral = self
            .peripherals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| DeviceError::ConnectionFailed(format!("unknown peripheral {}", id)))?;

        tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| DeviceError::ConnectionFailed(format!("connect to {} timed out", id)))??;

        // BlueZ reports the connection before its GATT cache is filled
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| {
                DeviceError::ConnectionFailed(format!("service discovery on {} timed out", id))
            })??;
        info!("ble: connected to {}, services discovered", id);

        let client: Arc<dyn GattClient> = Arc::new(BtleplugGatt::new(adapter, peripheral));
        Ok(client)
    }
}

/// [`GattClient`] over a connected `btleplug` peripheral
pub struct BtleplugGatt {
    peripheral: Peripheral,
    characteristics: BTreeSet<Characteristic>,
    lost: CancellationToken,
    watcher: JoinHandle<()>,
}

impl BtleplugGatt {
    fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        let lost = CancellationToken::new();
        let watcher = {
            let lost = lost.clone();
            let peripheral_id = peripheral.id();
            tokio::spawn(async move {
                let mut events = match adapter.events().await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("ble: cannot watch adapter events: {}", e);
                        return;
                    }
                };
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        if id == peripheral_id {
                            info!("ble: {:?} disconnected", id);
                            lost.cancel();
                            break;
                        }
                    }
                }
            })
        };

        Self {
            characteristics: peripheral.characteristics(),
            peripheral,
            lost,
            watcher,
        }
    }

    fn find(&self, characteristic: Uuid) -> Result<&Characteristic, DeviceError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| DeviceError::Transport(format!("characteristic {} not found", characteristic)))
    }
}

impl Drop for BtleplugGatt {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl GattClient for BtleplugGatt {
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.characteristics
            .iter()
            .any(|c| c.service_uuid == service && c.uuid == characteristic)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, DeviceError> {
        let c = self.find(characteristic)?;
        Ok(self.peripheral.read(c).await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError> {
        let c = self.find(characteristic)?;
        self.peripheral
            .write(c, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, DeviceError> {
        let c = self.find(characteristic)?;
        let mut notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(c).await?;

        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), DeviceError> {
        let c = self.find(characteristic)?;
        self.peripheral.unsubscribe(c).await?;
        Ok(())
    }

    async fn disconnected(&self) {
        self.lost.cancelled().await
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let result = self.peripheral.disconnect().await;
        self.lost.cancel();
        Ok(result?)
    }
}
