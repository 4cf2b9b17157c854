//! BLE GATT transport
//!
//! The monitor exposes one service with two characteristics: `fe41` takes
//! command frames (write without response, then read back the response) and
//! `fe42` notifies waveform frames.
//!
//! The platform BLE stack is reached through [`BleAdapter`] and
//! [`GattClient`]; see the `btleplug` feature for a desktop implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ByteStream, Channel, ChannelId, Connection, State};
use crate::config::SessionConfig;
use crate::error::DeviceError;
use crate::protocol::hex;

/// ECG service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe40_cc7a_482a_984a_7f2ed5b3e58f);

/// Command characteristic (channel 1)
pub const COMMAND_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fe41_8e22_4541_9d4c_21edae82ed19);

/// Waveform notify characteristic (channel 2)
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fe42_8e22_4541_9d4c_21edae82ed19);

/// A scan result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform identifier of the peripheral (MAC address on most stacks)
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength
    pub rssi: Option<i16>,
}

/// Platform BLE central
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Check that Bluetooth is present, enabled and permitted.
    ///
    /// Fails with [`DeviceError::PermissionDenied`] or
    /// [`DeviceError::TransportUnavailable`].
    async fn ensure_ready(&self) -> Result<(), DeviceError>;

    /// Start scanning. Every advertisement seen is delivered, duplicates included.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, DeviceError>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<(), DeviceError>;

    /// Connect to a peripheral and discover its services
    async fn connect(&self, id: &str) -> Result<Arc<dyn GattClient>, DeviceError>;
}

/// An open GATT client
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Whether the discovered services contain the characteristic
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Read a characteristic value
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, DeviceError>;

    /// Write without response
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError>;

    /// Enable notifications
    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, DeviceError>;

    /// Disable notifications
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), DeviceError>;

    /// Resolves once the link is lost or closed
    async fn disconnected(&self);

    /// Close the link
    async fn close(&self) -> Result<(), DeviceError>;
}

/// A channel bound to one characteristic
pub struct GattChannel {
    id: ChannelId,
    client: Arc<dyn GattClient>,
    characteristic: Uuid,
    capacity: usize,
    teardown: Duration,
    listening: Mutex<Option<CancellationToken>>,
}

impl GattChannel {
    /// Create a channel over `characteristic`
    pub fn new(
        id: ChannelId,
        client: Arc<dyn GattClient>,
        characteristic: Uuid,
        capacity: usize,
        teardown: Duration,
    ) -> Self {
        Self {
            id,
            client,
            characteristic,
            capacity: capacity.max(1),
            teardown,
            listening: Mutex::new(None),
        }
    }

    /// Characteristic this channel reads and writes
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    fn cancel_listen(&self) -> bool {
        let token = self
            .listening
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Channel for GattChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn read(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        let response = tokio::time::timeout(timeout, async {
            if !request.is_empty() {
                debug!("ble: read {} on {}", hex(request), self.characteristic);
                self.client.write(self.characteristic, request).await?;
            }
            self.client.read(self.characteristic).await
        })
        .await??;
        debug!("ble: response {}", hex(&response));
        Ok(response)
    }

    async fn write(&self, data: &[u8], timeout: Duration) -> Result<(), DeviceError> {
        debug!("ble: write {} on {}", hex(data), self.characteristic);
        tokio::time::timeout(timeout, self.client.write(self.characteristic, data)).await?
    }

    async fn listen(&self) -> Result<ByteStream, DeviceError> {
        self.cancel_listen();
        let mut notifications = self.client.subscribe(self.characteristic).await?;

        let token = CancellationToken::new();
        *self.listening.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let (tx, rx) = mpsc::channel(self.capacity);
        let characteristic = self.characteristic;
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    _ = token.cancelled() => break,
                    data = notifications.recv() => data,
                };
                let Some(data) = data else {
                    debug!("ble: notifications on {} ended", characteristic);
                    break;
                };
                // suspend on a full stream; stop waiting if cancelled
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(Ok(data)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn stop_listen(&self) -> Result<(), DeviceError> {
        if !self.cancel_listen() {
            return Ok(());
        }
        match tokio::time::timeout(self.teardown, self.client.unsubscribe(self.characteristic)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "ble: unsubscribe from {} unanswered after {} ms",
                    self.characteristic,
                    self.teardown.as_millis()
                );
                Ok(())
            }
        }
    }
}

struct BleLink {
    client: Arc<dyn GattClient>,
    channels: Mutex<HashMap<ChannelId, Arc<GattChannel>>>,
    watcher: JoinHandle<()>,
}

impl BleLink {
    fn cancel_listeners(&self) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        for channel in channels.values() {
            channel.cancel_listen();
        }
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

struct Shared {
    link: RwLock<Option<BleLink>>,
    state: watch::Sender<State>,
}

/// Connection to a BLE monitor
pub struct BleConnection {
    name: String,
    peripheral_id: String,
    adapter: Arc<dyn BleAdapter>,
    capacity: usize,
    teardown: Duration,
    shared: Arc<Shared>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl BleConnection {
    /// Create an unconnected connection to `peripheral_id`
    pub fn new(
        name: impl Into<String>,
        peripheral_id: impl Into<String>,
        adapter: Arc<dyn BleAdapter>,
        config: &SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            name: name.into(),
            peripheral_id: peripheral_id.into(),
            adapter,
            capacity: config.stream_capacity,
            teardown: config.teardown_timeout(),
            shared: Arc::new(Shared {
                link: RwLock::new(None),
                state,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn is_linked(&self) -> bool {
        self.shared
            .link
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn spawn_watcher(&self, client: Arc<dyn GattClient>) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let name = self.name.clone();
        tokio::spawn(async move {
            client.disconnected().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let lost = {
                let mut link = shared.link.write().unwrap_or_else(|e| e.into_inner());
                match link.as_ref() {
                    Some(current) if Arc::ptr_eq(&current.client, &client) => link.take(),
                    _ => None,
                }
            };
            if let Some(lost) = lost {
                info!("{}: link lost", name);
                lost.cancel_listeners();
                shared.state.send_replace(State::Disconnected);
            }
        })
    }
}

#[async_trait]
impl Connection for BleConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self, id: ChannelId) -> Result<Arc<dyn Channel>, DeviceError> {
        let guard = self.shared.link.read().unwrap_or_else(|e| e.into_inner());
        let link = guard.as_ref().ok_or(DeviceError::NotConnected)?;

        let characteristic = match id {
            ChannelId::COMMAND => COMMAND_CHARACTERISTIC,
            ChannelId::STREAM => NOTIFY_CHARACTERISTIC,
            other => return Err(DeviceError::ChannelNotFound(other.get())),
        };
        if !link.client.has_characteristic(SERVICE_UUID, characteristic) {
            return Err(DeviceError::ChannelNotFound(id.get()));
        }

        let mut channels = link.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel: Arc<dyn Channel> = channels
            .entry(id)
            .or_insert_with(|| {
                Arc::new(GattChannel::new(
                    id,
                    link.client.clone(),
                    characteristic,
                    self.capacity,
                    self.teardown,
                ))
            })
            .clone();
        Ok(channel)
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_linked() {
            self.shared.state.send_replace(State::Connected);
            return Ok(());
        }

        self.shared.state.send_replace(State::Connecting);
        info!("{}: connecting to {}", self.name, self.peripheral_id);

        let client = match self.adapter.connect(&self.peripheral_id).await {
            Ok(client) => client,
            Err(e) => {
                self.shared.state.send_replace(State::Disconnected);
                return Err(match e {
                    DeviceError::ConnectionFailed(_) | DeviceError::PermissionDenied(_) => e,
                    other => DeviceError::ConnectionFailed(other.to_string()),
                });
            }
        };

        if !client.has_characteristic(SERVICE_UUID, COMMAND_CHARACTERISTIC) {
            match tokio::time::timeout(self.teardown, client.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}: close after failed handshake: {}", self.name, e),
                Err(_) => warn!("{}: close after failed handshake unanswered", self.name),
            }
            self.shared.state.send_replace(State::Disconnected);
            return Err(DeviceError::ConnectionFailed(format!(
                "service {} not found on {}",
                SERVICE_UUID, self.peripheral_id
            )));
        }

        let watcher = self.spawn_watcher(client.clone());
        *self.shared.link.write().unwrap_or_else(|e| e.into_inner()) = Some(BleLink {
            client,
            channels: Mutex::new(HashMap::new()),
            watcher,
        });
        self.shared.state.send_replace(State::Connected);
        info!("{}: connected", self.name);
        Ok(())
    }

    async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        let link = self
            .shared
            .link
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(link) = link {
            link.cancel_listeners();
            match tokio::time::timeout(self.teardown, link.client.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}: close failed: {}", self.name, e),
                Err(_) => warn!(
                    "{}: close unanswered after {} ms, dropping the link",
                    self.name,
                    self.teardown.as_millis()
                ),
            }
            info!("{}: disconnected", self.name);
        }
        if *self.shared.state.borrow() != State::Idle {
            self.shared.state.send_replace(State::Disconnected);
        }
    }

    fn state(&self) -> watch::Receiver<State> {
        self.shared.state.subscribe()
    }
}
