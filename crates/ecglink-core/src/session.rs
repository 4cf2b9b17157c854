//! Device session
//!
//! [`EcgSession`] is the single owner of "the" active monitor. It races USB
//! and BLE discovery, caches the winner, and forwards the device's commands
//! and waveform stream. Discovery and connection changes are serialized by
//! one async mutex, which also guards the listening flag.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::device::{DeviceFilter, EcgDevice};
use crate::discovery::{first_device, race, BleDiscovery, DeviceDiscovery, UsbDiscovery};
use crate::error::DeviceError;
use crate::transport::{error_stream, BleAdapter, ByteStream, State, UsbHost};

#[derive(Default)]
struct Active {
    device: Option<Arc<EcgDevice>>,
    listening: bool,
}

/// Session over one ECG monitor
pub struct EcgSession {
    config: SessionConfig,
    usb: Arc<dyn DeviceDiscovery>,
    ble: Arc<dyn DeviceDiscovery>,
    active: tokio::sync::Mutex<Active>,
    state: Arc<watch::Sender<State>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

fn no_device() -> DeviceError {
    DeviceError::NoDeviceFound("no device set up; call setup first".to_string())
}

impl EcgSession {
    /// Create a session over the platform's USB host and BLE adapter
    pub fn new(
        config: SessionConfig,
        usb_host: Arc<dyn UsbHost>,
        ble_adapter: Arc<dyn BleAdapter>,
    ) -> Self {
        let usb = Arc::new(UsbDiscovery::new(usb_host, &config));
        let ble = Arc::new(BleDiscovery::new(ble_adapter, &config));
        Self::with_discovery(config, usb, ble)
    }

    /// Create a session over custom discovery pipelines
    pub fn with_discovery(
        config: SessionConfig,
        usb: Arc<dyn DeviceDiscovery>,
        ble: Arc<dyn DeviceDiscovery>,
    ) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            config,
            usb,
            ble,
            active: tokio::sync::Mutex::new(Active::default()),
            state: Arc::new(state),
            forwarder: Mutex::new(None),
        }
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// State of the active device's connection
    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// The cached device, if any
    pub async fn device(&self) -> Option<Arc<EcgDevice>> {
        self.active.lock().await.device.clone()
    }

    /// True between a successful `listen` and `stop_listen`/`disconnect`
    pub async fn is_listening(&self) -> bool {
        self.active.lock().await.listening
    }

    /// Find a device, or return the cached one.
    ///
    /// With `force` the cached device is closed and a new lookup runs.
    pub async fn setup(&self, force: bool) -> Result<Arc<EcgDevice>, DeviceError> {
        let mut active = self.active.lock().await;
        self.setup_locked(&mut active, force).await
    }

    async fn setup_locked(
        &self,
        active: &mut Active,
        force: bool,
    ) -> Result<Arc<EcgDevice>, DeviceError> {
        if force {
            self.drop_device(active).await;
        }
        if let Some(device) = &active.device {
            return Ok(device.clone());
        }

        info!("session: looking for a device over usb and ble");
        let usb = self
            .usb
            .discover(self.config.usb_discovery_timeout(), &[DeviceFilter::usb()]);
        let ble = self.ble.discover(
            self.config.ble_discovery_timeout(),
            &[DeviceFilter::ble(&self.config)],
        );
        let result = race(
            (&self.usb.transmission().to_string(), first_device(usb)),
            (&self.ble.transmission().to_string(), first_device(ble)),
        )
        .await;
        self.usb.stop();
        self.ble.stop();

        let device = result?;
        info!(
            "session: using {} over {} ({})",
            device.name(),
            device.transmission(),
            device.mac()
        );
        self.follow(&device);
        active.device = Some(device.clone());
        Ok(device)
    }

    /// Mirror the device's connection state on the session's channel
    fn follow(&self, device: &EcgDevice) {
        let mut source = device.state();
        let target = self.state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let state = *source.borrow_and_update();
                target.send_replace(state);
                if source.changed().await.is_err() {
                    target.send_replace(State::Disconnected);
                    break;
                }
            }
        });
        if let Some(previous) = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
    }

    async fn drop_device(&self, active: &mut Active) {
        active.listening = false;
        let Some(device) = active.device.take() else {
            return;
        };
        if let Some(forwarder) = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            forwarder.abort();
        }
        device.close().await;
        self.state.send_replace(State::Disconnected);
        info!("session: released {}", device.name());
    }

    async fn device_for(&self, auto_discover: bool) -> Result<Arc<EcgDevice>, DeviceError> {
        let mut active = self.active.lock().await;
        match &active.device {
            Some(device) => Ok(device.clone()),
            None if auto_discover => self.setup_locked(&mut active, false).await,
            None => Err(no_device()),
        }
    }

    /// Start collecting and return the raw waveform stream.
    ///
    /// Failures are delivered as the stream's only item.
    pub async fn listen(&self, auto_discover: bool) -> ByteStream {
        let mut active = self.active.lock().await;
        let device = match &active.device {
            Some(device) => device.clone(),
            None if auto_discover => match self.setup_locked(&mut active, false).await {
                Ok(device) => device,
                Err(e) => return error_stream(e),
            },
            None => return error_stream(no_device()),
        };

        match device.listen().await {
            Ok(stream) => {
                active.listening = true;
                stream
            }
            Err(e) => {
                warn!("session: listen failed: {}", e);
                error_stream(e)
            }
        }
    }

    /// Stop collecting. Does nothing when not listening.
    pub async fn stop_listen(&self) -> Result<(), DeviceError> {
        let mut active = self.active.lock().await;
        if !active.listening {
            debug!("session: not listening");
            return Ok(());
        }
        active.listening = false;
        match &active.device {
            Some(device) => device.stop_listen().await,
            None => Ok(()),
        }
    }

    /// Read the serial number of the active device.
    ///
    /// With `auto_close` the connection is closed after the round trip; the
    /// device stays cached and reconnects on the next call.
    pub async fn read_sn(&self, auto_discover: bool, auto_close: bool) -> Result<String, DeviceError> {
        self.device_for(auto_discover)
            .await?
            .read_sn(auto_close)
            .await
    }

    /// Read the firmware version of the active device
    pub async fn read_version(
        &self,
        auto_discover: bool,
        auto_close: bool,
    ) -> Result<String, DeviceError> {
        self.device_for(auto_discover)
            .await?
            .read_version(auto_close)
            .await
    }

    /// Write a new serial number to the active device
    pub async fn write_sn(
        &self,
        sn: &str,
        auto_discover: bool,
        auto_close: bool,
    ) -> Result<(), DeviceError> {
        self.device_for(auto_discover)
            .await?
            .write_sn(sn, auto_close)
            .await
    }

    /// Close and forget the active device
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        self.drop_device(&mut active).await;
    }

    /// Stop any discovery still running
    pub fn stop_discovery(&self) {
        self.usb.stop();
        self.ble.stop();
    }
}

impl Drop for EcgSession {
    fn drop(&mut self) {
        if let Some(forwarder) = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            forwarder.abort();
        }
    }
}
