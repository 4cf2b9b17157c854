//! ECG devices and scan filters
//!
//! An [`EcgDevice`] pairs one [`Connection`] with the command set of its
//! transport. It is created by discovery when a scan or enumeration result
//! matches a [`DeviceFilter`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{CommandTimeouts, SessionConfig};
use crate::error::DeviceError;
use crate::protocol::EcgCommands;
use crate::transport::{
    Advertisement, BleAdapter, BleConnection, ByteStream, Connection, State, UsbConnection,
    UsbDeviceInfo, UsbHost,
};

/// Physical transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transmission {
    /// Bluetooth Low Energy GATT
    Ble,
    /// USB CDC serial
    Usb,
}

impl fmt::Display for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transmission::Ble => write!(f, "ble"),
            Transmission::Usb => write!(f, "usb"),
        }
    }
}

/// Hardware generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gen {
    /// Second generation
    Gen2,
    /// Third generation
    Gen3,
}

/// USB identification of a hardware generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsbId {
    /// Vendor 4292, or product 60000/60001
    Gen2,
    /// Vendor 1155 with product 22336
    Gen3,
}

impl UsbId {
    /// Every known generation, newest first
    pub const ALL: [UsbId; 2] = [UsbId::Gen3, UsbId::Gen2];

    /// Whether a vendor/product pair identifies this generation
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        match self {
            UsbId::Gen2 => vendor_id == 4292 || product_id == 60000 || product_id == 60001,
            UsbId::Gen3 => vendor_id == 1155 && product_id == 22336,
        }
    }

    /// Generation this id identifies
    pub fn gen(&self) -> Gen {
        match self {
            UsbId::Gen2 => Gen::Gen2,
            UsbId::Gen3 => Gen::Gen3,
        }
    }
}

/// Accepts or rejects scan results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transmission", rename_all = "lowercase")]
pub enum DeviceFilter {
    /// Match BLE advertisements by local name
    Ble {
        /// Exact advertised name
        name: String,
        /// When non-empty, names starting with it match too
        name_mask: String,
    },
    /// Match attached USB devices by vendor/product id
    Usb {
        /// Filter name, for logs
        name: String,
        /// Unused for USB matching, kept for symmetry with BLE
        name_mask: String,
        /// Accepted generations, tried in order
        ids: Vec<UsbId>,
    },
}

impl DeviceFilter {
    /// The BLE filter described by `config`
    pub fn ble(config: &SessionConfig) -> Self {
        DeviceFilter::Ble {
            name: config.ble_device_name.clone(),
            name_mask: config.ble_name_mask.clone(),
        }
    }

    /// A USB filter accepting every known generation
    pub fn usb() -> Self {
        DeviceFilter::Usb {
            name: "usb-ecg".to_string(),
            name_mask: String::new(),
            ids: UsbId::ALL.to_vec(),
        }
    }

    /// Transport this filter applies to
    pub fn transmission(&self) -> Transmission {
        match self {
            DeviceFilter::Ble { .. } => Transmission::Ble,
            DeviceFilter::Usb { .. } => Transmission::Usb,
        }
    }

    /// Whether an advertised name matches. Always false for USB filters.
    pub fn matches_ble(&self, advertised: Option<&str>) -> bool {
        let DeviceFilter::Ble { name, name_mask } = self else {
            return false;
        };
        match advertised {
            Some(advertised) => {
                advertised == name || (!name_mask.is_empty() && advertised.starts_with(name_mask))
            }
            None => false,
        }
    }

    /// Generation of a matching USB device. Always `None` for BLE filters.
    pub fn matches_usb(&self, vendor_id: u16, product_id: u16) -> Option<Gen> {
        let DeviceFilter::Usb { ids, .. } = self else {
            return None;
        };
        ids.iter()
            .find(|id| id.matches(vendor_id, product_id))
            .map(UsbId::gen)
    }
}

/// A discovered monitor
pub struct EcgDevice {
    name: String,
    mac: String,
    transmission: Transmission,
    gen: Gen,
    commands: EcgCommands,
    timeouts: CommandTimeouts,
    connection: Box<dyn Connection>,
    command_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for EcgDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcgDevice")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .field("transmission", &self.transmission)
            .field("gen", &self.gen)
            .field("connection", &self.connection.name())
            .finish()
    }
}

impl EcgDevice {
    /// Assemble a device from its parts
    pub fn new(
        name: impl Into<String>,
        mac: impl Into<String>,
        transmission: Transmission,
        gen: Gen,
        commands: EcgCommands,
        timeouts: CommandTimeouts,
        connection: Box<dyn Connection>,
    ) -> Self {
        Self {
            name: name.into(),
            mac: mac.into(),
            transmission,
            gen,
            commands,
            timeouts,
            connection,
            command_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A BLE monitor seen in `advertisement`
    pub fn ble(
        advertisement: &Advertisement,
        adapter: Arc<dyn BleAdapter>,
        config: &SessionConfig,
    ) -> Self {
        let name = advertisement
            .name
            .clone()
            .unwrap_or_else(|| config.ble_device_name.clone());
        let connection = BleConnection::new(
            format!("ble-{}", name),
            advertisement.id.clone(),
            adapter,
            config,
        );
        Self::new(
            name,
            advertisement.id.clone(),
            Transmission::Ble,
            Gen::Gen3,
            EcgCommands::ble().with_checksum(config.checksum_policy()),
            config.ble_timeouts,
            Box::new(connection),
        )
    }

    /// A USB monitor attached as `device`
    pub fn usb(
        device: UsbDeviceInfo,
        gen: Gen,
        host: Arc<dyn UsbHost>,
        config: &SessionConfig,
    ) -> Self {
        let name = device
            .product
            .clone()
            .unwrap_or_else(|| format!("USB ECG {:?}", gen));
        let mac = device.serial_number.clone().unwrap_or_default();
        let connection = UsbConnection::new(format!("usb-{}", device.name), device, host, config);
        Self::new(
            name,
            mac,
            Transmission::Usb,
            gen,
            EcgCommands::usb().with_checksum(config.checksum_policy()),
            config.usb_timeouts,
            Box::new(connection),
        )
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hardware address (BLE) or serial number (USB), if known
    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// Transport the device is reached over
    pub fn transmission(&self) -> Transmission {
        self.transmission
    }

    /// Hardware generation
    pub fn gen(&self) -> Gen {
        self.gen
    }

    /// Command set for this transport
    pub fn commands(&self) -> &EcgCommands {
        &self.commands
    }

    /// The underlying connection
    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Subscribe to connection state changes
    pub fn state(&self) -> watch::Receiver<State> {
        self.connection.state()
    }

    /// Open the connection if it is not open yet
    pub async fn connect(&self) -> Result<(), DeviceError> {
        self.connection.connect().await
    }

    async fn round_trip(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        self.connection.connect().await?;
        self.connection.channel1()?.read(request, timeout).await
    }

    async fn send(&self, data: &[u8], timeout: Duration) -> Result<(), DeviceError> {
        self.connection.connect().await?;
        self.connection.channel1()?.write(data, timeout).await
    }

    async fn finish<T>(&self, result: Result<T, DeviceError>, auto_close: bool) -> Result<T, DeviceError> {
        if auto_close {
            self.connection.disconnect().await;
        }
        result
    }

    /// Send `request` on the command channel and return the response.
    ///
    /// With `auto_close` the connection is closed afterwards, whatever the outcome.
    pub async fn read(
        &self,
        request: &[u8],
        timeout: Duration,
        auto_close: bool,
    ) -> Result<Vec<u8>, DeviceError> {
        let _guard = self.command_lock.lock().await;
        let result = self.round_trip(request, timeout).await;
        self.finish(result, auto_close).await
    }

    /// Send `data` on the command channel without waiting for a response
    pub async fn write(
        &self,
        data: &[u8],
        timeout: Duration,
        auto_close: bool,
    ) -> Result<(), DeviceError> {
        let _guard = self.command_lock.lock().await;
        let result = self.send(data, timeout).await;
        self.finish(result, auto_close).await
    }

    /// Start collecting and subscribe to the waveform stream.
    ///
    /// A running subscription is ended first.
    pub async fn listen(&self) -> Result<ByteStream, DeviceError> {
        let _guard = self.command_lock.lock().await;
        self.connection.connect().await?;
        let stream = self.connection.channel2()?;
        stream.stop_listen().await?;

        self.send(&self.commands.start_collect, self.timeouts.start_collect())
            .await?;
        info!("{}: collecting", self.name);
        stream.listen().await
    }

    /// Unsubscribe from the waveform stream and stop collecting
    pub async fn stop_listen(&self) -> Result<(), DeviceError> {
        let _guard = self.command_lock.lock().await;
        match self.connection.channel2() {
            Ok(stream) => {
                if let Err(e) = stream.stop_listen().await {
                    warn!("{}: stop listen failed: {}", self.name, e);
                }
            }
            Err(e) => debug!("{}: no stream to stop: {}", self.name, e),
        }
        self.send(&self.commands.stop_collect, self.timeouts.stop_collect())
            .await?;
        info!("{}: stopped collecting", self.name);
        Ok(())
    }

    /// Read the serial number
    pub async fn read_sn(&self, auto_close: bool) -> Result<String, DeviceError> {
        let response = self
            .read(&self.commands.read_sn, self.timeouts.command(), auto_close)
            .await?;
        Ok(self.commands.parse_sn(&response)?)
    }

    /// Write a new serial number
    pub async fn write_sn(&self, sn: &str, auto_close: bool) -> Result<(), DeviceError> {
        let request = self.commands.pack_sn(sn)?;
        self.write(&request, self.timeouts.command(), auto_close).await
    }

    /// Read the firmware version
    pub async fn read_version(&self, auto_close: bool) -> Result<String, DeviceError> {
        let response = self
            .read(&self.commands.read_version, self.timeouts.command(), auto_close)
            .await?;
        Ok(self.commands.parse_version(&response)?)
    }

    /// Close the connection. Errors are logged, never returned.
    pub async fn close(&self) {
        self.connection.disconnect().await;
    }
}
