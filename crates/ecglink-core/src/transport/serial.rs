//! Serial port handling
//!
//! Desktop access to USB CDC monitors through the operating system's serial
//! port layer. [`SerialPortHost`] implements [`UsbHost`] on top of it.

use async_trait::async_trait;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::{HashMap, HashSet};
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::Mutex;
use std::time::Duration;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use super::usb::{SerialIo, UsbDeviceInfo, UsbHost};
use crate::config::{Parity, SerialSettings};
use crate::error::DeviceError;

/// Interval at which [`SerialPortHost`] re-enumerates ports while waiting
pub const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

impl PortInfo {
    /// USB identity of the port, if it is a USB port
    pub fn usb_device(&self) -> Option<UsbDeviceInfo> {
        Some(UsbDeviceInfo {
            name: self.name.clone(),
            vendor_id: self.vid?,
            product_id: self.pid?,
            serial_number: self.serial_number.clone(),
            product: self.product.clone(),
        })
    }
}

/// Sort key putting ttyACM* first, then ttyUSB*, then everything else
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // CDC ports the enumeration API missed; without USB ids they never match a filter
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port with the given line parameters and DTR asserted
pub fn open_port(name: &str, settings: &SerialSettings) -> Result<SerialStream, DeviceError> {
    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(DeviceError::InvalidInput(format!(
                "unsupported data bits: {}",
                other
            )))
        }
    };
    let stop_bits = match settings.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            return Err(DeviceError::InvalidInput(format!(
                "unsupported stop bits: {}",
                other
            )))
        }
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };

    let mut port = tokio_serial::new(name, settings.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| DeviceError::ConnectionFailed(format!("{}: {}", name, e)))?;

    // the monitor only transmits while DTR is asserted
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("{}: failed to set DTR high: {} (continuing)", name, e);
    }

    Ok(port)
}

/// [`UsbHost`] over the operating system's serial ports.
///
/// Desktop systems have no per-device permission prompt, so permission is
/// always reported as granted. Attachments are detected by re-enumerating.
#[derive(Debug, Default)]
pub struct SerialPortHost {
    known: Mutex<HashSet<String>>,
}

impl SerialPortHost {
    /// Create a host with no known ports
    pub fn new() -> Self {
        Self::default()
    }

    async fn usb_ports() -> Result<Vec<UsbDeviceInfo>, DeviceError> {
        let ports = tokio::task::spawn_blocking(list_ports)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        Ok(ports.iter().filter_map(PortInfo::usb_device).collect())
    }
}

#[async_trait]
impl UsbHost for SerialPortHost {
    async fn attached_devices(&self) -> Result<Vec<UsbDeviceInfo>, DeviceError> {
        let devices = Self::usb_ports().await?;
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.clear();
        known.extend(devices.iter().map(|d| d.name.clone()));
        Ok(devices)
    }

    async fn next_attachment(&self) -> Option<UsbDeviceInfo> {
        loop {
            tokio::time::sleep(ATTACH_POLL_INTERVAL).await;
            let devices = match Self::usb_ports().await {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("usb: port enumeration failed: {}", e);
                    return None;
                }
            };
            let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
            let attached = devices.iter().find(|d| !known.contains(&d.name)).cloned();
            known.clear();
            known.extend(devices.iter().map(|d| d.name.clone()));
            if let Some(device) = attached {
                debug!("usb: attached {}", device.name);
                return Some(device);
            }
        }
    }

    fn has_permission(&self, _device: &UsbDeviceInfo) -> bool {
        true
    }

    async fn request_permission(&self, _device: &UsbDeviceInfo) -> Result<bool, DeviceError> {
        Ok(true)
    }

    async fn open(
        &self,
        device: &UsbDeviceInfo,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialIo>, DeviceError> {
        let port = open_port(&device.name, settings)?;
        Ok(Box::new(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    #[test]
    fn test_list_ports() {
        // This test just ensures the function doesn't panic
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names.into_iter().map(|n| port(n, None, None)).collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_usb_device_requires_ids() {
        assert!(port("/dev/ttyACM0", None, None).usb_device().is_none());
        assert!(port("/dev/ttyACM0", Some(1155), None).usb_device().is_none());

        let device = port("/dev/ttyACM0", Some(1155), Some(22336))
            .usb_device()
            .unwrap();
        assert_eq!((device.vendor_id, device.product_id), (1155, 22336));
    }

    #[test]
    fn test_open_rejects_bad_settings() {
        let settings = SerialSettings {
            data_bits: 9,
            ..SerialSettings::default()
        };
        assert!(matches!(
            open_port("/dev/null", &settings),
            Err(DeviceError::InvalidInput(_))
        ));
    }
}
