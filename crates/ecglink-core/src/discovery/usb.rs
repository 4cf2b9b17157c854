//! USB discovery

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{filters_for, DeviceDiscovery, DiscoveryStream};
use crate::config::SessionConfig;
use crate::device::{DeviceFilter, EcgDevice, Gen, Transmission};
use crate::error::DeviceError;
use crate::transport::{UsbDeviceInfo, UsbHost};

/// Looks for attached monitors
pub struct UsbDiscovery {
    host: Arc<dyn UsbHost>,
    config: SessionConfig,
    running: Mutex<Option<CancellationToken>>,
}

fn matching(device: &UsbDeviceInfo, filters: &[DeviceFilter]) -> Option<Gen> {
    filters
        .iter()
        .find_map(|f| f.matches_usb(device.vendor_id, device.product_id))
}

impl UsbDiscovery {
    /// Create a pipeline over `host`
    pub fn new(host: Arc<dyn UsbHost>, config: &SessionConfig) -> Self {
        Self {
            host,
            config: config.clone(),
            running: Mutex::new(None),
        }
    }

    /// First matching device, attached now or later
    async fn candidate(
        host: &dyn UsbHost,
        filters: &[DeviceFilter],
    ) -> Result<(UsbDeviceInfo, Gen), DeviceError> {
        for device in host.attached_devices().await? {
            if let Some(gen) = matching(&device, filters) {
                return Ok((device, gen));
            }
            debug!(
                "usb: ignoring {} ({:04x}:{:04x})",
                device.name, device.vendor_id, device.product_id
            );
        }

        debug!("usb: no matching device attached, waiting");
        while let Some(device) = host.next_attachment().await {
            if let Some(gen) = matching(&device, filters) {
                return Ok((device, gen));
            }
        }
        Err(DeviceError::NoDeviceFound(
            "usb host stopped reporting attachments".to_string(),
        ))
    }

    async fn ensure_permission(
        host: &dyn UsbHost,
        device: &UsbDeviceInfo,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        if host.has_permission(device) {
            return Ok(());
        }
        info!("usb: requesting permission for {}", device.name);
        match tokio::time::timeout(timeout, host.request_permission(device)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(DeviceError::PermissionDenied(format!(
                "access to {} denied",
                device.name
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::PermissionDenied(format!(
                "no answer to permission request for {} within {} ms",
                device.name,
                timeout.as_millis()
            ))),
        }
    }

    async fn lookup(
        host: Arc<dyn UsbHost>,
        config: &SessionConfig,
        timeout: Duration,
        filters: &[DeviceFilter],
    ) -> Result<Arc<EcgDevice>, DeviceError> {
        let (device, gen) = tokio::time::timeout(timeout, Self::candidate(host.as_ref(), filters))
            .await
            .map_err(|_| DeviceError::DiscoveryTimeout(timeout.as_millis() as u64))??;
        info!(
            "usb: found {} ({:04x}:{:04x}, {:?})",
            device.name, device.vendor_id, device.product_id, gen
        );

        Self::ensure_permission(host.as_ref(), &device, config.usb_permission_timeout()).await?;
        Ok(Arc::new(EcgDevice::usb(device, gen, host, config)))
    }
}

impl DeviceDiscovery for UsbDiscovery {
    fn transmission(&self) -> Transmission {
        Transmission::Usb
    }

    fn discover(&self, timeout: Duration, filters: &[DeviceFilter]) -> DiscoveryStream {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(1);
        let filters = filters_for(filters, Transmission::Usb);
        let host = self.host.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let result = match filters {
                Ok(filters) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!("usb: discovery stopped");
                            return;
                        }
                        result = Self::lookup(host, &config, timeout, &filters) => result,
                    }
                }
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("usb: discovery failed: {}", e);
            }
            let _ = tx.send(result.map(|device| vec![device])).await;
        });

        rx
    }

    fn stop(&self) {
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }
}
