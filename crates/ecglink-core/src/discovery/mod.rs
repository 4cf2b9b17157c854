//! Device discovery
//!
//! Each transport has a pipeline that produces a live list of matching
//! devices, bounded by a timeout and cancellable with
//! [`DeviceDiscovery::stop`]. [`race`] runs two lookups side by side.

mod ble;
mod usb;

pub use ble::BleDiscovery;
pub use usb::UsbDiscovery;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::device::{DeviceFilter, EcgDevice, Transmission};
use crate::error::DeviceError;

/// Successive device lists, or the failure that ended the lookup
pub type DiscoveryStream = mpsc::Receiver<Result<Vec<Arc<EcgDevice>>, DeviceError>>;

/// A discovery pipeline for one transport
pub trait DeviceDiscovery: Send + Sync {
    /// Transport this pipeline searches
    fn transmission(&self) -> Transmission;

    /// Start looking for devices accepted by any of `filters`.
    ///
    /// A running lookup is stopped first.
    fn discover(&self, timeout: Duration, filters: &[DeviceFilter]) -> DiscoveryStream;

    /// Stop the running lookup, if any. Its stream ends.
    fn stop(&self);
}

/// Wait for the first device a lookup reports
pub async fn first_device(mut stream: DiscoveryStream) -> Result<Arc<EcgDevice>, DeviceError> {
    while let Some(item) = stream.recv().await {
        if let Some(device) = item?.into_iter().next() {
            return Ok(device);
        }
    }
    Err(DeviceError::NoDeviceFound(
        "lookup ended without a match".to_string(),
    ))
}

/// Run two lookups concurrently.
///
/// The first success wins and the other lookup is dropped. A failure does not
/// decide the race: the other lookup is awaited, and only when both fail is
/// [`DeviceError::NoDeviceFound`] returned, naming both causes.
pub async fn race<T, A, B>(a: (&str, A), b: (&str, B)) -> Result<T, DeviceError>
where
    A: Future<Output = Result<T, DeviceError>>,
    B: Future<Output = Result<T, DeviceError>>,
{
    let (a_name, a) = a;
    let (b_name, b) = b;
    tokio::pin!(a);
    tokio::pin!(b);

    let both_failed = |a_err: DeviceError, b_err: DeviceError| {
        DeviceError::NoDeviceFound(format!("{}: {}; {}: {}", a_name, a_err, b_name, b_err))
    };

    tokio::select! {
        result = &mut a => match result {
            Ok(value) => {
                info!("discovery: {} won", a_name);
                Ok(value)
            }
            Err(a_err) => {
                debug!("discovery: {} failed first: {}", a_name, a_err);
                b.await.map_err(|b_err| both_failed(a_err, b_err))
            }
        },
        result = &mut b => match result {
            Ok(value) => {
                info!("discovery: {} won", b_name);
                Ok(value)
            }
            Err(b_err) => {
                debug!("discovery: {} failed first: {}", b_name, b_err);
                a.await.map_err(|a_err| both_failed(a_err, b_err))
            }
        },
    }
}

/// Filters that apply to `transmission`, or `InvalidInput` if there are none
fn filters_for(
    filters: &[DeviceFilter],
    transmission: Transmission,
) -> Result<Vec<DeviceFilter>, DeviceError> {
    let matching: Vec<DeviceFilter> = filters
        .iter()
        .filter(|f| f.transmission() == transmission)
        .cloned()
        .collect();
    if matching.is_empty() {
        return Err(DeviceError::InvalidInput(format!(
            "no {} filter given",
            transmission
        )));
    }
    Ok(matching)
}
