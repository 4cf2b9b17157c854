//! BLE discovery

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{filters_for, DeviceDiscovery, DiscoveryStream};
use crate::config::SessionConfig;
use crate::device::{DeviceFilter, EcgDevice, Transmission};
use crate::error::DeviceError;
use crate::transport::BleAdapter;

/// Scans for advertising monitors
pub struct BleDiscovery {
    adapter: Arc<dyn BleAdapter>,
    config: SessionConfig,
    running: Mutex<Option<CancellationToken>>,
}

impl BleDiscovery {
    /// Create a pipeline over `adapter`. Devices it finds connect through it.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: &SessionConfig) -> Self {
        Self {
            adapter,
            config: config.clone(),
            running: Mutex::new(None),
        }
    }
}

impl DeviceDiscovery for BleDiscovery {
    fn transmission(&self) -> Transmission {
        Transmission::Ble
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

        let (tx, rx) = mpsc::channel(self.config.stream_capacity.max(1));
        let filters = filters_for(filters, Transmission::Ble);
        let adapter = self.adapter.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let filters = match filters {
                Ok(filters) => filters,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if let Err(e) = adapter.ensure_ready().await {
                warn!("ble: not ready: {}", e);
                let _ = tx.send(Err(e)).await;
                return;
            }
            let mut scan = match adapter.start_scan().await {
                Ok(scan) => scan,
                Err(e) => {
                    warn!("ble: scan failed to start: {}", e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            info!("ble: scanning for {} ms", timeout.as_millis());

            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let mut seen = HashSet::new();
            let mut found: Vec<Arc<EcgDevice>> = Vec::new();

            loop {
                let advertisement = tokio::select! {
                    _ = token.cancelled() => {
                        debug!("ble: scan stopped");
                        break;
                    }
                    _ = &mut deadline => {
                        if found.is_empty() {
                            info!("ble: no device within {} ms", timeout.as_millis());
                            let _ = tx
                                .send(Err(DeviceError::DiscoveryTimeout(timeout.as_millis() as u64)))
                                .await;
                        }
                        break;
                    }
                    advertisement = scan.recv() => advertisement,
                };
                let Some(advertisement) = advertisement else {
                    debug!("ble: scan ended");
                    break;
                };
                if seen.contains(&advertisement.id) {
                    continue;
                }
                let name = advertisement.name.as_deref();
                if !filters.iter().any(|f| f.matches_ble(name)) {
                    continue;
                }

                info!("ble: found {:?} ({})", advertisement.name, advertisement.id);
                seen.insert(advertisement.id.clone());
                found.push(Arc::new(EcgDevice::ble(
                    &advertisement,
                    adapter.clone(),
                    &config,
                )));
                let sent = tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(Ok(found.clone())) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }

            if let Err(e) = adapter.stop_scan().await {
                warn!("ble: stop scan failed: {}", e);
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Advertisement, GattClient};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAdapter {
        script: Vec<(u64, Advertisement)>,
        ready: bool,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl BleAdapter for ScriptedAdapter {
        async fn ensure_ready(&self) -> Result<(), DeviceError> {
            if self.ready {
                Ok(())
            } else {
                Err(DeviceError::TransportUnavailable("bluetooth off".into()))
            }
        }

        async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, DeviceError> {
            let (tx, rx) = mpsc::channel(8);
            let script = self.script.clone();
            tokio::spawn(async move {
                for (delay, advertisement) in script {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if tx.send(advertisement).await.is_err() {
                        return;
                    }
                }
                // keep scanning until stopped
                tx.closed().await;
            });
            Ok(rx)
        }

        async fn stop_scan(&self) -> Result<(), DeviceError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn connect(&self, _id: &str) -> Result<Arc<dyn GattClient>, DeviceError> {
            Err(DeviceError::ConnectionFailed("not in this test".into()))
        }
    }

    fn adv(id: &str, name: Option<&str>) -> Advertisement {
        Advertisement {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
        }
    }

    fn discovery(script: Vec<(u64, Advertisement)>, ready: bool) -> (BleDiscovery, Arc<ScriptedAdapter>) {
        let adapter = Arc::new(ScriptedAdapter {
            script,
            ready,
            stops: AtomicUsize::new(0),
        });
        (
            BleDiscovery::new(adapter.clone(), &SessionConfig::default()),
            adapter,
        )
    }

    fn filters() -> Vec<DeviceFilter> {
        vec![DeviceFilter::ble(&SessionConfig::default())]
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_are_aggregated() {
        let (discovery, adapter) = discovery(
            vec![
                (10, adv("A", Some("WWKECG12E"))),
                (10, adv("X", Some("Other"))),
                (10, adv("A", Some("WWKECG12E"))),
                (10, adv("B", Some("WWKECG12E"))),
            ],
            true,
        );
        let mut stream = discovery.discover(Duration::from_millis(500), &filters());

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].mac(), "A");
        let second = stream.recv().await.unwrap().unwrap();
        let macs: Vec<&str> = second.iter().map(|d| d.mac()).collect();
        assert_eq!(macs, vec!["A", "B"]);

        // timeout with results ends quietly
        assert!(stream.recv().await.is_none());
        assert_eq!(adapter.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_results() {
        let (discovery, adapter) = discovery(vec![(10, adv("X", Some("Other")))], true);
        let mut stream = discovery.discover(Duration::from_millis(100), &filters());
        assert!(matches!(
            stream.recv().await,
            Some(Err(DeviceError::DiscoveryTimeout(100)))
        ));
        assert!(stream.recv().await.is_none());
        assert_eq!(adapter.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_not_ready() {
        let (discovery, _) = discovery(Vec::new(), false);
        let mut stream = discovery.discover(Duration::from_millis(100), &filters());
        assert!(matches!(
            stream.recv().await,
            Some(Err(DeviceError::TransportUnavailable(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_filter() {
        let (discovery, _) = discovery(Vec::new(), true);
        let mut stream = discovery.discover(Duration::from_millis(100), &[DeviceFilter::usb()]);
        assert!(matches!(
            stream.recv().await,
            Some(Err(DeviceError::InvalidInput(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_stream() {
        let (discovery, adapter) = discovery(vec![(1000, adv("A", Some("WWKECG12E")))], true);
        let mut stream = discovery.discover(Duration::from_millis(5000), &filters());
        tokio::time::sleep(Duration::from_millis(10)).await;
        discovery.stop();
        assert!(stream.recv().await.is_none());
        assert_eq!(adapter.stops.load(Ordering::SeqCst), 1);
    }
}
