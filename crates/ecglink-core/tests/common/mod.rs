//! In-memory monitor doubles shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use ecglink_core::config::SerialSettings;
use ecglink_core::demo::DemoSimulator;
use ecglink_core::error::DeviceError;
use ecglink_core::protocol::{Command, Frame, FRAME_HEAD, SN_XOR_KEY};
use ecglink_core::transport::ble::{COMMAND_CHARACTERISTIC, SERVICE_UUID};
use ecglink_core::transport::{Advertisement, BleAdapter, GattClient, SerialIo, UsbDeviceInfo, UsbHost};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use uuid::Uuid;

pub const FIRMWARE: &str = "ECG-3.1.7";
pub const SERIAL: &str = "C1220230304000000";
pub const SN_SUB_HEADER: [u8; 4] = [0x43, 0x31, 0x32, 0x20];

/// Frames per streamed chunk
pub const CHUNK_FRAMES: usize = 5;

/// Install a test subscriber; `RUST_LOG=debug cargo test` shows the traffic
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Command handling shared by the USB and BLE doubles
pub struct Monitor {
    serial: Mutex<String>,
    streaming: AtomicBool,
    commands: Mutex<Vec<u8>>,
}

impl Monitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            serial: Mutex::new(SERIAL.to_string()),
            streaming: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Command bytes received so far, in order
    pub fn commands(&self) -> Vec<u8> {
        self.commands.lock().unwrap().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn serial(&self) -> String {
        self.serial.lock().unwrap().clone()
    }

    /// Handle one command frame, returning the response frame if any
    pub fn handle(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let command = frame[1];
        self.commands.lock().unwrap().push(command);
        match Command::from_byte(command)? {
            Command::ReadVersion => Some(
                Frame::new(command, FIRMWARE.as_bytes().to_vec())
                    .unwrap()
                    .to_bytes(),
            ),
            Command::ReadSn => {
                let mut payload = SN_SUB_HEADER.to_vec();
                payload.extend(self.serial().bytes().map(|b| b ^ SN_XOR_KEY));
                Some(Frame::new(command, payload).unwrap().to_bytes())
            }
            Command::WriteSn => {
                let len = frame[2] as usize;
                *self.serial.lock().unwrap() =
                    String::from_utf8(frame[3..3 + len].to_vec()).unwrap();
                None
            }
            Command::StartCollectUsb | Command::StartCollectBle => {
                self.streaming.store(true, Ordering::SeqCst);
                None
            }
            Command::StopCollect => {
                self.streaming.store(false, Ordering::SeqCst);
                None
            }
        }
    }
}

/// Split complete command frames off the front of `pending`
fn take_frames(pending: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        while !pending.is_empty() && pending[0] != FRAME_HEAD {
            pending.remove(0);
        }
        let Some(len) = Frame::expected_len(pending) else {
            break;
        };
        if pending.len() < len {
            break;
        }
        frames.push(pending.drain(..len).collect());
    }
    frames
}

pub fn usb_info(name: &str, vendor_id: u16, product_id: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        name: name.to_string(),
        vendor_id,
        product_id,
        serial_number: Some("0001".to_string()),
        product: Some("ECG Monitor".to_string()),
    }
}

/// USB host with one monitor behind a duplex pipe
pub struct FakeUsbHost {
    pub monitor: Arc<Monitor>,
    /// Devices reported attached, after `enumerate_delay`
    pub attached: Vec<UsbDeviceInfo>,
    pub enumerate_delay: Duration,
    pub opens: AtomicUsize,
}

impl FakeUsbHost {
    pub fn new(attached: Vec<UsbDeviceInfo>, enumerate_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            monitor: Monitor::new(),
            attached,
            enumerate_delay,
            opens: AtomicUsize::new(0),
        })
    }

    /// A host with a Gen3 monitor attached
    pub fn with_monitor(enumerate_delay: Duration) -> Arc<Self> {
        Self::new(vec![usb_info("/dev/ttyACM0", 1155, 22336)], enumerate_delay)
    }

    /// A host with nothing attached that never reports an attachment
    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new(), Duration::ZERO)
    }
}

#[async_trait]
impl UsbHost for FakeUsbHost {
    async fn attached_devices(&self) -> Result<Vec<UsbDeviceInfo>, DeviceError> {
        tokio::time::sleep(self.enumerate_delay).await;
        Ok(self.attached.clone())
    }

    async fn next_attachment(&self) -> Option<UsbDeviceInfo> {
        std::future::pending().await
    }

    fn has_permission(&self, _device: &UsbDeviceInfo) -> bool {
        true
    }

    async fn request_permission(&self, _device: &UsbDeviceInfo) -> Result<bool, DeviceError> {
        Ok(true)
    }

    async fn open(
        &self,
        _device: &UsbDeviceInfo,
        _settings: &SerialSettings,
    ) -> Result<Box<dyn SerialIo>, DeviceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (host_side, mut device_side) = tokio::io::duplex(64 * 1024);
        let monitor = self.monitor.clone();

        tokio::spawn(async move {
            let mut sim = DemoSimulator::seeded(11);
            let mut pending = Vec::new();
            let mut buf = [0u8; 256];
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            loop {
                tokio::select! {
                    n = device_side.read(&mut buf) => {
                        let n = match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        pending.extend_from_slice(&buf[..n]);
                        for frame in take_frames(&mut pending) {
                            if let Some(response) = monitor.handle(&frame) {
                                if device_side.write_all(&response).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    _ = tick.tick() => {
                        if monitor.is_streaming()
                            && device_side.write_all(&sim.frames(CHUNK_FRAMES)).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::new(host_side))
    }
}

/// GATT client of the BLE monitor
pub struct FakeGatt {
    monitor: Arc<Monitor>,
    value: Mutex<Vec<u8>>,
    notify: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    streamer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pub lost: Notify,
}

impl FakeGatt {
    fn new(monitor: Arc<Monitor>) -> Self {
        Self {
            monitor,
            value: Mutex::new(Vec::new()),
            notify: Mutex::new(None),
            streamer: Mutex::new(None),
            lost: Notify::new(),
        }
    }

    fn start_streaming(&self) {
        let Some(tx) = self.notify.lock().unwrap().clone() else {
            return;
        };
        let monitor = self.monitor.clone();
        let handle = tokio::spawn(async move {
            let mut sim = DemoSimulator::seeded(5);
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            while monitor.is_streaming() {
                tick.tick().await;
                if tx.send(sim.frames(CHUNK_FRAMES)).await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.streamer.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }
}

#[async_trait]
impl GattClient for FakeGatt {
    fn has_characteristic(&self, service: Uuid, _characteristic: Uuid) -> bool {
        service == SERVICE_UUID
    }

    async fn read(&self, _characteristic: Uuid) -> Result<Vec<u8>, DeviceError> {
        Ok(self.value.lock().unwrap().clone())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError> {
        assert_eq!(characteristic, COMMAND_CHARACTERISTIC);
        if let Some(response) = self.monitor.handle(data) {
            *self.value.lock().unwrap() = response;
        }
        if data[1] == Command::StartCollectBle.byte() {
            self.start_streaming();
        }
        Ok(())
    }

    async fn subscribe(&self, _characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, DeviceError> {
        let (tx, rx) = mpsc::channel(16);
        *self.notify.lock().unwrap() = Some(tx);
        if self.monitor.is_streaming() {
            self.start_streaming();
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, _characteristic: Uuid) -> Result<(), DeviceError> {
        self.notify.lock().unwrap().take();
        if let Some(streamer) = self.streamer.lock().unwrap().take() {
            streamer.abort();
        }
        Ok(())
    }

    async fn disconnected(&self) {
        self.lost.notified().await
    }

    async fn close(&self) -> Result<(), DeviceError> {
        if let Some(streamer) = self.streamer.lock().unwrap().take() {
            streamer.abort();
        }
        Ok(())
    }
}

/// BLE adapter advertising one monitor after a delay
pub struct FakeBleAdapter {
    pub monitor: Arc<Monitor>,
    pub ready: bool,
    /// Advertisements and the delay before each
    pub script: Vec<(Duration, Advertisement)>,
    /// Times at which `stop_scan` was called
    pub stops: Mutex<Vec<Instant>>,
    pub gatt: Mutex<Option<Arc<FakeGatt>>>,
}

impl FakeBleAdapter {
    pub fn new(ready: bool, script: Vec<(Duration, Advertisement)>) -> Arc<Self> {
        Arc::new(Self {
            monitor: Monitor::new(),
            ready,
            script,
            stops: Mutex::new(Vec::new()),
            gatt: Mutex::new(None),
        })
    }

    /// A monitor advertising under the default name after `delay`
    pub fn with_monitor(delay: Duration) -> Arc<Self> {
        Self::new(
            true,
            vec![(
                delay,
                Advertisement {
                    id: "C4:7F:51:00:12:E4".to_string(),
                    name: Some("WWKECG12E".to_string()),
                    rssi: Some(-58),
                },
            )],
        )
    }

    /// Bluetooth switched off
    pub fn unavailable() -> Arc<Self> {
        Self::new(false, Vec::new())
    }

    pub fn stop_times(&self) -> Vec<Instant> {
        self.stops.lock().unwrap().clone()
    }

    /// Simulate link loss on the connected client
    pub fn drop_link(&self) {
        if let Some(gatt) = self.gatt.lock().unwrap().as_ref() {
            gatt.lost.notify_one();
        }
    }
}

#[async_trait]
impl BleAdapter for FakeBleAdapter {
    async fn ensure_ready(&self) -> Result<(), DeviceError> {
        if self.ready {
            Ok(())
        } else {
            Err(DeviceError::TransportUnavailable("bluetooth is off".to_string()))
        }
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, DeviceError> {
        let (tx, rx) = mpsc::channel(8);
        let script = self.script.clone();
        tokio::spawn(async move {
            for (delay, advertisement) in script {
                tokio::time::sleep(delay).await;
                if tx.send(advertisement).await.is_err() {
                    return;
                }
            }
            tx.closed().await;
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), DeviceError> {
        self.stops.lock().unwrap().push(Instant::now());
        Ok(())
    }

    async fn connect(&self, _id: &str) -> Result<Arc<dyn GattClient>, DeviceError> {
        let gatt = Arc::new(FakeGatt::new(self.monitor.clone()));
        *self.gatt.lock().unwrap() = Some(gatt.clone());
        Ok(gatt)
    }
}
