//! USB CDC serial transport
//!
//! A single serial port carries both command/response traffic and the
//! waveform stream. A reader task copies everything the port delivers into a
//! bounded [`ReadWriteBuffer`]. Command reads drain it and pick out the frame
//! whose first two bytes match the request; while streaming, the buffer is
//! drained into the listen stream instead and commands are refused.

use async_trait::async_trait;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ByteStream, Channel, ChannelId, Connection, State};
use crate::config::{SerialSettings, SessionConfig, DEFAULT_USB_BUFFER_CAPACITY};
use crate::error::DeviceError;
use crate::protocol::{hex, Frame};
use crate::waveform::FRAME_LEN;

/// Size of a single read from the port (200 waveform frames)
pub const TRANSFER_BUFFER_SIZE: usize = FRAME_LEN * 200;

/// Interval at which a command read polls for its response
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Byte pipe to a serial device
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

/// An attached USB device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbDeviceInfo {
    /// Platform name (port path on desktop, device name on mobile)
    pub name: String,
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Serial number string descriptor, if readable
    pub serial_number: Option<String>,
    /// Product string descriptor, if readable
    pub product: Option<String>,
}

/// Platform USB host
#[async_trait]
pub trait UsbHost: Send + Sync {
    /// Devices attached right now
    async fn attached_devices(&self) -> Result<Vec<UsbDeviceInfo>, DeviceError>;

    /// Wait for the next device to be attached. `None` once the host can no
    /// longer report attachments.
    async fn next_attachment(&self) -> Option<UsbDeviceInfo>;

    /// Whether the application may open the device
    fn has_permission(&self, device: &UsbDeviceInfo) -> bool;

    /// Ask the user for access. Resolves to the answer.
    async fn request_permission(&self, device: &UsbDeviceInfo) -> Result<bool, DeviceError>;

    /// Open the device as a serial port with the given line parameters
    async fn open(
        &self,
        device: &UsbDeviceInfo,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialIo>, DeviceError>;
}

/// Bounded receive buffer shared by the reader task and its consumers
#[derive(Debug)]
pub struct ReadWriteBuffer {
    data: RwLock<Vec<u8>>,
    capacity: usize,
}

impl ReadWriteBuffer {
    /// Create an empty buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a chunk. A chunk that does not fit is dropped whole.
    pub fn write(&self, chunk: &[u8]) -> bool {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        if data.len() + chunk.len() > self.capacity {
            warn!(
                "usb: receive buffer overflow, dropping {} bytes ({} buffered)",
                chunk.len(),
                data.len()
            );
            return false;
        }
        data.extend_from_slice(chunk);
        true
    }

    /// Take everything buffered so far
    pub fn drain(&self) -> Vec<u8> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *data)
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of bytes held
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ReadWriteBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_USB_BUFFER_CAPACITY)
    }
}

/// Locate a complete response frame starting with `prefix` in `pending`
fn find_response(pending: &[u8], prefix: &[u8]) -> Option<Range<usize>> {
    let mut start = 0;
    while start + prefix.len() <= pending.len() {
        if pending[start..].starts_with(prefix) {
            return match Frame::expected_len(&pending[start..]) {
                Some(len) if start + len <= pending.len() => Some(start..start + len),
                // rest of the frame still in flight
                _ => None,
            };
        }
        start += 1;
    }
    None
}

/// Command and stream access to one open serial port
pub struct CdcTransfer {
    name: String,
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn SerialIo>>>,
    buffer: Arc<ReadWriteBuffer>,
    collecting: AtomicBool,
    /// Buffer holds only bytes received since the last command write
    synced: AtomicBool,
    listen_token: Mutex<Option<CancellationToken>>,
    link_error: Arc<Mutex<Option<String>>>,
    reader: JoinHandle<()>,
    poll_interval: Duration,
    stream_capacity: usize,
    teardown: Duration,
}

impl CdcTransfer {
    /// Take over an open port and start its reader task.
    ///
    /// `on_closed` runs once when the port stops delivering data.
    pub fn start(
        name: impl Into<String>,
        io: Box<dyn SerialIo>,
        config: &SessionConfig,
        on_closed: impl FnOnce() + Send + 'static,
    ) -> Self {
        let name = name.into();
        let (mut read_half, write_half) = tokio::io::split(io);
        let buffer = Arc::new(ReadWriteBuffer::new(config.usb_buffer_capacity));
        let link_error = Arc::new(Mutex::new(None));

        let reader = {
            let buffer = buffer.clone();
            let link_error = link_error.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let mut chunk = vec![0u8; TRANSFER_BUFFER_SIZE];
                loop {
                    match read_half.read(&mut chunk).await {
                        Ok(0) => {
                            debug!("{}: port closed", name);
                            *link_error.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some("port closed".to_string());
                            break;
                        }
                        Ok(n) => {
                            buffer.write(&chunk[..n]);
                        }
                        Err(e) => {
                            warn!("{}: read failed: {}", name, e);
                            *link_error.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some(e.to_string());
                            break;
                        }
                    }
                }
                on_closed();
            })
        };

        Self {
            name,
            writer: tokio::sync::Mutex::new(write_half),
            buffer,
            collecting: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            listen_token: Mutex::new(None),
            link_error,
            reader,
            poll_interval: config.usb_poll_interval(),
            stream_capacity: config.stream_capacity.max(1),
            teardown: config.teardown_timeout(),
        }
    }

    /// True while the waveform stream owns the port
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    /// True until the port closes or fails
    pub fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }

    fn link_error(&self) -> Option<String> {
        self.link_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn ensure_idle(&self, op: &str) -> Result<(), DeviceError> {
        if self.is_collecting() {
            return Err(DeviceError::Busy(format!(
                "usb {} not supported while collecting data",
                op
            )));
        }
        if let Some(err) = self.link_error() {
            return Err(DeviceError::Transport(err));
        }
        Ok(())
    }

    async fn send(
        writer: &mut WriteHalf<Box<dyn SerialIo>>,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        tokio::time::timeout(timeout, async {
            writer.write_all(data).await?;
            writer.flush().await
        })
        .await??;
        Ok(())
    }

    fn discard_stale(&self) {
        let stale = self.buffer.drain();
        if !stale.is_empty() {
            debug!("{}: discarding {} stale bytes", self.name, stale.len());
        }
    }

    /// Write without waiting for a response
    pub async fn write(&self, data: &[u8], timeout: Duration) -> Result<(), DeviceError> {
        self.ensure_idle("write")?;
        let mut writer = self.writer.lock().await;
        self.discard_stale();
        debug!("{}: write {}", self.name, hex(data));
        let result = Self::send(&mut writer, data, timeout).await;
        self.synced.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    /// Write a command and wait for the frame that answers it
    pub async fn read(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        if request.len() < 2 {
            return Err(DeviceError::InvalidInput("invalid read request".to_string()));
        }
        self.ensure_idle("read")?;

        let deadline = Instant::now() + timeout;
        let mut writer = self.writer.lock().await;
        self.discard_stale();
        // whatever follows the response is not aligned to anything
        self.synced.store(false, Ordering::SeqCst);

        debug!("{}: read {}", self.name, hex(request));
        Self::send(&mut writer, request, timeout).await?;

        let mut pending = Vec::new();
        loop {
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
            pending.extend(self.buffer.drain());
            if let Some(range) = find_response(&pending, &request[..2]) {
                let response = pending[range].to_vec();
                debug!("{}: response {}", self.name, hex(&response));
                return Ok(response);
            }
            if let Some(err) = self.link_error() {
                return Err(DeviceError::Transport(err));
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout);
            }
        }
    }

    /// Hand the port to a waveform stream.
    ///
    /// Bytes buffered since the last command write (the start-collect
    /// command) are kept; anything older is discarded so the stream starts
    /// on a frame boundary. Buffered bytes are delivered in whole 31-byte
    /// frames; a partial frame waits for the rest.
    pub fn listen(self: &Arc<Self>) -> Result<ByteStream, DeviceError> {
        if let Some(err) = self.link_error() {
            return Err(DeviceError::Transport(err));
        }
        if !self.synced.swap(false, Ordering::SeqCst) {
            self.discard_stale();
        }
        let token = CancellationToken::new();
        if let Some(previous) = self
            .listen_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }
        self.collecting.store(true, Ordering::SeqCst);
        info!("{}: start collecting", self.name);

        let (tx, rx) = mpsc::channel(self.stream_capacity);
        let transfer = self.clone();
        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(transfer.poll_interval) => {}
                }
                pending.extend(transfer.buffer.drain());
                let whole = pending.len() / FRAME_LEN * FRAME_LEN;
                if whole > 0 {
                    let chunk: Vec<u8> = pending.drain(..whole).collect();
                    tokio::select! {
                        _ = token.cancelled() => break,
                        sent = tx.send(Ok(chunk)) => {
                            if sent.is_err() {
                                debug!("{}: listener dropped", transfer.name);
                                transfer.collecting.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                }
                if let Some(err) = transfer.link_error() {
                    let _ = tx.send(Err(DeviceError::Transport(err))).await;
                    transfer.collecting.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// End the waveform stream, if any. Returns whether one was running.
    pub fn stop_listen(&self) -> bool {
        let token = self
            .listen_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.collecting.store(false, Ordering::SeqCst);
        match token {
            Some(token) => {
                token.cancel();
                info!("{}: stop collecting", self.name);
                true
            }
            None => false,
        }
    }

    /// Stop streaming, stop the reader and shut the port down.
    ///
    /// A port that does not finish shutting down within the teardown bound
    /// is abandoned.
    pub async fn close(&self) {
        self.stop_listen();
        self.reader.abort();
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(self.teardown, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}: shutdown failed: {}", self.name, e),
            Err(_) => warn!(
                "{}: shutdown unanswered after {} ms",
                self.name,
                self.teardown.as_millis()
            ),
        }
    }
}

impl Drop for CdcTransfer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Channel over a [`CdcTransfer`]
pub struct CdcChannel {
    id: ChannelId,
    transfer: Arc<CdcTransfer>,
}

impl CdcChannel {
    /// Create a channel view of the transfer
    pub fn new(id: ChannelId, transfer: Arc<CdcTransfer>) -> Self {
        Self { id, transfer }
    }
}

#[async_trait]
impl Channel for CdcChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn read(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        self.transfer.read(request, timeout).await
    }

    async fn write(&self, data: &[u8], timeout: Duration) -> Result<(), DeviceError> {
        self.transfer.write(data, timeout).await
    }

    async fn listen(&self) -> Result<ByteStream, DeviceError> {
        self.transfer.listen()
    }

    async fn stop_listen(&self) -> Result<(), DeviceError> {
        if !self.transfer.stop_listen() {
            debug!("usb: no need to stop listen");
        }
        Ok(())
    }
}

struct UsbLink {
    transfer: Arc<CdcTransfer>,
    channels: Mutex<HashMap<ChannelId, Arc<dyn Channel>>>,
}

/// Connection to a USB monitor
pub struct UsbConnection {
    name: String,
    device: UsbDeviceInfo,
    host: Arc<dyn UsbHost>,
    config: SessionConfig,
    link: RwLock<Option<UsbLink>>,
    state: Arc<watch::Sender<State>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl UsbConnection {
    /// Create an unconnected connection to `device`
    pub fn new(
        name: impl Into<String>,
        device: UsbDeviceInfo,
        host: Arc<dyn UsbHost>,
        config: &SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            name: name.into(),
            device,
            host,
            config: config.clone(),
            link: RwLock::new(None),
            state: Arc::new(state),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The device this connection opens
    pub fn device(&self) -> &UsbDeviceInfo {
        &self.device
    }

    fn take_link(&self) -> Option<UsbLink> {
        self.link.write().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait]
impl Connection for UsbConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self, id: ChannelId) -> Result<Arc<dyn Channel>, DeviceError> {
        let guard = self.link.read().unwrap_or_else(|e| e.into_inner());
        let link = guard.as_ref().ok_or(DeviceError::NotConnected)?;
        if id != ChannelId::COMMAND && id != ChannelId::STREAM {
            return Err(DeviceError::ChannelNotFound(id.get()));
        }

        let mut channels = link.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel = channels
            .entry(id)
            .or_insert_with(|| -> Arc<dyn Channel> {
                Arc::new(CdcChannel::new(id, link.transfer.clone()))
            });
        Ok(channel.clone())
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        let _guard = self.connect_lock.lock().await;
        let alive = self
            .link
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|link| link.transfer.is_alive());
        match alive {
            Some(true) => {
                self.state.send_replace(State::Connected);
                return Ok(());
            }
            Some(false) => {
                debug!("{}: dropping dead port", self.name);
                self.take_link();
            }
            None => {}
        }

        self.state.send_replace(State::Connecting);
        info!("{}: opening {}", self.name, self.device.name);
        let io = match self.host.open(&self.device, &self.config.serial).await {
            Ok(io) => io,
            Err(e) => {
                self.state.send_replace(State::Disconnected);
                return Err(match e {
                    DeviceError::ConnectionFailed(_) | DeviceError::PermissionDenied(_) => e,
                    other => DeviceError::ConnectionFailed(other.to_string()),
                });
            }
        };

        let state = Arc::downgrade(&self.state);
        let transfer = CdcTransfer::start(self.name.clone(), io, &self.config, move || {
            if let Some(state) = state.upgrade() {
                state.send_replace(State::Disconnected);
            }
        });
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = Some(UsbLink {
            transfer: Arc::new(transfer),
            channels: Mutex::new(HashMap::new()),
        });
        self.state.send_replace(State::Connected);
        info!("{}: connected", self.name);
        Ok(())
    }

    async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        if let Some(link) = self.take_link() {
            link.transfer.close().await;
            info!("{}: disconnected", self.name);
        }
        if *self.state.borrow() != State::Idle {
            self.state.send_replace(State::Disconnected);
        }
    }

    fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_drops_overflowing_chunk() {
        let buffer = ReadWriteBuffer::new(8);
        assert!(buffer.write(&[1; 5]));
        assert!(!buffer.write(&[2; 4]));
        assert_eq!(buffer.len(), 5);
        assert!(buffer.write(&[3; 3]));
        assert_eq!(buffer.drain(), vec![1, 1, 1, 1, 1, 3, 3, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_find_response() {
        let prefix = [0xA5, 0x05];
        let frame = Frame::new(0x05, b"1.0".to_vec()).unwrap().to_bytes();

        let mut pending = vec![0x00, 0x11, 0xA5, 0x06];
        pending.extend_from_slice(&frame);
        pending.extend_from_slice(&[0x42, 0x42]);
        let range = find_response(&pending, &prefix).unwrap();
        assert_eq!(&pending[range], frame.as_slice());

        // incomplete frame
        assert_eq!(find_response(&frame[..4], &prefix), None);
        assert_eq!(find_response(&frame[..2], &prefix), None);
        assert_eq!(find_response(&[0xA5], &prefix), None);
        assert_eq!(find_response(&[], &prefix), None);
    }

    fn transfer_with_device() -> (Arc<CdcTransfer>, tokio::io::DuplexStream) {
        let (host_side, device_side) = tokio::io::duplex(1024);
        let config = SessionConfig::default();
        let transfer = CdcTransfer::start("usb-test", Box::new(host_side), &config, || {});
        (Arc::new(transfer), device_side)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_matches_response_to_command() {
        let (transfer, mut device) = transfer_with_device();
        let request = crate::protocol::Command::ReadVersion.frame();
        let response = Frame::new(0x05, b"V3".to_vec()).unwrap().to_bytes();

        let reply = response.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 5];
            device.read_exact(&mut buf).await.unwrap();
            // unrelated traffic first
            device.write_all(&[0xA5, 0x06, 0x00]).await.unwrap();
            device.write_all(&reply).await.unwrap();
            device
        });

        let got = transfer.read(&request, Duration::from_secs(2)).await.unwrap();
        assert_eq!(got, response);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let (transfer, _device) = transfer_with_device();
        let request = crate::protocol::Command::ReadSn.frame();
        let result = transfer.read(&request, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(DeviceError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_refused_while_collecting() {
        let (transfer, mut device) = transfer_with_device();
        let mut stream = transfer.listen().unwrap();

        let result = transfer.write(&[0xA5], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(DeviceError::Busy(_))));

        device.write_all(&[0u8; FRAME_LEN + 10]).await.unwrap();
        let chunk = stream.recv().await.unwrap().unwrap();
        assert_eq!(chunk.len(), FRAME_LEN);

        device.write_all(&[0u8; FRAME_LEN - 10]).await.unwrap();
        let chunk = stream.recv().await.unwrap().unwrap();
        assert_eq!(chunk.len(), FRAME_LEN);

        assert!(transfer.stop_listen());
        assert!(stream.recv().await.is_none());
        assert!(transfer
            .write(&[0xA5], Duration::from_millis(100))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_close_ends_stream_with_error() {
        let (transfer, device) = transfer_with_device();
        let mut stream = transfer.listen().unwrap();
        drop(device);

        let item = stream.recv().await.unwrap();
        assert!(matches!(item, Err(DeviceError::Transport(_))));
        assert!(!transfer.is_collecting());
    }

    fn frames(first: u8, count: u8) -> Vec<u8> {
        (first..first + count)
            .flat_map(|package_no| {
                crate::demo::encode_frame(&crate::demo::FrameSpec {
                    package_no,
                    raw: [package_no as i32 * 100; 8],
                    ..Default::default()
                })
            })
            .collect()
    }

    fn package_numbers(chunk: &[u8]) -> Vec<u8> {
        crate::waveform::decode(chunk)
            .map(|point| point.unwrap().package_no)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_discards_bytes_left_from_commands() {
        let (transfer, mut device) = transfer_with_device();

        // a late reply to a command that already timed out
        device
            .write_all(&Frame::new(0x05, b"V3".to_vec()).unwrap().to_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut stream = transfer.listen().unwrap();
        device.write_all(&frames(0, 3)).await.unwrap();

        let chunk = stream.recv().await.unwrap().unwrap();
        assert_eq!(package_numbers(&chunk), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_keeps_frames_after_start_command() {
        let (transfer, mut device) = transfer_with_device();
        device.write_all(&[0x11; 7]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = crate::protocol::Command::StartCollectUsb.frame();
        transfer.write(&start, Duration::from_millis(100)).await.unwrap();
        let mut received = vec![0u8; start.len()];
        device.read_exact(&mut received).await.unwrap();
        assert_eq!(received, start);

        // the monitor starts streaming before the stream is subscribed
        device.write_all(&frames(0, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut stream = transfer.listen().unwrap();
        device.write_all(&frames(2, 1)).await.unwrap();

        let mut numbers = Vec::new();
        while numbers.len() < 3 {
            numbers.extend(package_numbers(&stream.recv().await.unwrap().unwrap()));
        }
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    /// Accepts writes but never finishes shutting down
    struct StuckPort;

    impl AsyncRead for StuckPort {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    impl AsyncWrite for StuckPort {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_on_stuck_port() {
        let config = SessionConfig::default();
        let transfer = CdcTransfer::start("usb-stuck", Box::new(StuckPort), &config, || {});

        let start = Instant::now();
        transfer.close().await;
        let bound = config.teardown_timeout();
        assert!(start.elapsed() >= bound && start.elapsed() < bound * 2);
    }
}
