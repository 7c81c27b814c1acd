//! Shared helpers for the integration tests.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test --test client_server -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test --test client_server -- --nocapture
//! ```

#![allow(dead_code)]

use fluxmux::prelude::*;
use fluxmux::protocol::{Frame, Header, MessageType, HEADER_SIZE};
use fluxmux::{ClientConfig, ClientRegistry};
use plist::{Dictionary, Value};
use std::collections::HashMap;
use std::io::{Cursor, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("fluxmux={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

/// Polls `condition` until it holds or the I/O timeout expires.
pub fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + IO_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ============================================================================
// Mock Remote Multiplexer
// ============================================================================

/// In-memory remote multiplexer.
///
/// Connects succeed for known devices and complete immediately through the
/// client handle, unless a failure was set with [`MockRemote::fail_connects`].
/// Tunnels are kept so tests can play the device side.
#[derive(Default)]
pub struct MockRemote {
    devices: Mutex<Vec<DeviceRecord>>,
    instances: Mutex<Vec<(String, u16)>>,
    pair_records: Mutex<HashMap<String, Vec<u8>>>,
    tunnels: Mutex<Vec<(ClientHandle, Arc<Tunnel>)>>,
    connect_requests: Mutex<Vec<Dictionary>>,
    greeting: Mutex<Vec<u8>>,
    connect_failure: Mutex<Option<ResultCode>>,
    closed: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_devices(devices: Vec<DeviceRecord>) -> Arc<Self> {
        let remote = Self::default();
        *remote.devices.lock().unwrap() = devices;
        Arc::new(remote)
    }

    pub fn add_device(&self, device: DeviceRecord) {
        self.devices.lock().unwrap().push(device);
    }

    /// Bytes the device side sends as soon as a tunnel opens.
    pub fn set_greeting(&self, greeting: &[u8]) {
        *self.greeting.lock().unwrap() = greeting.to_vec();
    }

    /// Accepts later connect requests but reports `code` asynchronously.
    pub fn fail_connects(&self, code: ResultCode) {
        *self.connect_failure.lock().unwrap() = Some(code);
    }

    pub fn close_notifications(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }

    pub fn connect_requests(&self) -> Vec<Dictionary> {
        self.connect_requests.lock().unwrap().clone()
    }

    pub fn tunnel(&self, index: usize) -> (ClientHandle, Arc<Tunnel>) {
        self.tunnels.lock().unwrap()[index].clone()
    }

    /// Takes everything the client behind tunnel `index` has sent so far.
    pub fn take_to_device(&self, index: usize) -> Vec<u8> {
        let (_, tunnel) = self.tunnel(index);
        let mut queues = tunnel.lock();
        let data = queues.to_device.as_slice().to_vec();
        queues.to_device.consume(data.len());
        data
    }

    /// Plays an echoing device: moves everything the clients sent back to
    /// them. Returns the number of bytes echoed.
    pub fn echo_pending(&self) -> usize {
        let mut echoed = 0;
        for (client, tunnel) in self.tunnels.lock().unwrap().iter() {
            let mut queues = tunnel.lock();
            let data = queues.to_device.as_slice().to_vec();
            if data.is_empty() {
                continue;
            }
            queues.to_device.consume(data.len());
            queues.to_client.enqueue(&data).unwrap();
            drop(queues);
            echoed += data.len();
            client.tunnel_ready();
        }
        echoed
    }
}

impl RemoteMux for MockRemote {
    fn device_list(&self) -> Vec<DeviceRecord> {
        self.devices.lock().unwrap().clone()
    }

    fn instances(&self) -> Value {
        let instances = self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(host, port)| {
                let mut dict = Dictionary::new();
                dict.insert("HostAddress".into(), Value::from(host.as_str()));
                dict.insert("PortNumber".into(), Value::from(u64::from(*port)));
                Value::Dictionary(dict)
            })
            .collect();
        Value::Array(instances)
    }

    fn connect(
        &self,
        device_id: u32,
        _tag: u32,
        request: &Dictionary,
        client: ClientHandle,
    ) -> Result<(), ResultCode> {
        self.connect_requests.lock().unwrap().push(request.clone());
        let known = self
            .devices
            .lock()
            .unwrap()
            .iter()
            .any(|device| device.device_id() == device_id);
        if !known {
            return Err(ResultCode::BAD_DEVICE);
        }
        if let Some(code) = *self.connect_failure.lock().unwrap() {
            client.notify_connect(ConnectOutcome::Failed(code));
            return Ok(());
        }

        let tunnel = Tunnel::new(4096).map_err(|_| ResultCode::CONNECTION_REFUSED)?;
        let greeting = self.greeting.lock().unwrap().clone();
        if !greeting.is_empty() {
            tunnel.lock().to_client.enqueue(&greeting).unwrap();
        }
        self.tunnels
            .lock()
            .unwrap()
            .push((client.clone(), tunnel.clone()));
        client.notify_connect(ConnectOutcome::Connected(tunnel));
        Ok(())
    }

    fn read_buid(&self, tag: u32, client: ClientHandle) -> Result<(), ResultCode> {
        let mut dict = Dictionary::new();
        dict.insert("BUID".into(), Value::from("MOCK-BUID"));
        client.send_plist(tag, Value::Dictionary(dict));
        Ok(())
    }

    fn read_pair_record(
        &self,
        record_id: Option<&str>,
        tag: u32,
        client: ClientHandle,
    ) -> Result<(), ResultCode> {
        let records = self.pair_records.lock().unwrap();
        let data = record_id
            .and_then(|id| records.get(id))
            .ok_or(ResultCode::BAD_DEVICE)?;
        let mut dict = Dictionary::new();
        dict.insert("PairRecordData".into(), Value::Data(data.clone()));
        client.send_plist(tag, Value::Dictionary(dict));
        Ok(())
    }

    fn save_pair_record(
        &self,
        record_id: Option<&str>,
        request: &Dictionary,
        tag: u32,
        client: ClientHandle,
    ) -> Result<(), ResultCode> {
        let record_id = record_id.ok_or(ResultCode::BAD_COMMAND)?;
        let data = request
            .get("PairRecordData")
            .and_then(Value::as_data)
            .ok_or(ResultCode::BAD_COMMAND)?;
        self.pair_records
            .lock()
            .unwrap()
            .insert(record_id.to_owned(), data.to_vec());
        client.send_result(tag, ResultCode::OK);
        Ok(())
    }

    fn delete_pair_record(
        &self,
        record_id: Option<&str>,
        tag: u32,
        client: ClientHandle,
    ) -> Result<(), ResultCode> {
        let removed = record_id.and_then(|id| self.pair_records.lock().unwrap().remove(id));
        if removed.is_none() {
            return Err(ResultCode::BAD_DEVICE);
        }
        client.send_result(tag, ResultCode::OK);
        Ok(())
    }

    fn add_remote(&self, host: &str, port: u16) -> Result<(), RemoteError> {
        let mut instances = self.instances.lock().unwrap();
        if instances.iter().any(|(h, p)| h == host && *p == port) {
            return Err(RemoteError::AlreadyPresent);
        }
        if host.is_empty() {
            return Err(RemoteError::Failed("empty host".into()));
        }
        instances.push((host.to_owned(), port));
        Ok(())
    }

    fn remove_remote(&self, host: &str, port: u16) -> Result<(), RemoteError> {
        let mut instances = self.instances.lock().unwrap();
        let before = instances.len();
        instances.retain(|(h, p)| !(h == host && *p == port));
        if instances.len() == before {
            return Err(RemoteError::NotFound);
        }
        Ok(())
    }

    fn notify_client_close(&self, tunnel: &Arc<Tunnel>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.tunnels
            .lock()
            .unwrap()
            .retain(|(_, t)| !Arc::ptr_eq(t, tunnel));
    }
}

// ============================================================================
// Daemon Harness
// ============================================================================

/// A dispatcher running its own event loop on a background thread.
pub struct Daemon {
    pub path: PathBuf,
    pub interface: ClientInterface,
    pub clients: Arc<ClientRegistry>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _dir: TempDir,
}

impl Daemon {
    pub fn start(remote: Arc<MockRemote>) -> Self {
        Self::start_with(ClientConfig::default(), remote)
    }

    pub fn start_with(config: ClientConfig, remote: Arc<MockRemote>) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fluxmux.sock");
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = thread::spawn({
            let path = path.clone();
            let running = running.clone();
            move || {
                let mut dispatcher =
                    ConnectionDispatcher::with_client_config(config, remote).unwrap();
                dispatcher.listen(&path).unwrap();
                ready_tx
                    .send((dispatcher.interface(), dispatcher.clients()))
                    .unwrap();
                dispatcher.run(&running).unwrap();
            }
        });
        let (interface, clients) = ready_rx.recv_timeout(IO_TIMEOUT).unwrap();

        Self {
            path,
            interface,
            clients,
            running,
            thread: Some(thread),
            _dir: dir,
        }
    }

    pub fn connect(&self) -> TestClient {
        TestClient::connect(&self.path)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// Test Client
// ============================================================================

/// Blocking client speaking the mux protocol.
pub struct TestClient {
    pub stream: UnixStream,
}

impl TestClient {
    pub fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).unwrap();
        stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        stream.set_write_timeout(Some(IO_TIMEOUT)).unwrap();
        Self { stream }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn send_frame(&mut self, version: u32, message: u32, tag: u32, payload: &[u8]) {
        let frame = Frame {
            version,
            message,
            tag,
            payload: payload.to_vec(),
        };
        self.send_raw(&frame.encode());
    }

    pub fn send_plist(&mut self, tag: u32, dict: Dictionary) {
        let mut xml = Vec::new();
        Value::Dictionary(dict).to_writer_xml(&mut xml).unwrap();
        self.send_frame(1, MessageType::Plist as u32, tag, &xml);
    }

    pub fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    pub fn read_frame(&mut self) -> Frame {
        let header = Header::parse(&self.read_exact(HEADER_SIZE)).unwrap();
        let payload = self.read_exact(header.payload_len());
        Frame {
            version: header.version,
            message: header.message,
            tag: header.tag,
            payload,
        }
    }

    /// Reads a plist frame and returns its tag and dictionary.
    pub fn read_plist(&mut self) -> (u32, Dictionary) {
        let frame = self.read_frame();
        assert_eq!(frame.message, MessageType::Plist as u32);
        let dict = Value::from_reader_xml(Cursor::new(&frame.payload))
            .unwrap()
            .into_dictionary()
            .unwrap();
        (frame.tag, dict)
    }

    /// Reads a `Result` reply in either wire family and returns tag and code.
    pub fn read_result(&mut self) -> (u32, ResultCode) {
        let frame = self.read_frame();
        if frame.message == MessageType::Plist as u32 {
            let dict = Value::from_reader_xml(Cursor::new(&frame.payload))
                .unwrap()
                .into_dictionary()
                .unwrap();
            assert_eq!(dict.get("MessageType").and_then(Value::as_string), Some("Result"));
            let code = dict.get("Number").and_then(Value::as_unsigned_integer).unwrap();
            (frame.tag, ResultCode(code as u32))
        } else {
            assert_eq!(frame.message, MessageType::Result as u32);
            let code = u32::from_le_bytes(frame.payload[..4].try_into().unwrap());
            (frame.tag, ResultCode(code))
        }
    }

    /// Asserts that the daemon closes the socket, skipping queued replies.
    pub fn expect_closed(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::ConnectionReset => return,
                Err(err) => panic!("Expected the daemon to close the socket: {err}"),
            }
        }
    }

    /// Asserts that nothing arrives within `wait`.
    pub fn expect_silence(&mut self, wait: Duration) {
        self.stream.set_read_timeout(Some(wait)).unwrap();
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf) {
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            other => panic!("Expected silence, got {other:?}"),
        }
        self.stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    }
}

/// A plist request carrying the usual client metadata.
pub fn plist_request(message_type: &str) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert("MessageType".into(), Value::from(message_type));
    dict.insert("BundleID".into(), Value::from("org.example.fluxmux-test"));
    dict.insert("ClientVersionString".into(), Value::from("fluxmux-test 1.0"));
    dict.insert("ProgName".into(), Value::from("fluxmux-test"));
    dict.insert("kLibUSBMuxVersion".into(), Value::from(3u64));
    dict
}

pub fn device(device_id: u32) -> DeviceRecord {
    DeviceRecord::new(
        device_id,
        &format!("SERIAL{device_id:04}"),
        0x1000 + device_id,
        0x12a8,
    )
}
