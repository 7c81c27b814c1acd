//! Loopback daemon
//!
//! Serves the mux protocol on a unix socket with a fake remote multiplexer:
//! a configurable number of devices whose every port echoes what it
//! receives. Useful for poking at the daemon with real mux clients.
//!
//! ```bash
//! cargo run --example loopback_daemon --features demos -- --socket /tmp/mux.sock -vv
//! ```

use clap::Parser;
use config::Config;
use fluxmux::prelude::*;
use parking_lot::Mutex;
use plist::{Dictionary, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TUNNEL_BUFFER_SIZE: usize = 0x10000;
const ECHO_INTERVAL: Duration = Duration::from_millis(5);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for fluxmux based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("fluxmux={},loopback_daemon={}", level, level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Mux daemon with echoing fake devices", long_about = None)]
struct Args {
    /// Unix socket path to listen on
    #[arg(short, long, default_value = "/tmp/fluxmux.sock")]
    socket: PathBuf,

    /// Number of fake devices to expose
    #[arg(short, long, default_value_t = 1)]
    devices: u32,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Loopback Remote Multiplexer
// ============================================================================

#[derive(Default)]
struct Loopback {
    devices: Vec<DeviceRecord>,
    instances: Mutex<Vec<(String, u16)>>,
    pair_records: Mutex<Vec<(String, Value)>>,
    tunnels: Mutex<Vec<(ClientHandle, Arc<Tunnel>)>>,
}

impl Loopback {
    fn new(device_count: u32) -> Self {
        let devices = (1..=device_count)
            .map(|id| DeviceRecord::new(id, &format!("LOOPBACK{id:08}"), id << 16, 0x12a8))
            .collect();
        Self {
            devices,
            ..Self::default()
        }
    }

    // Moves client bytes straight back to the client on every tunnel.
    fn echo(&self) {
        for (client, tunnel) in self.tunnels.lock().iter() {
            let mut queues = tunnel.lock();
            if queues.to_device.is_empty() {
                continue;
            }
            let data = queues.to_device.as_slice().to_vec();
            if let Err(err) = queues.to_client.enqueue(&data) {
                tracing::warn!(id = client.id(), %err, "Echo failed, closing tunnel");
                client.remote_closed();
                continue;
            }
            queues.to_device.consume(data.len());
            drop(queues);
            client.tunnel_ready();
        }
    }
}

impl RemoteMux for Loopback {
    fn device_list(&self) -> Vec<DeviceRecord> {
        self.devices.clone()
    }

    fn instances(&self) -> Value {
        let list = self
            .instances
            .lock()
            .iter()
            .map(|(host, port)| {
                let mut dict = Dictionary::new();
                dict.insert("HostAddress".into(), Value::from(host.as_str()));
                dict.insert("PortNumber".into(), Value::from(u64::from(*port)));
                Value::Dictionary(dict)
            })
            .collect();
        Value::Array(list)
    }

    fn connect(
        &self,
        device_id: u32,
        _tag: u32,
        _request: &Dictionary,
        client: ClientHandle,
    ) -> Result<(), ResultCode> {
        if !self.devices.iter().any(|d| d.device_id() == device_id) {
            return Err(ResultCode::BAD_DEVICE);
        }
        let tunnel = Tunnel::new(TUNNEL_BUFFER_SIZE).map_err(|_| ResultCode::CONNECTION_REFUSED)?;
        self.tunnels.lock().push((client.clone(), tunnel.clone()));
        client.notify_connect(ConnectOutcome::Connected(tunnel));
        Ok(())
    }

    fn read_buid(&self, tag: u32, client: ClientHandle) -> Result<(), ResultCode> {
        let mut dict = Dictionary::new();
        dict.insert("BUID".into(), Value::from("00000000-LOOPBACK-0000"));
        client.send_plist(tag, Value::Dictionary(dict));
        Ok(())
    }

    fn read_pair_record(
        &self,
        record_id: Option<&str>,
        tag: u32,
        client: ClientHandle,
    ) -> Result<(), ResultCode> {
        let records = self.pair_records.lock();
        let (_, data) = records
            .iter()
            .find(|(id, _)| Some(id.as_str()) == record_id)
            .ok_or(ResultCode::BAD_DEVICE)?;
        let mut dict = Dictionary::new();
        dict.insert("PairRecordData".into(), data.clone());
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
            .cloned()
            .ok_or(ResultCode::BAD_COMMAND)?;
        let mut records = self.pair_records.lock();
        records.retain(|(id, _)| id != record_id);
        records.push((record_id.to_owned(), data));
        client.send_result(tag, ResultCode::OK);
        Ok(())
    }

    fn delete_pair_record(
        &self,
        record_id: Option<&str>,
        tag: u32,
        client: ClientHandle,
    ) -> Result<(), ResultCode> {
        let mut records = self.pair_records.lock();
        let before = records.len();
        records.retain(|(id, _)| Some(id.as_str()) != record_id);
        if records.len() == before {
            return Err(ResultCode::BAD_DEVICE);
        }
        client.send_result(tag, ResultCode::OK);
        Ok(())
    }

    fn add_remote(&self, host: &str, port: u16) -> Result<(), RemoteError> {
        let mut instances = self.instances.lock();
        if instances.iter().any(|(h, p)| h == host && *p == port) {
            return Err(RemoteError::AlreadyPresent);
        }
        instances.push((host.to_owned(), port));
        Ok(())
    }

    fn remove_remote(&self, host: &str, port: u16) -> Result<(), RemoteError> {
        let mut instances = self.instances.lock();
        let before = instances.len();
        instances.retain(|(h, p)| !(h == host && *p == port));
        if instances.len() == before {
            return Err(RemoteError::NotFound);
        }
        Ok(())
    }

    fn notify_client_close(&self, tunnel: &Arc<Tunnel>) {
        self.tunnels.lock().retain(|(_, t)| !Arc::ptr_eq(t, tunnel));
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    // Create config - load from file if specified, otherwise use defaults
    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let remote = Arc::new(Loopback::new(args.devices));
    let mut dispatcher = match ConnectionDispatcher::new(&config, remote.clone()) {
        Ok(d) => d,
        Err(err) => {
            eprintln!("Failed to initialize dispatcher: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = dispatcher.listen(&args.socket) {
        eprintln!("Failed to listen on {}: {err}", args.socket.display());
        return ExitCode::FAILURE;
    }
    println!(
        "Serving {} loopback device(s) on {}",
        args.devices,
        args.socket.display()
    );

    // The device side runs on its own thread, like a real remote would.
    thread::spawn(move || loop {
        remote.echo();
        thread::sleep(ECHO_INTERVAL);
    });

    let running = AtomicBool::new(true);
    if let Err(err) = dispatcher.run(&running) {
        eprintln!("Fatal error in event loop: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
