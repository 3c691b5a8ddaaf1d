//! Bridge probe - connect to the local audio server and report what it sees
//!
//! Registers a client, creates the configured ports, prints the server status
//! and port graph, then streams meter readings for a few seconds.
//!
//! ## Command line flags
//!
//! - `--config <path>`: read the bridge configuration from `path`
//! - `--seconds <n>`: how long to stream meters (default 5)
//! - `--channels <n>`: input and output ports to create (default 2)

use std::path::PathBuf;
use std::time::{Duration, Instant};

use mixbridge_core::config::{default_config_path, load_config};
use mixbridge_core::{AudioBridge, BridgeConfig, PortFlags};

const DEFAULT_SECONDS: u64 = 5;
const DEFAULT_CHANNELS: usize = 2;

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config_path = flag_value(&args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config: BridgeConfig = load_config(&config_path);
    let seconds = flag_value(&args, "--seconds")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SECONDS);
    let channels = flag_value(&args, "--channels")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CHANNELS);

    let bridge = AudioBridge::open_jack(config.clone());

    if !bridge.is_server_running()? {
        println!("Audio server is not running");
        return Ok(());
    }
    if !bridge.initialize(&config.client_name)? {
        anyhow::bail!("audio server refused client '{}'", config.client_name);
    }

    let status = bridge.server_status()?;
    println!(
        "Server: {} Hz, {} frames ({:.1} ms), DSP load {:.1}%",
        status.sample_rate,
        status.buffer_size,
        status.latency_ms(),
        status.cpu_load
    );

    if !bridge.create_ports(channels, channels)? {
        anyhow::bail!("could not create {} ports", channels);
    }

    println!();
    println!("Ports:");
    for port in bridge.ports()? {
        println!("  {:<40} {:<6} {}", port.name, port.port_type, port.flags);
        for connection in &port.connections {
            println!("    -> {}", connection);
        }
    }

    let capture = bridge.port_list("audio", PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL)?;
    println!();
    println!("Physical capture ports: {}", capture.len());

    let status_rx = bridge.subscribe_server_status()?;
    let meters = bridge.subscribe_meters()?;
    if !bridge.activate()? {
        anyhow::bail!("activation refused");
    }

    println!();
    println!("Streaming meters for {}s...", seconds);
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        if let Ok(change) = status_rx.try_recv() {
            if !change.is_running {
                println!("Audio server went away");
                break;
            }
        }
        match meters.recv_timeout(Duration::from_millis(250)) {
            Ok(sample) => {
                if sample.channel == 0 {
                    println!(
                        "  ch{} peak {:.3} rms {:.3}",
                        sample.channel, sample.peak, sample.rms
                    );
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    bridge.deactivate()?;
    let stats = bridge.relay_stats();
    println!();
    println!(
        "Meters delivered: {}, dropped: {}",
        stats.delivered_meters, stats.dropped_meters
    );
    bridge.dispose();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("bridge-probe requires the JACK backend, which is only available on Linux");
}
