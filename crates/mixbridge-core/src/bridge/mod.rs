//! Audio bridge facade
//!
//! [`AudioBridge`] owns exactly one [`AudioServerClient`] for its lifetime and
//! exposes the mixer control surface, port management and two notification
//! streams.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  sync call   ┌───────────┐  delegate  ┌──────────────────┐
//! │ Consumer threads │─────────────►│ Lifecycle │───────────►│ AudioServerClient│
//! │                  │◄─────────────│   guard   │            │  (JACK / mock)   │
//! └──────────────────┘ Result/bool  └───────────┘            └────────┬─────────┘
//!         ▲                                                           │ RT thread
//!         │ flume recv                ┌───────────────┐   callback    │
//!         └───────────────────────────│ CallbackRelay │◄──────────────┘
//!                                     └───────────────┘
//! ```
//!
//! # Synchronization
//!
//! The client slot sits behind an `RwLock`. Control-surface calls hold the
//! read side while checking the lifecycle and delegating; state transitions
//! (initialize, create_ports, activate, deactivate, dispose) take the write
//! side. The relay never touches this lock, so a transition that waits for
//! the real-time thread cannot deadlock with a callback.

mod lifecycle;
mod meters;
mod relay;

pub use lifecycle::LifecycleState;
pub use relay::RelayStats;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use flume::Receiver;

use crate::client::AudioServerClient;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, NativeResult};
use crate::types::{
    ChannelIndex, MeterLevel, MeterSample, PortDescriptor, PortFlags, ServerStatus, StatusChange,
};
use lifecycle::Lifecycle;
use relay::CallbackRelay;

type ClientSlot = Option<Box<dyn AudioServerClient>>;

/// Which lifecycle states an operation accepts
#[derive(Debug, Clone, Copy)]
enum Gate {
    /// Anything but Disposed
    Alive,
    /// Initialized only
    Initialized,
}

/// Bridge between consumers and one audio-server client
///
/// Teardown happens exactly once, through [`dispose`](Self::dispose) or when
/// the bridge is dropped, whichever comes first.
pub struct AudioBridge {
    client: RwLock<ClientSlot>,
    lifecycle: Lifecycle,
    relay: Arc<CallbackRelay>,
    channel_count: AtomicUsize,
    active: AtomicBool,
    config: BridgeConfig,
}

impl AudioBridge {
    /// Wrap `client` with the default configuration
    pub fn new(client: impl AudioServerClient + 'static) -> Self {
        Self::with_config(client, BridgeConfig::default())
    }

    /// Wrap `client` and register the relay's callbacks with it
    pub fn with_config(client: impl AudioServerClient + 'static, config: BridgeConfig) -> Self {
        let relay = CallbackRelay::new(config.status_queue_capacity, config.meter_queue_capacity);

        let status_token = relay.token();
        client.set_status_callback(Box::new(move |is_running| {
            status_token.server_status_changed(is_running)
        }));
        let meter_token = relay.token();
        client.set_meter_callback(Box::new(move |channel, level| {
            meter_token.meter_updated(channel, level)
        }));

        Self {
            client: RwLock::new(Some(Box::new(client))),
            lifecycle: Lifecycle::new(),
            relay,
            channel_count: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            config,
        }
    }

    /// Bridge backed by a native JACK client built from `config`
    #[cfg(all(target_os = "linux", feature = "jack-backend"))]
    pub fn open_jack(config: BridgeConfig) -> Self {
        let client = crate::client::JackServerClient::new(&config);
        Self::with_config(client, config)
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Register with the audio server under `client_name`
    ///
    /// Returns `Ok(false)` when the server is unavailable. Calling it again
    /// once initialized returns `Ok(true)` without contacting the server.
    pub fn initialize(&self, client_name: &str) -> BridgeResult<bool> {
        let guard = self.write_client();
        if self.lifecycle.ensure_alive()? == LifecycleState::Initialized {
            return Ok(true);
        }
        let client = guard.as_deref().ok_or(BridgeError::Disposed)?;

        let registered = call_native("initialize", || client.init(client_name))?;
        if registered {
            self.lifecycle.mark_initialized();
            log::info!("Audio bridge registered as '{}'", client_name);
        } else {
            log::warn!("Audio server refused client '{}'", client_name);
        }
        Ok(registered)
    }

    /// Release the native client, deactivating it first if initialized
    ///
    /// Idempotent and safe to call from several threads; only the first call
    /// does any work. Never fails: errors raised while deactivating or
    /// releasing are logged and swallowed.
    pub fn dispose(&self) {
        let mut guard = self.write_client();
        let previous = self.lifecycle.mark_disposed();
        if previous == LifecycleState::Disposed {
            return;
        }

        // Callbacks that arrive from here on are no-ops
        self.relay.shutdown();
        self.active.store(false, Ordering::Release);

        if let Some(client) = guard.take() {
            if previous == LifecycleState::Initialized {
                match call_native("deactivate", || client.deactivate()) {
                    Ok(true) => {}
                    Ok(false) => log::warn!("Audio server refused deactivation during teardown"),
                    Err(e) => log::warn!("Ignoring error during teardown: {}", e),
                }
            }
            if catch_unwind(AssertUnwindSafe(move || drop(client))).is_err() {
                log::warn!("Ignoring panic while releasing audio server client");
            }
        }

        let stats = self.relay.stats();
        log::info!(
            "Audio bridge disposed (meters delivered: {}, dropped: {}, contained panics: {})",
            stats.delivered_meters,
            stats.dropped_meters,
            stats.contained_panics
        );
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == LifecycleState::Disposed
    }

    /// Whether the client is currently activated
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────
    // Ports and processing
    // ─────────────────────────────────────────────────────────────

    /// Create input and output ports, redefining the valid channel range
    ///
    /// The range follows `config.channel_range`; it is left unchanged when
    /// the server refuses the request.
    pub fn create_ports(&self, num_inputs: usize, num_outputs: usize) -> BridgeResult<bool> {
        let guard = self.write_client();
        self.lifecycle.ensure_initialized()?;
        let client = guard.as_deref().ok_or(BridgeError::Disposed)?;

        let created = call_native("create_ports", || client.create_ports(num_inputs, num_outputs))?;
        if created {
            let count = self.config.channel_range.channel_count(num_inputs, num_outputs);
            self.relay.reset_meters(count);
            self.channel_count.store(count, Ordering::Release);
            log::info!(
                "Created {} input / {} output ports ({} channels)",
                num_inputs,
                num_outputs,
                count
            );
        } else {
            log::warn!(
                "Audio server refused to create {} input / {} output ports",
                num_inputs,
                num_outputs
            );
        }
        Ok(created)
    }

    /// Start real-time processing and meter delivery
    pub fn activate(&self) -> BridgeResult<bool> {
        let guard = self.write_client();
        self.lifecycle.ensure_initialized()?;
        let client = guard.as_deref().ok_or(BridgeError::Disposed)?;

        // Open first so meters from the very first cycle are delivered
        self.relay.open_meters();
        let result = call_native("activate", || client.activate());
        match result {
            Ok(true) => {
                self.active.store(true, Ordering::Release);
                log::info!("Audio bridge activated");
            }
            _ => {
                if !self.is_active() {
                    self.relay.close_meters();
                }
                log::warn!("Audio bridge activation failed");
            }
        }
        result
    }

    /// Stop real-time processing
    ///
    /// Blocks until the server has no callback from this client in flight.
    /// Once it returns, no further meter sample reaches a subscriber.
    pub fn deactivate(&self) -> BridgeResult<bool> {
        let guard = self.write_client();
        self.lifecycle.ensure_initialized()?;
        let client = guard.as_deref().ok_or(BridgeError::Disposed)?;

        self.relay.close_meters();
        let result = call_native("deactivate", || client.deactivate());
        match result {
            Ok(true) => {
                self.active.store(false, Ordering::Release);
                let stats = self.relay.stats();
                log::info!(
                    "Audio bridge deactivated (meters delivered: {}, dropped: {})",
                    stats.delivered_meters,
                    stats.dropped_meters
                );
            }
            _ => {
                // Still running; keep meters flowing
                if self.is_active() {
                    self.relay.open_meters();
                }
                log::warn!("Audio bridge deactivation failed");
            }
        }
        result
    }

    /// Number of addressable channels (0 until ports are created)
    pub fn channel_count(&self) -> usize {
        self.channel_count.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────
    // Channel strip parameters
    // ─────────────────────────────────────────────────────────────

    /// Set the fader position (0.0 - 1.0)
    pub fn set_channel_volume(&self, channel: ChannelIndex, volume: f32) -> BridgeResult<()> {
        self.delegate_channel("set_channel_volume", channel, |c| {
            c.set_channel_volume(channel, volume)
        })
    }

    /// Set the pan position (0.0 left, 0.5 center, 1.0 right)
    pub fn set_channel_pan(&self, channel: ChannelIndex, pan: f32) -> BridgeResult<()> {
        self.delegate_channel("set_channel_pan", channel, |c| c.set_channel_pan(channel, pan))
    }

    /// Set the trim gain in dB (range limits are up to the server client)
    pub fn set_channel_gain(&self, channel: ChannelIndex, gain_db: f32) -> BridgeResult<()> {
        self.delegate_channel("set_channel_gain", channel, |c| {
            c.set_channel_gain(channel, gain_db)
        })
    }

    pub fn set_channel_mute(&self, channel: ChannelIndex, mute: bool) -> BridgeResult<()> {
        self.delegate_channel("set_channel_mute", channel, |c| c.set_channel_mute(channel, mute))
    }

    pub fn set_channel_solo(&self, channel: ChannelIndex, solo: bool) -> BridgeResult<()> {
        self.delegate_channel("set_channel_solo", channel, |c| c.set_channel_solo(channel, solo))
    }

    /// Most recent meter reading for a channel (silent until the first update)
    pub fn channel_meter(&self, channel: ChannelIndex) -> BridgeResult<MeterLevel> {
        let _guard = self.read_client();
        self.lifecycle.ensure_initialized()?;
        self.check_channel(channel)?;
        self.relay
            .channel_meter(channel)
            .ok_or(BridgeError::InvalidChannel {
                channel,
                channel_count: self.channel_count(),
            })
    }

    // ─────────────────────────────────────────────────────────────
    // Server queries
    // ─────────────────────────────────────────────────────────────

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> BridgeResult<u32> {
        self.delegate("sample_rate", Gate::Initialized, |c| c.sample_rate())
    }

    /// Buffer size in frames
    pub fn buffer_size(&self) -> BridgeResult<u32> {
        self.delegate("buffer_size", Gate::Initialized, |c| c.buffer_size())
    }

    /// DSP load as a percentage (0.0 - 100.0)
    pub fn cpu_load(&self) -> BridgeResult<f32> {
        self.delegate("cpu_load", Gate::Initialized, |c| c.cpu_load())
    }

    /// Whether the server process is reachable; works before `initialize`
    pub fn is_server_running(&self) -> BridgeResult<bool> {
        self.delegate("is_server_running", Gate::Alive, |c| c.is_server_running())
    }

    /// Snapshot of the server state; works before `initialize`
    pub fn server_status(&self) -> BridgeResult<ServerStatus> {
        self.delegate("server_status", Gate::Alive, |c| c.server_status())
    }

    // ─────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────

    /// Connect `source` to `destination`
    ///
    /// `Ok(false)` if either port is missing or the graph refuses the link.
    pub fn connect_ports(&self, source: &str, destination: &str) -> BridgeResult<bool> {
        let connected = self.delegate("connect_ports", Gate::Initialized, |c| {
            c.connect_ports(source, destination)
        })?;
        if !connected {
            log::debug!("Connection {} -> {} refused", source, destination);
        }
        Ok(connected)
    }

    /// Disconnect `source` from `destination`
    pub fn disconnect_ports(&self, source: &str, destination: &str) -> BridgeResult<bool> {
        self.delegate("disconnect_ports", Gate::Initialized, |c| {
            c.disconnect_ports(source, destination)
        })
    }

    /// Names of ports matching `port_type` (empty = any) and all bits of
    /// `flags` (empty = any)
    pub fn port_list(&self, port_type: &str, flags: PortFlags) -> BridgeResult<Vec<String>> {
        self.delegate("port_list", Gate::Initialized, |c| c.port_list(port_type, flags))
    }

    /// Every port in the graph with its live connections
    pub fn ports(&self) -> BridgeResult<Vec<PortDescriptor>> {
        self.delegate("ports", Gate::Initialized, |c| c.ports())
    }

    // ─────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────

    /// Subscribe to server start/stop notifications
    ///
    /// The receiver disconnects when the bridge is disposed.
    pub fn subscribe_server_status(&self) -> BridgeResult<Receiver<StatusChange>> {
        let _guard = self.read_client();
        self.lifecycle.ensure_alive()?;
        Ok(self.relay.subscribe_status())
    }

    /// Subscribe to per-channel meter updates
    ///
    /// Samples for one channel arrive in the order the server produced them.
    /// A subscriber that falls behind loses samples rather than stalling the
    /// real-time thread.
    pub fn subscribe_meters(&self) -> BridgeResult<Receiver<MeterSample>> {
        let _guard = self.read_client();
        self.lifecycle.ensure_alive()?;
        Ok(self.relay.subscribe_meters())
    }

    /// Relay delivery counters
    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    // ─────────────────────────────────────────────────────────────
    // Delegation helpers
    // ─────────────────────────────────────────────────────────────

    fn read_client(&self) -> RwLockReadGuard<'_, ClientSlot> {
        self.client.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_client(&self) -> RwLockWriteGuard<'_, ClientSlot> {
        self.client.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_channel(&self, channel: ChannelIndex) -> BridgeResult<()> {
        let channel_count = self.channel_count();
        if channel < channel_count {
            Ok(())
        } else {
            Err(BridgeError::InvalidChannel {
                channel,
                channel_count,
            })
        }
    }

    fn delegate<T>(
        &self,
        operation: &'static str,
        gate: Gate,
        f: impl FnOnce(&dyn AudioServerClient) -> NativeResult<T>,
    ) -> BridgeResult<T> {
        let guard = self.read_client();
        match gate {
            Gate::Alive => {
                self.lifecycle.ensure_alive()?;
            }
            Gate::Initialized => self.lifecycle.ensure_initialized()?,
        }
        let client = guard.as_deref().ok_or(BridgeError::Disposed)?;
        call_native(operation, || f(client))
    }

    fn delegate_channel(
        &self,
        operation: &'static str,
        channel: ChannelIndex,
        f: impl FnOnce(&dyn AudioServerClient) -> NativeResult<()>,
    ) -> BridgeResult<()> {
        let guard = self.read_client();
        self.lifecycle.ensure_initialized()?;
        self.check_channel(channel)?;
        let client = guard.as_deref().ok_or(BridgeError::Disposed)?;
        call_native(operation, || f(client))
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for AudioBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBridge")
            .field("state", &self.state())
            .field("active", &self.is_active())
            .field("channel_count", &self.channel_count())
            .finish()
    }
}

/// Run a native call, turning native errors and panics into `BridgeError`
fn call_native<T>(
    operation: &'static str,
    f: impl FnOnce() -> NativeResult<T>,
) -> BridgeResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BridgeError::Native {
            operation,
            message: e.0,
        }),
        Err(payload) => Err(BridgeError::Native {
            operation,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "native layer panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::ops;
    use crate::client::{MockControl, MockServerClient};
    use crate::config::ChannelRange;
    use std::sync::Barrier;
    use std::thread;

    fn bridge() -> (AudioBridge, MockControl) {
        let mock = MockServerClient::new();
        let control = mock.control();
        (AudioBridge::new(mock), control)
    }

    fn ready(inputs: usize, outputs: usize) -> (AudioBridge, MockControl) {
        let (bridge, control) = bridge();
        assert_eq!(bridge.initialize("mixer1"), Ok(true));
        assert_eq!(bridge.create_ports(inputs, outputs), Ok(true));
        (bridge, control)
    }

    #[test]
    fn test_full_session() {
        let (bridge, control) = ready(2, 2);
        assert_eq!(bridge.activate(), Ok(true));
        assert!(bridge.is_active());
        assert_eq!(bridge.set_channel_volume(1, 0.5), Ok(()));
        assert_eq!(bridge.sample_rate(), Ok(48000));
        assert_eq!(bridge.deactivate(), Ok(true));
        assert!(!bridge.is_active());

        bridge.dispose();
        assert_eq!(bridge.state(), LifecycleState::Disposed);
        assert_eq!(control.calls(ops::DEACTIVATE), 2);
        assert_eq!(control.releases(), 1);
    }

    #[test]
    fn test_operations_before_initialize() {
        let (bridge, control) = bridge();
        assert_eq!(bridge.create_ports(2, 2), Err(BridgeError::NotInitialized));
        assert_eq!(bridge.activate(), Err(BridgeError::NotInitialized));
        assert_eq!(bridge.set_channel_mute(0, true), Err(BridgeError::NotInitialized));
        assert_eq!(bridge.port_list("", PortFlags::NONE), Err(BridgeError::NotInitialized));
        assert_eq!(control.total_calls(), 0);

        // Server queries are allowed before registering
        assert_eq!(bridge.is_server_running(), Ok(true));
        assert!(bridge.server_status().unwrap().is_running);
    }

    #[test]
    fn test_disposed_bridge_never_reaches_native() {
        let (bridge, control) = ready(2, 2);
        bridge.dispose();
        let before = control.total_calls();

        assert_eq!(bridge.initialize("again"), Err(BridgeError::Disposed));
        assert_eq!(bridge.create_ports(1, 1), Err(BridgeError::Disposed));
        assert_eq!(bridge.activate(), Err(BridgeError::Disposed));
        assert_eq!(bridge.deactivate(), Err(BridgeError::Disposed));
        assert_eq!(bridge.set_channel_volume(0, 0.5), Err(BridgeError::Disposed));
        assert_eq!(bridge.set_channel_pan(0, 0.5), Err(BridgeError::Disposed));
        assert_eq!(bridge.set_channel_gain(0, 3.0), Err(BridgeError::Disposed));
        assert_eq!(bridge.set_channel_mute(0, true), Err(BridgeError::Disposed));
        assert_eq!(bridge.set_channel_solo(0, true), Err(BridgeError::Disposed));
        assert_eq!(bridge.sample_rate(), Err(BridgeError::Disposed));
        assert_eq!(bridge.buffer_size(), Err(BridgeError::Disposed));
        assert_eq!(bridge.cpu_load(), Err(BridgeError::Disposed));
        assert_eq!(bridge.is_server_running(), Err(BridgeError::Disposed));
        assert_eq!(bridge.server_status(), Err(BridgeError::Disposed));
        assert_eq!(bridge.connect_ports("a", "b"), Err(BridgeError::Disposed));
        assert_eq!(bridge.disconnect_ports("a", "b"), Err(BridgeError::Disposed));
        assert_eq!(bridge.port_list("", PortFlags::NONE), Err(BridgeError::Disposed));
        assert_eq!(bridge.ports(), Err(BridgeError::Disposed));
        assert_eq!(bridge.channel_meter(0), Err(BridgeError::Disposed));
        assert!(bridge.subscribe_meters().is_err());
        assert!(bridge.subscribe_server_status().is_err());

        assert_eq!(control.total_calls(), before);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (bridge, control) = bridge();
        assert_eq!(bridge.initialize("mixer1"), Ok(true));
        assert_eq!(bridge.initialize("mixer2"), Ok(true));
        assert_eq!(control.calls(ops::INIT), 1);
        assert_eq!(control.client_name().as_deref(), Some("mixer1"));
    }

    #[test]
    fn test_initialize_reports_unavailable_server() {
        let (bridge, control) = bridge();
        control.set_server_running(false);
        assert_eq!(bridge.initialize("mixer1"), Ok(false));
        assert_eq!(bridge.state(), LifecycleState::Uninitialized);
        assert_eq!(bridge.sample_rate(), Err(BridgeError::NotInitialized));

        control.set_server_running(true);
        assert_eq!(bridge.initialize("mixer1"), Ok(true));
        assert_eq!(bridge.state(), LifecycleState::Initialized);
    }

    #[test]
    fn test_concurrent_dispose_tears_down_once() {
        let (bridge, control) = ready(2, 2);
        let bridge = Arc::new(bridge);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    bridge.dispose();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(bridge);

        assert_eq!(control.calls(ops::DEACTIVATE), 1);
        assert_eq!(control.releases(), 1);
    }

    #[test]
    fn test_dispose_before_initialize_skips_deactivate() {
        let (bridge, control) = bridge();
        bridge.dispose();
        assert_eq!(control.calls(ops::DEACTIVATE), 0);
        assert_eq!(control.releases(), 1);
    }

    #[test]
    fn test_drop_disposes() {
        let (bridge, control) = ready(1, 1);
        drop(bridge);
        assert_eq!(control.calls(ops::DEACTIVATE), 1);
        assert_eq!(control.releases(), 1);
        assert!(!control.has_callbacks());
    }

    #[test]
    fn test_dispose_swallows_native_failure() {
        let (bridge, control) = ready(1, 1);
        control.fail_with(ops::DEACTIVATE, "server gone");
        bridge.dispose();
        assert!(bridge.is_disposed());
        assert_eq!(control.releases(), 1);
        // Second call is a no-op
        bridge.dispose();
        assert_eq!(control.calls(ops::DEACTIVATE), 1);
    }

    #[test]
    fn test_dispose_swallows_native_panic() {
        let (bridge, control) = ready(1, 1);
        control.panic_on(ops::DEACTIVATE);
        bridge.dispose();
        assert!(bridge.is_disposed());
        assert_eq!(control.releases(), 1);
    }

    #[test]
    fn test_port_list_filters() {
        let (bridge, _control) = ready(2, 2);

        let physical_outputs = bridge
            .port_list("audio", PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL)
            .unwrap();
        assert_eq!(physical_outputs.len(), 4);
        assert!(physical_outputs.iter().all(|p| p.starts_with("system:capture_")));

        let inputs = bridge.port_list("audio", PortFlags::IS_INPUT).unwrap();
        assert!(inputs.contains(&"mixer1:in_1".to_string()));
        assert!(inputs.contains(&"system:playback_1".to_string()));
        assert!(!inputs.iter().any(|p| p.contains("out_")));

        let midi = bridge.port_list("midi", PortFlags::NONE).unwrap();
        assert_eq!(midi.len(), 2);

        let everything = bridge.port_list("", PortFlags::NONE).unwrap();
        assert_eq!(everything.len(), bridge.ports().unwrap().len());
    }

    #[test]
    fn test_connect_and_disconnect() {
        let (bridge, control) = ready(2, 2);
        assert_eq!(bridge.connect_ports("system:capture_1", "mixer1:in_1"), Ok(true));
        assert_eq!(control.connections("mixer1:in_1"), vec!["system:capture_1"]);

        let ports = bridge.ports().unwrap();
        let input = ports.iter().find(|p| p.name == "mixer1:in_1").unwrap();
        assert_eq!(input.connections, vec!["system:capture_1"]);

        assert_eq!(bridge.disconnect_ports("system:capture_1", "mixer1:in_1"), Ok(true));
        assert_eq!(bridge.disconnect_ports("system:capture_1", "mixer1:in_1"), Ok(false));
    }

    #[test]
    fn test_rejected_connection_is_not_an_error() {
        let (bridge, _control) = ready(2, 2);
        assert_eq!(bridge.connect_ports("mixer1:in_1", "mixer1:out_1"), Ok(false));
        assert_eq!(bridge.connect_ports("nope:out", "mixer1:in_1"), Ok(false));
        assert_eq!(bridge.connect_ports("system:midi_capture_1", "mixer1:in_1"), Ok(false));
    }

    #[test]
    fn test_channel_parameters_reach_native() {
        let (bridge, control) = ready(2, 2);
        bridge.set_channel_volume(1, 0.75).unwrap();
        bridge.set_channel_pan(1, 0.2).unwrap();
        bridge.set_channel_gain(1, -6.0).unwrap();
        bridge.set_channel_mute(0, true).unwrap();
        bridge.set_channel_solo(1, true).unwrap();

        let strip = control.channel_parameters(1).unwrap();
        assert_eq!(strip.volume, 0.75);
        assert_eq!(strip.pan, 0.2);
        assert_eq!(strip.gain_db, -6.0);
        assert!(strip.solo);
        assert!(!strip.mute);
        assert!(control.channel_parameters(0).unwrap().mute);
    }

    #[test]
    fn test_volume_reaches_last_of_three_channels() {
        let (bridge, control) = ready(3, 3);
        assert_eq!(bridge.channel_count(), 3);
        assert_eq!(bridge.set_channel_volume(2, 0.75), Ok(()));
        assert_eq!(control.channel_parameters(2).map(|p| p.volume), Some(0.75));
        assert_eq!(control.channel_parameters(1).map(|p| p.volume), Some(1.0));
    }

    #[test]
    fn test_invalid_channel_rejected_before_native() {
        let (bridge, control) = ready(2, 2);
        assert_eq!(
            bridge.set_channel_volume(2, 0.5),
            Err(BridgeError::InvalidChannel {
                channel: 2,
                channel_count: 2
            })
        );
        assert_eq!(control.calls(ops::SET_VOLUME), 0);
        assert!(matches!(
            bridge.channel_meter(5),
            Err(BridgeError::InvalidChannel { .. })
        ));
    }

    #[test]
    fn test_channel_range_follows_config() {
        let mock = MockServerClient::new();
        let control = mock.control();
        let config = BridgeConfig::default().with_channel_range(ChannelRange::Inputs);
        let bridge = AudioBridge::with_config(mock, config);
        bridge.initialize("mixer1").unwrap();
        bridge.create_ports(2, 4).unwrap();

        assert_eq!(bridge.channel_count(), 2);
        assert!(matches!(
            bridge.set_channel_volume(3, 0.5),
            Err(BridgeError::InvalidChannel { channel: 3, .. })
        ));
        assert_eq!(control.calls(ops::SET_VOLUME), 0);
    }

    #[test]
    fn test_native_error_is_wrapped() {
        let (bridge, control) = ready(1, 1);
        control.fail_with(ops::BUFFER_SIZE, "no buffer");
        assert_eq!(
            bridge.buffer_size(),
            Err(BridgeError::Native {
                operation: "buffer_size",
                message: "no buffer".to_string()
            })
        );
        control.clear_failures();
        assert_eq!(bridge.buffer_size(), Ok(256));
    }

    #[test]
    fn test_native_panic_is_wrapped() {
        let (bridge, control) = ready(1, 1);
        control.panic_on(ops::SAMPLE_RATE);
        let err = bridge.sample_rate().unwrap_err();
        assert_eq!(err.native_message(), Some("mock native panic in sample_rate"));
        // The bridge is still usable
        control.clear_failures();
        assert_eq!(bridge.sample_rate(), Ok(48000));
    }

    #[test]
    fn test_failed_activate_keeps_meters_closed() {
        let (bridge, control) = ready(1, 1);
        control.fail_with(ops::ACTIVATE, "cannot activate");
        assert!(bridge.activate().is_err());
        assert!(!bridge.is_active());

        let meters = bridge.subscribe_meters().unwrap();
        control.clear_failures();
        control.emit_meter(0, 0.9, 0.3);
        assert!(meters.try_recv().is_err());
    }

    #[test]
    fn test_status_events_reach_subscribers() {
        let (bridge, control) = bridge();
        let status = bridge.subscribe_server_status().unwrap();
        assert!(control.emit_status(false));
        assert_eq!(status.try_recv(), Ok(StatusChange { is_running: false }));

        bridge.dispose();
        assert!(!control.emit_status(true));
        assert!(matches!(status.try_recv(), Err(flume::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_meters_arrive_in_order() {
        let (bridge, control) = ready(2, 2);
        let meters = bridge.subscribe_meters().unwrap();
        bridge.activate().unwrap();

        for i in 1..=5 {
            assert!(control.emit_meter(1, i as f32 / 10.0, 0.05));
        }
        let peaks: Vec<f32> = meters.try_iter().map(|s| s.peak).collect();
        assert_eq!(peaks, vec![0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(bridge.channel_meter(1), Ok(MeterLevel::new(0.5, 0.05)));
        assert_eq!(bridge.relay_stats().delivered_meters, 5);
    }

    #[test]
    fn test_no_meter_after_deactivate_returns() {
        let (bridge, control) = ready(2, 2);
        let meters = bridge.subscribe_meters().unwrap();
        bridge.activate().unwrap();
        control.queue_late_meter(0, 1.0, 1.0);

        assert_eq!(bridge.deactivate(), Ok(true));
        assert!(meters.try_recv().is_err());
        assert_eq!(bridge.channel_meter(0), Ok(MeterLevel::SILENT));
    }

    #[test]
    fn test_reactivate_resumes_meters() {
        let (bridge, control) = ready(1, 1);
        let meters = bridge.subscribe_meters().unwrap();
        bridge.activate().unwrap();
        bridge.deactivate().unwrap();
        bridge.activate().unwrap();
        assert!(control.emit_meter(0, 0.4, 0.2));
        assert_eq!(meters.try_recv().unwrap().peak, 0.4);
    }

    #[test]
    fn test_failed_deactivate_keeps_meters_flowing() {
        let (bridge, control) = ready(1, 1);
        let meters = bridge.subscribe_meters().unwrap();
        bridge.activate().unwrap();
        control.fail_with(ops::DEACTIVATE, "busy");
        assert!(bridge.deactivate().is_err());
        assert!(bridge.is_active());

        assert!(control.emit_meter(0, 0.6, 0.1));
        assert_eq!(meters.try_recv().unwrap().peak, 0.6);
    }

    #[test]
    fn test_callbacks_after_dispose_are_ignored() {
        let (bridge, control) = ready(1, 1);
        let meters = bridge.subscribe_meters().unwrap();
        bridge.activate().unwrap();
        bridge.dispose();
        // Client released its callbacks
        assert!(!control.emit_meter(0, 0.5, 0.5));
        assert!(matches!(meters.try_recv(), Err(flume::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_callbacks_racing_dispose_stop_at_return() {
        let mock = MockServerClient::new();
        let control = mock.control();
        let config = BridgeConfig::default().with_queue_capacity(1 << 16, 1 << 16);
        let bridge = AudioBridge::with_config(mock, config);
        assert_eq!(bridge.initialize("mixer1"), Ok(true));
        assert_eq!(bridge.create_ports(2, 2), Ok(true));
        let status = bridge.subscribe_server_status().unwrap();
        let meters = bridge.subscribe_meters().unwrap();
        assert_eq!(bridge.activate(), Ok(true));

        let producer = {
            let control = control.clone();
            thread::spawn(move || {
                let mut emitted = 0usize;
                while control.emit_status(true) {
                    control.emit_meter(emitted % 2, 0.5, 0.25);
                    emitted += 1;
                }
                emitted
            })
        };
        while meters.is_empty() {
            thread::yield_now();
        }

        bridge.dispose();
        let status_len = status.len();
        let meters_len = meters.len();
        let emitted = producer.join().unwrap();

        assert!(emitted > 0);
        assert_eq!(status.len(), status_len);
        assert_eq!(meters.len(), meters_len);
        assert_eq!(status.drain().count(), status_len);
        assert_eq!(meters.drain().count(), meters_len);
        assert!(matches!(status.try_recv(), Err(flume::TryRecvError::Disconnected)));
        assert!(matches!(meters.try_recv(), Err(flume::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_mixer_session_end_to_end() {
        let (bridge, control) = bridge();
        assert_eq!(bridge.initialize("mixer1"), Ok(true));
        assert_eq!(bridge.create_ports(2, 2), Ok(true));
        assert_eq!(bridge.activate(), Ok(true));

        assert_eq!(bridge.set_channel_volume(1, 0.5), Ok(()));
        assert_eq!(bridge.set_channel_mute(0, true), Ok(()));
        assert_eq!(control.channel_parameters(1).map(|p| p.volume), Some(0.5));
        assert_eq!(control.channel_parameters(0).map(|p| p.mute), Some(true));
        assert_eq!(bridge.sample_rate(), Ok(48000));
        assert!(bridge.server_status().unwrap().is_running);

        assert_eq!(bridge.deactivate(), Ok(true));
        bridge.dispose();
        let calls = control.total_calls();
        assert_eq!(bridge.set_channel_volume(0, 0.5), Err(BridgeError::Disposed));
        assert_eq!(control.total_calls(), calls);
    }
}
