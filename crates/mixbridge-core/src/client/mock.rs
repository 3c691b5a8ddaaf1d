//! In-memory audio server for testing without a running JACK server
//!
//! Models a small routing graph (two stereo system device pairs plus MIDI),
//! stores per-channel parameters, enforces the graph's connection rules and
//! counts every native call so tests can assert what reached the collaborator.
//!
//! # Example
//!
//! ```
//! use mixbridge_core::client::MockServerClient;
//! use mixbridge_core::AudioBridge;
//!
//! let mock = MockServerClient::new();
//! let control = mock.control();
//! let bridge = AudioBridge::new(mock);
//!
//! assert!(bridge.initialize("mixer1").unwrap());
//! assert!(bridge.create_ports(2, 2).unwrap());
//! bridge.set_channel_volume(1, 0.25).unwrap();
//! assert_eq!(control.channel_parameters(1).unwrap().volume, 0.25);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use super::{AudioServerClient, MeterCallback, StatusCallback};
use crate::error::{NativeError, NativeResult};
use crate::types::{
    ChannelIndex, ChannelParameters, MeterLevel, PortDescriptor, PortFlags, ServerStatus,
    AUDIO_PORT_TYPE, MIDI_PORT_TYPE,
};

/// Operation names used for call counting and scripted failures
pub mod ops {
    pub const INIT: &str = "init";
    pub const CREATE_PORTS: &str = "create_ports";
    pub const ACTIVATE: &str = "activate";
    pub const DEACTIVATE: &str = "deactivate";
    pub const SET_VOLUME: &str = "set_channel_volume";
    pub const SET_PAN: &str = "set_channel_pan";
    pub const SET_GAIN: &str = "set_channel_gain";
    pub const SET_MUTE: &str = "set_channel_mute";
    pub const SET_SOLO: &str = "set_channel_solo";
    pub const SAMPLE_RATE: &str = "sample_rate";
    pub const BUFFER_SIZE: &str = "buffer_size";
    pub const CPU_LOAD: &str = "cpu_load";
    pub const IS_SERVER_RUNNING: &str = "is_server_running";
    pub const SERVER_STATUS: &str = "server_status";
    pub const CONNECT_PORTS: &str = "connect_ports";
    pub const DISCONNECT_PORTS: &str = "disconnect_ports";
    pub const PORT_LIST: &str = "port_list";
    pub const PORTS: &str = "ports";
}

/// Mutable server model
struct MockGraph {
    client_name: Option<String>,
    active: bool,
    server_running: bool,
    init_result: bool,
    sample_rate: u32,
    buffer_size: u32,
    cpu_load: f32,
    ports: Vec<PortDescriptor>,
    channels: Vec<ChannelParameters>,
}

impl MockGraph {
    fn new() -> Self {
        let mut ports = Vec::new();
        for i in 1..=4 {
            ports.push(PortDescriptor::new(
                format!("system:capture_{}", i),
                AUDIO_PORT_TYPE,
                PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL,
            ));
        }
        for i in 1..=4 {
            ports.push(PortDescriptor::new(
                format!("system:playback_{}", i),
                AUDIO_PORT_TYPE,
                PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL,
            ));
        }
        ports.push(PortDescriptor::new(
            "system:midi_capture_1",
            MIDI_PORT_TYPE,
            PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL,
        ));
        ports.push(PortDescriptor::new(
            "system:midi_playback_1",
            MIDI_PORT_TYPE,
            PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL,
        ));

        Self {
            client_name: None,
            active: false,
            server_running: true,
            init_result: true,
            sample_rate: 48000,
            buffer_size: 256,
            cpu_load: 4.5,
            ports,
            channels: Vec::new(),
        }
    }

    fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }

    fn remove_client_ports(&mut self, client: &str) {
        let prefix = format!("{}:", client);
        let removed: Vec<String> = self
            .ports
            .iter()
            .filter(|p| p.name.starts_with(&prefix))
            .map(|p| p.name.clone())
            .collect();
        self.ports.retain(|p| !p.name.starts_with(&prefix));
        for port in &mut self.ports {
            port.connections.retain(|c| !removed.contains(c));
        }
    }
}

/// Failures injected by tests
#[derive(Default)]
struct MockScript {
    failures: HashMap<&'static str, String>,
    panic_on: Option<&'static str>,
    late_meter: Option<(ChannelIndex, MeterLevel)>,
}

#[derive(Default)]
struct CallbackSlots {
    status: Option<StatusCallback>,
    meter: Option<MeterCallback>,
}

struct MockState {
    graph: Mutex<MockGraph>,
    script: Mutex<MockScript>,
    calls: Mutex<HashMap<&'static str, usize>>,
    releases: Mutex<usize>,
    /// Held for reading while a callback runs; deactivate takes it for
    /// writing to wait for in-flight callbacks.
    callbacks: RwLock<CallbackSlots>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock collaborator owned by the bridge
///
/// Dropping it counts as releasing the native handle.
pub struct MockServerClient {
    state: Arc<MockState>,
}

/// Test-side handle onto a [`MockServerClient`]'s state
///
/// Stays usable after the client itself was handed to (and released by) a
/// bridge.
#[derive(Clone)]
pub struct MockControl {
    state: Arc<MockState>,
}

impl Default for MockServerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServerClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                graph: Mutex::new(MockGraph::new()),
                script: Mutex::new(MockScript::default()),
                calls: Mutex::new(HashMap::new()),
                releases: Mutex::new(0),
                callbacks: RwLock::new(CallbackSlots::default()),
            }),
        }
    }

    /// Handle for scripting and inspecting this mock from tests
    pub fn control(&self) -> MockControl {
        MockControl {
            state: Arc::clone(&self.state),
        }
    }

    /// Count the call, then apply any scripted panic or failure
    fn enter(&self, op: &'static str) -> NativeResult<()> {
        *lock(&self.state.calls).entry(op).or_insert(0) += 1;

        let script = lock(&self.state.script);
        if script.panic_on == Some(op) {
            drop(script);
            panic!("mock native panic in {}", op);
        }
        match script.failures.get(op) {
            Some(message) => Err(NativeError::new(message.clone())),
            None => Ok(()),
        }
    }

    fn with_channel(
        &self,
        op: &'static str,
        channel: ChannelIndex,
        apply: impl FnOnce(&mut ChannelParameters),
    ) -> NativeResult<()> {
        self.enter(op)?;
        let mut graph = lock(&self.state.graph);
        let count = graph.channels.len();
        match graph.channels.get_mut(channel) {
            Some(params) => {
                apply(params);
                Ok(())
            }
            None => Err(NativeError::new(format!(
                "channel {} out of range ({} channels)",
                channel, count
            ))),
        }
    }
}

impl Drop for MockServerClient {
    fn drop(&mut self) {
        *lock(&self.state.releases) += 1;
        let mut callbacks = self
            .state
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.status = None;
        callbacks.meter = None;
    }
}

impl AudioServerClient for MockServerClient {
    fn init(&self, client_name: &str) -> NativeResult<bool> {
        self.enter(ops::INIT)?;
        let mut graph = lock(&self.state.graph);
        if !graph.server_running || !graph.init_result {
            return Ok(false);
        }
        graph.client_name = Some(client_name.to_string());
        Ok(true)
    }

    fn create_ports(&self, num_inputs: usize, num_outputs: usize) -> NativeResult<bool> {
        self.enter(ops::CREATE_PORTS)?;
        let mut graph = lock(&self.state.graph);
        let Some(client) = graph.client_name.clone() else {
            return Ok(false);
        };

        graph.remove_client_ports(&client);
        for i in 1..=num_inputs {
            graph.ports.push(PortDescriptor::new(
                format!("{}:in_{}", client, i),
                AUDIO_PORT_TYPE,
                PortFlags::IS_INPUT,
            ));
        }
        for i in 1..=num_outputs {
            graph.ports.push(PortDescriptor::new(
                format!("{}:out_{}", client, i),
                AUDIO_PORT_TYPE,
                PortFlags::IS_OUTPUT,
            ));
        }
        graph.channels = vec![ChannelParameters::default(); num_inputs.max(num_outputs)];
        Ok(true)
    }

    fn activate(&self) -> NativeResult<bool> {
        self.enter(ops::ACTIVATE)?;
        let mut graph = lock(&self.state.graph);
        if graph.client_name.is_none() || !graph.server_running {
            return Ok(false);
        }
        graph.active = true;
        Ok(true)
    }

    fn deactivate(&self) -> NativeResult<bool> {
        self.enter(ops::DEACTIVATE)?;
        lock(&self.state.graph).active = false;

        // Wait for callbacks still running on other threads
        let callbacks = self
            .state
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        drop(callbacks);

        // A meter the "real-time thread" produced just as deactivation returns
        let late = lock(&self.state.script).late_meter.take();
        if let Some((channel, level)) = late {
            let callbacks = self
                .state
                .callbacks
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(meter) = callbacks.meter.as_ref() {
                meter(channel, level);
            }
        }
        Ok(true)
    }

    fn set_channel_volume(&self, channel: ChannelIndex, volume: f32) -> NativeResult<()> {
        self.with_channel(ops::SET_VOLUME, channel, |p| p.volume = volume)
    }

    fn set_channel_pan(&self, channel: ChannelIndex, pan: f32) -> NativeResult<()> {
        self.with_channel(ops::SET_PAN, channel, |p| p.pan = pan)
    }

    fn set_channel_gain(&self, channel: ChannelIndex, gain_db: f32) -> NativeResult<()> {
        self.with_channel(ops::SET_GAIN, channel, |p| p.gain_db = gain_db)
    }

    fn set_channel_mute(&self, channel: ChannelIndex, mute: bool) -> NativeResult<()> {
        self.with_channel(ops::SET_MUTE, channel, |p| p.mute = mute)
    }

    fn set_channel_solo(&self, channel: ChannelIndex, solo: bool) -> NativeResult<()> {
        self.with_channel(ops::SET_SOLO, channel, |p| p.solo = solo)
    }

    fn sample_rate(&self) -> NativeResult<u32> {
        self.enter(ops::SAMPLE_RATE)?;
        Ok(lock(&self.state.graph).sample_rate)
    }

    fn buffer_size(&self) -> NativeResult<u32> {
        self.enter(ops::BUFFER_SIZE)?;
        Ok(lock(&self.state.graph).buffer_size)
    }

    fn cpu_load(&self) -> NativeResult<f32> {
        self.enter(ops::CPU_LOAD)?;
        Ok(lock(&self.state.graph).cpu_load)
    }

    fn is_server_running(&self) -> NativeResult<bool> {
        self.enter(ops::IS_SERVER_RUNNING)?;
        Ok(lock(&self.state.graph).server_running)
    }

    fn server_status(&self) -> NativeResult<ServerStatus> {
        self.enter(ops::SERVER_STATUS)?;
        let graph = lock(&self.state.graph);
        if !graph.server_running {
            return Ok(ServerStatus::stopped());
        }
        Ok(ServerStatus {
            is_running: true,
            sample_rate: graph.sample_rate,
            buffer_size: graph.buffer_size,
            cpu_load: graph.cpu_load,
        })
    }

    fn connect_ports(&self, source: &str, destination: &str) -> NativeResult<bool> {
        self.enter(ops::CONNECT_PORTS)?;
        let mut graph = lock(&self.state.graph);
        let (Some(src), Some(dst)) = (graph.port_index(source), graph.port_index(destination))
        else {
            return Ok(false);
        };

        let allowed = graph.ports[src].is_output()
            && graph.ports[dst].is_input()
            && graph.ports[src].port_type == graph.ports[dst].port_type
            && !graph.ports[src].connections.iter().any(|c| c == destination);
        if !allowed {
            return Ok(false);
        }

        graph.ports[src].connections.push(destination.to_string());
        graph.ports[dst].connections.push(source.to_string());
        Ok(true)
    }

    fn disconnect_ports(&self, source: &str, destination: &str) -> NativeResult<bool> {
        self.enter(ops::DISCONNECT_PORTS)?;
        let mut graph = lock(&self.state.graph);
        let (Some(src), Some(dst)) = (graph.port_index(source), graph.port_index(destination))
        else {
            return Ok(false);
        };

        let before = graph.ports[src].connections.len();
        graph.ports[src].connections.retain(|c| c != destination);
        if graph.ports[src].connections.len() == before {
            return Ok(false);
        }
        graph.ports[dst].connections.retain(|c| c != source);
        Ok(true)
    }

    fn port_list(&self, port_type: &str, flags: PortFlags) -> NativeResult<Vec<String>> {
        self.enter(ops::PORT_LIST)?;
        Ok(lock(&self.state.graph)
            .ports
            .iter()
            .filter(|p| p.matches(port_type, flags))
            .map(|p| p.name.clone())
            .collect())
    }

    fn ports(&self) -> NativeResult<Vec<PortDescriptor>> {
        self.enter(ops::PORTS)?;
        Ok(lock(&self.state.graph).ports.clone())
    }

    fn set_status_callback(&self, callback: StatusCallback) {
        self.state
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .status = Some(callback);
    }

    fn set_meter_callback(&self, callback: MeterCallback) {
        self.state
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .meter = Some(callback);
    }
}

impl MockControl {
    // ─────────────────────────────────────────────────────────────
    // Scripting
    // ─────────────────────────────────────────────────────────────

    /// Simulate the server process starting or stopping
    pub fn set_server_running(&self, running: bool) {
        lock(&self.state.graph).server_running = running;
    }

    /// Make `init` report an operational failure
    pub fn set_init_result(&self, result: bool) {
        lock(&self.state.graph).init_result = result;
    }

    pub fn set_cpu_load(&self, load: f32) {
        lock(&self.state.graph).cpu_load = load;
    }

    /// Make `op` return a native error with `message` until cleared
    pub fn fail_with(&self, op: &'static str, message: &str) {
        lock(&self.state.script)
            .failures
            .insert(op, message.to_string());
    }

    pub fn clear_failures(&self) {
        let mut script = lock(&self.state.script);
        script.failures.clear();
        script.panic_on = None;
    }

    /// Make `op` panic inside the native layer
    pub fn panic_on(&self, op: &'static str) {
        lock(&self.state.script).panic_on = Some(op);
    }

    /// Fire one meter callback as the next `deactivate` returns
    pub fn queue_late_meter(&self, channel: ChannelIndex, peak: f32, rms: f32) {
        lock(&self.state.script).late_meter = Some((channel, MeterLevel::new(peak, rms)));
    }

    // ─────────────────────────────────────────────────────────────
    // Callback emission (stands in for the real-time thread)
    // ─────────────────────────────────────────────────────────────

    /// Invoke the status callback; returns false if none is registered
    pub fn emit_status(&self, is_running: bool) -> bool {
        let callbacks = self
            .state
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match callbacks.status.as_ref() {
            Some(status) => {
                status(is_running);
                true
            }
            None => false,
        }
    }

    /// Invoke the meter callback as the process cycle would
    ///
    /// Returns false without calling anything when the client is not active
    /// or no callback is registered.
    pub fn emit_meter(&self, channel: ChannelIndex, peak: f32, rms: f32) -> bool {
        let callbacks = self
            .state
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !lock(&self.state.graph).active {
            return false;
        }
        match callbacks.meter.as_ref() {
            Some(meter) => {
                meter(channel, MeterLevel::new(peak, rms));
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────

    /// Number of native calls made for `op`
    pub fn calls(&self, op: &str) -> usize {
        lock(&self.state.calls).get(op).copied().unwrap_or(0)
    }

    /// Number of native calls made across all operations
    pub fn total_calls(&self) -> usize {
        lock(&self.state.calls).values().sum()
    }

    /// How many times the owning client was dropped
    pub fn releases(&self) -> usize {
        *lock(&self.state.releases)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state.graph).active
    }

    pub fn client_name(&self) -> Option<String> {
        lock(&self.state.graph).client_name.clone()
    }

    pub fn channel_parameters(&self, channel: ChannelIndex) -> Option<ChannelParameters> {
        lock(&self.state.graph).channels.get(channel).copied()
    }

    pub fn connections(&self, port: &str) -> Vec<String> {
        let graph = lock(&self.state.graph);
        graph
            .port_index(port)
            .map(|i| graph.ports[i].connections.clone())
            .unwrap_or_default()
    }

    pub fn has_callbacks(&self) -> bool {
        let callbacks = self
            .state
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.status.is_some() && callbacks.meter.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized(name: &str) -> (MockServerClient, MockControl) {
        let mock = MockServerClient::new();
        let control = mock.control();
        assert!(mock.init(name).unwrap());
        assert!(mock.create_ports(2, 2).unwrap());
        (mock, control)
    }

    #[test]
    fn test_graph_rejects_direction_mismatch() {
        let (mock, _) = initialized("mixer1");
        assert!(!mock.connect_ports("mixer1:in_1", "mixer1:out_1").unwrap());
        assert!(!mock.connect_ports("mixer1:out_1", "system:nope").unwrap());
        assert!(mock.connect_ports("mixer1:out_1", "system:playback_1").unwrap());
        // Already connected
        assert!(!mock.connect_ports("mixer1:out_1", "system:playback_1").unwrap());
    }

    #[test]
    fn test_graph_rejects_type_mismatch() {
        let (mock, _) = initialized("mixer1");
        assert!(!mock
            .connect_ports("system:midi_capture_1", "mixer1:in_1")
            .unwrap());
    }

    #[test]
    fn test_connections_are_recorded_on_both_ends() {
        let (mock, control) = initialized("mixer1");
        assert!(mock.connect_ports("system:capture_1", "mixer1:in_1").unwrap());
        assert_eq!(control.connections("system:capture_1"), vec!["mixer1:in_1"]);
        assert_eq!(control.connections("mixer1:in_1"), vec!["system:capture_1"]);

        assert!(mock.disconnect_ports("system:capture_1", "mixer1:in_1").unwrap());
        assert!(control.connections("mixer1:in_1").is_empty());
        assert!(!mock.disconnect_ports("system:capture_1", "mixer1:in_1").unwrap());
    }

    #[test]
    fn test_recreating_ports_drops_old_connections() {
        let (mock, control) = initialized("mixer1");
        assert!(mock.connect_ports("mixer1:out_2", "system:playback_2").unwrap());
        assert!(mock.create_ports(1, 1).unwrap());
        assert!(control.connections("system:playback_2").is_empty());
        assert!(control.channel_parameters(1).is_none());
    }

    #[test]
    fn test_scripted_failure_and_counting() {
        let (mock, control) = initialized("mixer1");
        control.fail_with(ops::CPU_LOAD, "load query broke");
        assert_eq!(mock.cpu_load(), Err(NativeError::new("load query broke")));
        assert_eq!(control.calls(ops::CPU_LOAD), 1);
        assert_eq!(control.calls(ops::INIT), 1);
        control.clear_failures();
        assert!(mock.cpu_load().is_ok());
    }

    #[test]
    fn test_init_fails_when_server_down() {
        let mock = MockServerClient::new();
        let control = mock.control();
        control.set_server_running(false);
        assert!(!mock.init("mixer1").unwrap());
        assert_eq!(mock.server_status().unwrap(), ServerStatus::stopped());
    }

    #[test]
    fn test_drop_counts_release() {
        let mock = MockServerClient::new();
        let control = mock.control();
        drop(mock);
        assert_eq!(control.releases(), 1);
        assert!(!control.has_callbacks());
    }
}
