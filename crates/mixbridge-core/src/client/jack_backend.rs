//! Native JACK client for Linux
//!
//! Registers one input and one output port per channel strip and runs a
//! simple mixer in the process callback: input N is scaled by the strip's
//! fader, trim, balance, mute and solo state and written to output N. Peak
//! and RMS of each strip are reported through the meter callback every
//! `meter_decimation` cycles.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  Relaxed atomics    ┌─────────────────────┐
//! │  Bridge threads  │────────────────────►│   StripParams       │
//! │ (set_channel_*)  │                     │   (lock-free)       │
//! └──────────────────┘                     └──────────┬──────────┘
//!                                                     │ load
//!                                                     ▼
//! ┌──────────────────┐   meter callback    ┌─────────────────────┐
//! │  CallbackRelay   │◄────────────────────│  JACK RT Thread     │
//! │                  │◄──── shutdown ──────│  (owns the ports)   │
//! └──────────────────┘                     └─────────────────────┘
//! ```
//!
//! Port registration and activation go through a mutex on the control side
//! only; the process handler owns its ports and never locks.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jack::{AsyncClient, AudioIn, AudioOut, Client, ClientOptions, Control, Port, ProcessScope};

use super::{AudioServerClient, MeterCallback, StatusCallback};
use crate::config::BridgeConfig;
use crate::error::{NativeError, NativeResult};
use crate::types::{
    ChannelIndex, ChannelParameters, MeterLevel, PortDescriptor, PortFlags, ServerStatus,
    AUDIO_PORT_TYPE, MIDI_PORT_TYPE,
};

type SharedStatusCallback = Arc<dyn Fn(bool) + Send + Sync + 'static>;
type SharedMeterCallback = Arc<dyn Fn(ChannelIndex, MeterLevel) + Send + Sync + 'static>;

// ═══════════════════════════════════════════════════════════════════════════════
// Channel strip parameters
// ═══════════════════════════════════════════════════════════════════════════════

/// Lock-free parameters for one strip, written by control threads and read
/// by the process callback
struct StripParams {
    volume: AtomicU32,
    pan: AtomicU32,
    gain_db: AtomicU32,
    mute: AtomicBool,
    solo: AtomicBool,
}

impl StripParams {
    fn new() -> Self {
        let defaults = ChannelParameters::default();
        Self {
            volume: AtomicU32::new(defaults.volume.to_bits()),
            pan: AtomicU32::new(defaults.pan.to_bits()),
            gain_db: AtomicU32::new(defaults.gain_db.to_bits()),
            mute: AtomicBool::new(defaults.mute),
            solo: AtomicBool::new(defaults.solo),
        }
    }

    #[inline]
    fn load(&self) -> ChannelParameters {
        ChannelParameters {
            volume: f32::from_bits(self.volume.load(Ordering::Relaxed)),
            pan: f32::from_bits(self.pan.load(Ordering::Relaxed)),
            gain_db: f32::from_bits(self.gain_db.load(Ordering::Relaxed)),
            mute: self.mute.load(Ordering::Relaxed),
            solo: self.solo.load(Ordering::Relaxed),
        }
    }
}

/// Linear gain applied to strip `channel` for one cycle
///
/// Even channels are treated as the left side of an output pair and odd
/// channels as the right side, so pan acts as a balance control with unity
/// gain at center.
#[inline]
fn strip_gain(channel: ChannelIndex, params: &ChannelParameters, any_solo: bool) -> f32 {
    if params.mute || (any_solo && !params.solo) {
        return 0.0;
    }
    let trim = 10f32.powf(params.gain_db / 20.0);
    let pan = params.pan.clamp(0.0, 1.0);
    let balance = if channel % 2 == 0 {
        (2.0 * (1.0 - pan)).min(1.0)
    } else {
        (2.0 * pan).min(1.0)
    };
    params.volume.max(0.0) * trim * balance
}

// ═══════════════════════════════════════════════════════════════════════════════
// JACK handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// Running peak/RMS accumulator for one strip
#[derive(Clone, Copy, Default)]
struct MeterAccumulator {
    peak: f32,
    sum_squares: f32,
    frames: usize,
}

impl MeterAccumulator {
    #[inline]
    fn add(&mut self, sample: f32) {
        let magnitude = sample.abs();
        if magnitude > self.peak {
            self.peak = magnitude;
        }
        self.sum_squares += sample * sample;
        self.frames += 1;
    }

    #[inline]
    fn take(&mut self) -> MeterLevel {
        let level = if self.frames == 0 {
            MeterLevel::SILENT
        } else {
            MeterLevel::new(self.peak, (self.sum_squares / self.frames as f32).sqrt())
        };
        *self = Self::default();
        level
    }
}

/// JACK process handler
///
/// Owns the registered ports while the client is active; they are handed
/// back on deactivation.
struct JackProcessor {
    inputs: Vec<Port<AudioIn>>,
    outputs: Vec<Port<AudioOut>>,
    strips: Arc<Vec<StripParams>>,
    meters: Vec<MeterAccumulator>,
    meter_callback: Option<SharedMeterCallback>,
    meter_decimation: u32,
    cycle: u32,
}

impl jack::ProcessHandler for JackProcessor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let any_solo = self
            .strips
            .iter()
            .any(|strip| strip.solo.load(Ordering::Relaxed));

        for (channel, strip) in self.strips.iter().enumerate() {
            let gain = strip_gain(channel, &strip.load(), any_solo);
            let meter = &mut self.meters[channel];
            let input = self.inputs.get(channel).map(|port| port.as_slice(ps));

            match (input, self.outputs.get_mut(channel)) {
                (Some(input), Some(output)) => {
                    for (out, &sample) in output.as_mut_slice(ps).iter_mut().zip(input) {
                        *out = sample * gain;
                        meter.add(*out);
                    }
                }
                (Some(input), None) => {
                    for &sample in input {
                        meter.add(sample * gain);
                    }
                }
                (None, Some(output)) => {
                    output.as_mut_slice(ps).fill(0.0);
                }
                (None, None) => {}
            }
        }

        self.cycle += 1;
        if self.cycle >= self.meter_decimation {
            self.cycle = 0;
            for (channel, meter) in self.meters.iter_mut().enumerate() {
                let level = meter.take();
                if let Some(callback) = self.meter_callback.as_ref() {
                    callback(channel, level);
                }
            }
        }

        Control::Continue
    }
}

/// JACK notification handler
struct JackNotifications {
    status_callback: Option<SharedStatusCallback>,
    server_down: Arc<AtomicBool>,
}

impl jack::NotificationHandler for JackNotifications {
    unsafe fn shutdown(&mut self, _status: jack::ClientStatus, reason: &str) {
        log::warn!("JACK server shut down: {}", reason);
        self.server_down.store(true, Ordering::Release);
        if let Some(callback) = self.status_callback.as_ref() {
            callback(false);
        }
    }

    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        log::info!("JACK sample rate changed to: {}", srate);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        log::warn!("JACK xrun detected");
        Control::Continue
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════════

enum JackState {
    Closed,
    Open {
        client: Client,
        inputs: Vec<Port<AudioIn>>,
        outputs: Vec<Port<AudioOut>>,
    },
    Active(AsyncClient<JackNotifications, JackProcessor>),
}

/// What `init` and `create_ports` last registered, kept so a client lost in
/// a failed transition can be opened again
#[derive(Clone)]
struct Registration {
    name: String,
    inputs: usize,
    outputs: usize,
}

#[derive(Default)]
struct Callbacks {
    status: Option<SharedStatusCallback>,
    meter: Option<SharedMeterCallback>,
}

/// [`AudioServerClient`] backed by a real JACK connection
pub struct JackServerClient {
    state: Mutex<JackState>,
    registration: Mutex<Option<Registration>>,
    strips: Mutex<Arc<Vec<StripParams>>>,
    callbacks: Mutex<Callbacks>,
    server_down: Arc<AtomicBool>,
    options: ClientOptions,
    meter_decimation: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn native(context: &str, e: jack::Error) -> NativeError {
    NativeError::new(format!("{}: {}", context, e))
}

type PortSet = (Vec<Port<AudioIn>>, Vec<Port<AudioOut>>);

/// Register `in_1..` and `out_1..`; on failure nothing stays registered
fn register_ports(
    client: &Client,
    num_inputs: usize,
    num_outputs: usize,
) -> Result<PortSet, jack::Error> {
    let mut inputs = Vec::with_capacity(num_inputs);
    let mut outputs = Vec::with_capacity(num_outputs);
    for i in 1..=num_inputs {
        match client.register_port(&format!("in_{}", i), AudioIn::default()) {
            Ok(port) => inputs.push(port),
            Err(e) => {
                release_ports(client, inputs, outputs);
                return Err(e);
            }
        }
    }
    for i in 1..=num_outputs {
        match client.register_port(&format!("out_{}", i), AudioOut::default()) {
            Ok(port) => outputs.push(port),
            Err(e) => {
                release_ports(client, inputs, outputs);
                return Err(e);
            }
        }
    }
    Ok((inputs, outputs))
}

fn release_ports(client: &Client, inputs: Vec<Port<AudioIn>>, outputs: Vec<Port<AudioOut>>) {
    for port in inputs {
        if let Err(e) = client.unregister_port(port) {
            log::warn!("Failed to unregister input port: {}", e);
        }
    }
    for port in outputs {
        if let Err(e) = client.unregister_port(port) {
            log::warn!("Failed to unregister output port: {}", e);
        }
    }
}

/// Map JACK's type strings onto the bridge's short names
fn normalize_port_type(raw: &str) -> String {
    if raw.contains("audio") {
        AUDIO_PORT_TYPE.to_string()
    } else if raw.contains("midi") {
        MIDI_PORT_TYPE.to_string()
    } else {
        raw.to_string()
    }
}

/// Regex accepted by `jack_get_ports` for a short type name
fn type_pattern(port_type: &str) -> Option<&'static str> {
    match port_type {
        "" => None,
        AUDIO_PORT_TYPE => Some(".*audio.*"),
        MIDI_PORT_TYPE => Some(".*midi.*"),
        _ => Some("^$"),
    }
}

fn to_jack_flags(flags: PortFlags) -> jack::PortFlags {
    let mut out = jack::PortFlags::empty();
    if flags.contains(PortFlags::IS_INPUT) {
        out |= jack::PortFlags::IS_INPUT;
    }
    if flags.contains(PortFlags::IS_OUTPUT) {
        out |= jack::PortFlags::IS_OUTPUT;
    }
    if flags.contains(PortFlags::IS_PHYSICAL) {
        out |= jack::PortFlags::IS_PHYSICAL;
    }
    out
}

fn from_jack_flags(flags: jack::PortFlags) -> PortFlags {
    let mut out = PortFlags::NONE;
    if flags.contains(jack::PortFlags::IS_INPUT) {
        out |= PortFlags::IS_INPUT;
    }
    if flags.contains(jack::PortFlags::IS_OUTPUT) {
        out |= PortFlags::IS_OUTPUT;
    }
    if flags.contains(jack::PortFlags::IS_PHYSICAL) {
        out |= PortFlags::IS_PHYSICAL;
    }
    out
}

impl JackServerClient {
    pub fn new(config: &BridgeConfig) -> Self {
        let options = if config.start_server {
            ClientOptions::empty()
        } else {
            ClientOptions::NO_START_SERVER
        };
        Self {
            state: Mutex::new(JackState::Closed),
            registration: Mutex::new(None),
            strips: Mutex::new(Arc::new(Vec::new())),
            callbacks: Mutex::new(Callbacks::default()),
            server_down: Arc::new(AtomicBool::new(false)),
            options,
            meter_decimation: config.meter_decimation.max(1),
        }
    }

    /// Run `f` against the open client, active or not
    fn with_client<T>(&self, f: impl FnOnce(&Client) -> T) -> NativeResult<T> {
        let state = lock(&self.state);
        match &*state {
            JackState::Open { client, .. } => Ok(f(client)),
            JackState::Active(async_client) => Ok(f(async_client.as_client())),
            JackState::Closed => Err(NativeError::new("JACK client is not open")),
        }
    }

    /// Temporary client used to query a server we are not registered with
    fn query_client(&self) -> Option<Client> {
        match Client::new("mixbridge_query", ClientOptions::NO_START_SERVER) {
            Ok((client, _)) => Some(client),
            Err(e) => {
                log::debug!("Could not connect to JACK: {}", e);
                None
            }
        }
    }

    /// Open the client again under its registered name, with the same ports
    ///
    /// Used after a failed activate or deactivate consumed the client.
    /// Returns `Closed` if nothing was registered or the server refuses.
    fn reopen(&self) -> JackState {
        let Some(registration) = lock(&self.registration).clone() else {
            return JackState::Closed;
        };
        let client = match Client::new(&registration.name, self.options) {
            Ok((client, _)) => client,
            Err(e) => {
                log::error!("Could not reopen JACK client '{}': {}", registration.name, e);
                return JackState::Closed;
            }
        };
        let (inputs, outputs) =
            match register_ports(&client, registration.inputs, registration.outputs) {
                Ok(ports) => ports,
                Err(e) => {
                    log::error!("Reopened JACK client without ports: {}", e);
                    (Vec::new(), Vec::new())
                }
            };
        log::info!("Reopened JACK client '{}'", client.name());
        JackState::Open {
            client,
            inputs,
            outputs,
        }
    }

    fn is_connected(&self) -> bool {
        !self.server_down.load(Ordering::Acquire)
            && !matches!(&*lock(&self.state), JackState::Closed)
    }

    fn with_strip(
        &self,
        channel: ChannelIndex,
        apply: impl FnOnce(&StripParams),
    ) -> NativeResult<()> {
        let strips = lock(&self.strips);
        match strips.get(channel) {
            Some(strip) => {
                apply(strip);
                Ok(())
            }
            None => Err(NativeError::new(format!(
                "channel {} out of range ({} channels)",
                channel,
                strips.len()
            ))),
        }
    }
}

impl AudioServerClient for JackServerClient {
    fn init(&self, client_name: &str) -> NativeResult<bool> {
        let mut state = lock(&self.state);
        if !matches!(&*state, JackState::Closed) {
            return Ok(true);
        }

        // JACK may rename the client if the name is taken
        let (client, _status) = match Client::new(client_name, self.options) {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Could not register JACK client '{}': {}", client_name, e);
                return Ok(false);
            }
        };

        log::info!(
            "JACK client '{}' created (sample rate: {}Hz, buffer: {} frames)",
            client.name(),
            client.sample_rate(),
            client.buffer_size()
        );
        self.server_down.store(false, Ordering::Release);
        *lock(&self.registration) = Some(Registration {
            name: client.name().to_string(),
            inputs: 0,
            outputs: 0,
        });
        *state = JackState::Open {
            client,
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        Ok(true)
    }

    fn create_ports(&self, num_inputs: usize, num_outputs: usize) -> NativeResult<bool> {
        let mut state = lock(&self.state);
        if let JackState::Active(_) = &*state {
            return Err(NativeError::new(
                "ports cannot be recreated while the client is active",
            ));
        }
        let JackState::Open {
            client,
            inputs,
            outputs,
        } = &mut *state
        else {
            return Ok(false);
        };

        // Names are reused, so the old set goes first; on failure it is restored
        let previous = (inputs.len(), outputs.len());
        release_ports(client, std::mem::take(inputs), std::mem::take(outputs));

        match register_ports(client, num_inputs, num_outputs) {
            Ok((new_inputs, new_outputs)) => {
                *inputs = new_inputs;
                *outputs = new_outputs;
            }
            Err(e) => {
                match register_ports(client, previous.0, previous.1) {
                    Ok((old_inputs, old_outputs)) => {
                        *inputs = old_inputs;
                        *outputs = old_outputs;
                    }
                    Err(restore) => log::error!("Could not restore previous ports: {}", restore),
                }
                return Err(native("Failed to register port", e));
            }
        }

        if let Some(registration) = lock(&self.registration).as_mut() {
            registration.inputs = num_inputs;
            registration.outputs = num_outputs;
        }
        let strips = (0..num_inputs.max(num_outputs))
            .map(|_| StripParams::new())
            .collect();
        *lock(&self.strips) = Arc::new(strips);
        Ok(true)
    }

    fn activate(&self) -> NativeResult<bool> {
        let mut state = lock(&self.state);
        match std::mem::replace(&mut *state, JackState::Closed) {
            JackState::Open {
                client,
                inputs,
                outputs,
            } => {
                let callbacks = lock(&self.callbacks);
                let strips = lock(&self.strips).clone();
                let processor = JackProcessor {
                    inputs,
                    outputs,
                    meters: vec![MeterAccumulator::default(); strips.len()],
                    strips,
                    meter_callback: callbacks.meter.clone(),
                    meter_decimation: self.meter_decimation,
                    cycle: 0,
                };
                let notifications = JackNotifications {
                    status_callback: callbacks.status.clone(),
                    server_down: Arc::clone(&self.server_down),
                };

                match client.activate_async(notifications, processor) {
                    Ok(async_client) => {
                        log::info!("JACK client activated");
                        *state = JackState::Active(async_client);
                        Ok(true)
                    }
                    Err(e) => {
                        *state = self.reopen();
                        Err(native("Failed to activate JACK client", e))
                    }
                }
            }
            active @ JackState::Active(_) => {
                *state = active;
                Ok(true)
            }
            JackState::Closed => Ok(false),
        }
    }

    fn deactivate(&self) -> NativeResult<bool> {
        let mut state = lock(&self.state);
        match std::mem::replace(&mut *state, JackState::Closed) {
            JackState::Active(async_client) => {
                // Returns once the process callback can no longer run
                match async_client.deactivate() {
                    Ok((client, _notifications, processor)) => {
                        log::info!("JACK client deactivated");
                        *state = JackState::Open {
                            client,
                            inputs: processor.inputs,
                            outputs: processor.outputs,
                        };
                        Ok(true)
                    }
                    Err(e) => {
                        *state = self.reopen();
                        Err(native("Failed to deactivate JACK client", e))
                    }
                }
            }
            open @ JackState::Open { .. } => {
                *state = open;
                Ok(true)
            }
            JackState::Closed => Ok(false),
        }
    }

    fn set_channel_volume(&self, channel: ChannelIndex, volume: f32) -> NativeResult<()> {
        self.with_strip(channel, |s| s.volume.store(volume.to_bits(), Ordering::Relaxed))
    }

    fn set_channel_pan(&self, channel: ChannelIndex, pan: f32) -> NativeResult<()> {
        self.with_strip(channel, |s| s.pan.store(pan.to_bits(), Ordering::Relaxed))
    }

    fn set_channel_gain(&self, channel: ChannelIndex, gain_db: f32) -> NativeResult<()> {
        self.with_strip(channel, |s| s.gain_db.store(gain_db.to_bits(), Ordering::Relaxed))
    }

    fn set_channel_mute(&self, channel: ChannelIndex, mute: bool) -> NativeResult<()> {
        self.with_strip(channel, |s| s.mute.store(mute, Ordering::Relaxed))
    }

    fn set_channel_solo(&self, channel: ChannelIndex, solo: bool) -> NativeResult<()> {
        self.with_strip(channel, |s| s.solo.store(solo, Ordering::Relaxed))
    }

    fn sample_rate(&self) -> NativeResult<u32> {
        self.with_client(|c| c.sample_rate() as u32)
    }

    fn buffer_size(&self) -> NativeResult<u32> {
        self.with_client(|c| c.buffer_size())
    }

    fn cpu_load(&self) -> NativeResult<f32> {
        self.with_client(|c| c.cpu_load())
    }

    fn is_server_running(&self) -> NativeResult<bool> {
        if self.is_connected() {
            return Ok(true);
        }
        Ok(self.query_client().is_some())
    }

    fn server_status(&self) -> NativeResult<ServerStatus> {
        let read = |c: &Client| ServerStatus {
            is_running: true,
            sample_rate: c.sample_rate() as u32,
            buffer_size: c.buffer_size(),
            cpu_load: c.cpu_load(),
        };
        if self.is_connected() {
            return self.with_client(read);
        }
        Ok(self
            .query_client()
            .map(|c| read(&c))
            .unwrap_or_else(ServerStatus::stopped))
    }

    fn connect_ports(&self, source: &str, destination: &str) -> NativeResult<bool> {
        self.with_client(|c| match c.connect_ports_by_name(source, destination) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Could not connect {} -> {}: {}", source, destination, e);
                false
            }
        })
    }

    fn disconnect_ports(&self, source: &str, destination: &str) -> NativeResult<bool> {
        self.with_client(|c| match c.disconnect_ports_by_name(source, destination) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Could not disconnect {} -> {}: {}", source, destination, e);
                false
            }
        })
    }

    fn port_list(&self, port_type: &str, flags: PortFlags) -> NativeResult<Vec<String>> {
        self.with_client(|c| c.ports(None, type_pattern(port_type), to_jack_flags(flags)))
    }

    fn ports(&self) -> NativeResult<Vec<PortDescriptor>> {
        self.with_client(|c| {
            c.ports(None, None, jack::PortFlags::empty())
                .into_iter()
                .filter_map(|name| {
                    let port = c.port_by_name(&name)?;
                    let port_type = port
                        .port_type()
                        .map(|t| normalize_port_type(&t))
                        .unwrap_or_default();
                    let mut descriptor =
                        PortDescriptor::new(name, port_type, from_jack_flags(port.flags()));
                    descriptor.connections = port.get_connections();
                    Some(descriptor)
                })
                .collect()
        })
    }

    fn set_status_callback(&self, callback: StatusCallback) {
        lock(&self.callbacks).status = Some(Arc::from(callback));
    }

    fn set_meter_callback(&self, callback: MeterCallback) {
        lock(&self.callbacks).meter = Some(Arc::from(callback));
    }
}

impl Drop for JackServerClient {
    fn drop(&mut self) {
        let state = std::mem::replace(&mut *lock(&self.state), JackState::Closed);
        match state {
            JackState::Active(async_client) => {
                if let Err(e) = async_client.deactivate() {
                    log::warn!("Failed to deactivate JACK client on release: {}", e);
                }
            }
            JackState::Open { client, .. } => drop(client),
            JackState::Closed => {}
        }
        log::debug!("JACK client released");
    }
}
