//! Native audio-server collaborator interface
//!
//! The bridge drives the audio server exclusively through [`AudioServerClient`].
//! Implementations:
//! - **JACK** (`jack_backend`): real server connection on Linux with the
//!   `jack-backend` feature
//! - **Mock** (`mock`): in-memory graph used by tests and demos
//!
//! # Contract
//!
//! - Methods take `&self`; implementations serialize conflicting native
//!   operations internally.
//! - `Ok(false)` reports an expected operational failure; `Err(NativeError)`
//!   is reserved for broken native state.
//! - `deactivate` must not return until no callback from this client is still
//!   running on the real-time thread.
//! - Registered callbacks may be invoked from a real-time thread at any time
//!   between registration and the client being dropped.

use crate::error::NativeResult;
use crate::types::{ChannelIndex, MeterLevel, PortDescriptor, PortFlags, ServerStatus};

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
mod jack_backend;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
pub use jack_backend::JackServerClient;
pub use mock::MockServerClient;

/// Called when the server starts or stops being reachable
pub type StatusCallback = Box<dyn Fn(bool) + Send + Sync + 'static>;

/// Called with a fresh meter reading for one channel
pub type MeterCallback = Box<dyn Fn(ChannelIndex, MeterLevel) + Send + Sync + 'static>;

/// Connection to a real-time audio routing server
pub trait AudioServerClient: Send + Sync {
    /// Register with the server under `client_name`
    fn init(&self, client_name: &str) -> NativeResult<bool>;

    /// Create `num_inputs` input and `num_outputs` output ports, replacing
    /// any ports created earlier
    fn create_ports(&self, num_inputs: usize, num_outputs: usize) -> NativeResult<bool>;

    /// Start real-time processing
    fn activate(&self) -> NativeResult<bool>;

    /// Stop real-time processing, blocking until in-flight callbacks finish
    fn deactivate(&self) -> NativeResult<bool>;

    fn set_channel_volume(&self, channel: ChannelIndex, volume: f32) -> NativeResult<()>;
    fn set_channel_pan(&self, channel: ChannelIndex, pan: f32) -> NativeResult<()>;
    fn set_channel_gain(&self, channel: ChannelIndex, gain_db: f32) -> NativeResult<()>;
    fn set_channel_mute(&self, channel: ChannelIndex, mute: bool) -> NativeResult<()>;
    fn set_channel_solo(&self, channel: ChannelIndex, solo: bool) -> NativeResult<()>;

    /// Sample rate in Hz
    fn sample_rate(&self) -> NativeResult<u32>;

    /// Buffer size in frames
    fn buffer_size(&self) -> NativeResult<u32>;

    /// DSP load as a percentage (0.0 - 100.0)
    fn cpu_load(&self) -> NativeResult<f32>;

    /// Whether the server process is reachable, independent of registration
    fn is_server_running(&self) -> NativeResult<bool>;

    /// Consistent snapshot of the server state
    fn server_status(&self) -> NativeResult<ServerStatus>;

    fn connect_ports(&self, source: &str, destination: &str) -> NativeResult<bool>;
    fn disconnect_ports(&self, source: &str, destination: &str) -> NativeResult<bool>;

    /// Names of ports matching the filter (see [`PortDescriptor::matches`])
    fn port_list(&self, port_type: &str, flags: PortFlags) -> NativeResult<Vec<String>>;

    /// Every port in the graph with its current connections
    fn ports(&self) -> NativeResult<Vec<PortDescriptor>>;

    /// Install the server-status callback, replacing any previous one
    fn set_status_callback(&self, callback: StatusCallback);

    /// Install the meter callback, replacing any previous one
    fn set_meter_callback(&self, callback: MeterCallback);
}
