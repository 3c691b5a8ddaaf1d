//! Bridge configuration
//!
//! [`BridgeConfig`] is a plain serde record stored as YAML. Missing fields
//! take their defaults, so partial files are valid.
//!
//! # Usage
//!
//! ```ignore
//! use mixbridge_core::config::{default_config_path, load_config, BridgeConfig};
//!
//! let config: BridgeConfig = load_config(&default_config_path());
//! let bridge = AudioBridge::open_jack(config.clone());
//! bridge.initialize(&config.client_name)?;
//! ```

mod io;
mod paths;

pub use io::{load_config, save_config};
pub use paths::{default_config_dir, default_config_path};

use serde::{Deserialize, Serialize};

/// Default name registered with the audio server
pub const DEFAULT_CLIENT_NAME: &str = "mixbridge";

/// Default per-subscriber queue length for status changes
pub const DEFAULT_STATUS_QUEUE_CAPACITY: usize = 16;

/// Default per-subscriber queue length for meter samples
///
/// At 48kHz / 256 frames with 8 channels metered every 4 cycles this holds
/// roughly 2.7s of samples.
pub const DEFAULT_METER_QUEUE_CAPACITY: usize = 1024;

/// Default number of process cycles between meter bursts
pub const DEFAULT_METER_DECIMATION: u32 = 4;

/// How `create_ports(inputs, outputs)` maps to the valid channel range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRange {
    /// One shared range `[0, max(inputs, outputs))`; strip `i` pairs input
    /// `i` with output `i` where both exist
    #[default]
    Widest,
    /// Channels address input ports only: `[0, inputs)`
    Inputs,
    /// Channels address output ports only: `[0, outputs)`
    Outputs,
}

impl ChannelRange {
    /// Number of addressable channels for a port layout
    pub fn channel_count(self, num_inputs: usize, num_outputs: usize) -> usize {
        match self {
            ChannelRange::Widest => num_inputs.max(num_outputs),
            ChannelRange::Inputs => num_inputs,
            ChannelRange::Outputs => num_outputs,
        }
    }
}

/// Configuration for an [`AudioBridge`](crate::AudioBridge)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name to register with the audio server
    pub client_name: String,

    /// Channel-index convention for the control surface
    pub channel_range: ChannelRange,

    /// Queue length of each status subscription
    pub status_queue_capacity: usize,

    /// Queue length of each meter subscription
    pub meter_queue_capacity: usize,

    /// Let the native client start a server if none is running
    /// (JACK: clears `NO_START_SERVER`)
    pub start_server: bool,

    /// Process cycles between meter updates (JACK backend)
    pub meter_decimation: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            channel_range: ChannelRange::default(),
            status_queue_capacity: DEFAULT_STATUS_QUEUE_CAPACITY,
            meter_queue_capacity: DEFAULT_METER_QUEUE_CAPACITY,
            start_server: false,
            meter_decimation: DEFAULT_METER_DECIMATION,
        }
    }
}

impl BridgeConfig {
    /// Set the client name
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Set the channel-index convention
    pub fn with_channel_range(mut self, range: ChannelRange) -> Self {
        self.channel_range = range;
        self
    }

    /// Set both subscription queue lengths
    pub fn with_queue_capacity(mut self, status: usize, meters: usize) -> Self {
        self.status_queue_capacity = status;
        self.meter_queue_capacity = meters;
        self
    }

    /// Set the meter decimation (clamped to at least one cycle)
    pub fn with_meter_decimation(mut self, cycles: u32) -> Self {
        self.meter_decimation = cycles.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_range_counts() {
        assert_eq!(ChannelRange::Widest.channel_count(2, 4), 4);
        assert_eq!(ChannelRange::Inputs.channel_count(2, 4), 2);
        assert_eq!(ChannelRange::Outputs.channel_count(2, 4), 4);
        assert_eq!(ChannelRange::Widest.channel_count(0, 0), 0);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: BridgeConfig =
            serde_yaml::from_str("client_name: mixer1\nchannel_range: inputs\n").unwrap();
        assert_eq!(config.client_name, "mixer1");
        assert_eq!(config.channel_range, ChannelRange::Inputs);
        assert_eq!(config.meter_queue_capacity, DEFAULT_METER_QUEUE_CAPACITY);
        assert!(!config.start_server);
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::default()
            .with_client_name("desk")
            .with_queue_capacity(2, 8)
            .with_meter_decimation(0);
        assert_eq!(config.client_name, "desk");
        assert_eq!(config.status_queue_capacity, 2);
        assert_eq!(config.meter_queue_capacity, 8);
        assert_eq!(config.meter_decimation, 1);
    }
}
