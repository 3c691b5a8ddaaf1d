//! Value types shared by the bridge, its collaborators and consumers
//!
//! Everything here is a plain snapshot: nothing is cached between queries,
//! and port records are re-derived from the live graph on every call.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a mixer channel strip
///
/// Valid range is `[0, channel_count)` where the count is set by the last
/// successful `create_ports` call.
pub type ChannelIndex = usize;

/// Port type name used for audio ports
pub const AUDIO_PORT_TYPE: &str = "audio";

/// Port type name used for MIDI ports
pub const MIDI_PORT_TYPE: &str = "midi";

// ═══════════════════════════════════════════════════════════════════════════════
// Port flags
// ═══════════════════════════════════════════════════════════════════════════════

/// Bit set describing a port's direction and whether it is backed by hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortFlags(u32);

impl PortFlags {
    /// No flags (matches every port when used as a filter)
    pub const NONE: PortFlags = PortFlags(0);
    /// Port receives data (a sink in the routing graph)
    pub const IS_INPUT: PortFlags = PortFlags(1);
    /// Port produces data (a source in the routing graph)
    pub const IS_OUTPUT: PortFlags = PortFlags(2);
    /// Port corresponds to a physical device channel
    pub const IS_PHYSICAL: PortFlags = PortFlags(4);

    /// Build from raw bits, keeping unknown bits as-is
    pub const fn from_bits(bits: u32) -> Self {
        PortFlags(bits)
    }

    /// Raw bit value
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is also set in `self`
    pub const fn contains(self, other: PortFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Filter semantics for port queries: an empty filter matches everything,
    /// otherwise all filter bits must be present.
    pub const fn matches(self, filter: PortFlags) -> bool {
        filter.is_empty() || self.contains(filter)
    }
}

impl std::ops::BitOr for PortFlags {
    type Output = PortFlags;

    fn bitor(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PortFlags {
    fn bitor_assign(&mut self, rhs: PortFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for PortFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(PortFlags::IS_INPUT) {
            names.push("input");
        }
        if self.contains(PortFlags::IS_OUTPUT) {
            names.push("output");
        }
        if self.contains(PortFlags::IS_PHYSICAL) {
            names.push("physical");
        }
        if names.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Port records
// ═══════════════════════════════════════════════════════════════════════════════

/// One port of the server's routing graph, with its live connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// Full port name ("client:port")
    pub name: String,
    /// Normalised port type ("audio", "midi", or the server's raw type name)
    pub port_type: String,
    pub flags: PortFlags,
    /// Names of peer ports, in the order the server reports them
    pub connections: Vec<String>,
}

impl PortDescriptor {
    pub fn new(name: impl Into<String>, port_type: impl Into<String>, flags: PortFlags) -> Self {
        Self {
            name: name.into(),
            port_type: port_type.into(),
            flags,
            connections: Vec::new(),
        }
    }

    pub fn is_input(&self) -> bool {
        self.flags.contains(PortFlags::IS_INPUT)
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(PortFlags::IS_OUTPUT)
    }

    pub fn is_physical(&self) -> bool {
        self.flags.contains(PortFlags::IS_PHYSICAL)
    }

    /// Client part of the name (everything before the last colon)
    pub fn client_name(&self) -> &str {
        self.name
            .rfind(':')
            .map(|pos| &self.name[..pos])
            .unwrap_or(&self.name)
    }

    /// Port-list filter: empty `port_type` matches all types, empty `flags`
    /// matches all directions.
    pub fn matches(&self, port_type: &str, flags: PortFlags) -> bool {
        (port_type.is_empty() || self.port_type == port_type) && self.flags.matches(flags)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server status
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of the audio server's state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerStatus {
    pub is_running: bool,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Buffer size in frames
    pub buffer_size: u32,
    /// DSP load as a percentage (0.0 - 100.0)
    pub cpu_load: f32,
}

impl ServerStatus {
    /// Status reported when the server cannot be reached
    pub fn stopped() -> Self {
        Self::default()
    }

    /// One-way latency of a single buffer in milliseconds
    pub fn latency_ms(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Server-status notification delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub is_running: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Meters
// ═══════════════════════════════════════════════════════════════════════════════

/// Peak and RMS level of one channel, both in [0.0, 1.0]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeterLevel {
    pub peak: f32,
    pub rms: f32,
}

impl MeterLevel {
    pub const SILENT: MeterLevel = MeterLevel { peak: 0.0, rms: 0.0 };

    pub fn new(peak: f32, rms: f32) -> Self {
        Self { peak, rms }
    }
}

/// Meter update for one channel, produced once per real-time callback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSample {
    pub channel: ChannelIndex,
    pub peak: f32,
    pub rms: f32,
}

impl MeterSample {
    pub fn level(&self) -> MeterLevel {
        MeterLevel::new(self.peak, self.rms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Channel parameters
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-channel mixing parameters as held by the collaborator
///
/// The bridge never stores these; it only forwards setter calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelParameters {
    /// Fader position (0.0 - 1.0)
    pub volume: f32,
    /// Pan position (0.0 left, 0.5 center, 1.0 right)
    pub pan: f32,
    /// Trim gain in dB
    pub gain_db: f32,
    pub mute: bool,
    pub solo: bool,
}

impl Default for ChannelParameters {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pan: 0.5,
            gain_db: 0.0,
            mute: false,
            solo: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, port_type: &str, flags: PortFlags) -> PortDescriptor {
        PortDescriptor::new(name, port_type, flags)
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let p = port(
            "system:capture_1",
            AUDIO_PORT_TYPE,
            PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL,
        );
        assert!(p.matches("", PortFlags::NONE));
        let m = port("system:midi_in", MIDI_PORT_TYPE, PortFlags::IS_INPUT);
        assert!(m.matches("", PortFlags::NONE));
    }

    #[test]
    fn test_flag_filter_requires_all_bits() {
        let p = port(
            "system:playback_1",
            AUDIO_PORT_TYPE,
            PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL,
        );
        assert!(p.matches(AUDIO_PORT_TYPE, PortFlags::IS_INPUT));
        assert!(p.matches(AUDIO_PORT_TYPE, PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL));
        assert!(!p.matches(AUDIO_PORT_TYPE, PortFlags::IS_OUTPUT));
        assert!(!p.matches(MIDI_PORT_TYPE, PortFlags::IS_INPUT));
    }

    #[test]
    fn test_port_accessors() {
        let p = port("mixer1:out_1", AUDIO_PORT_TYPE, PortFlags::IS_OUTPUT);
        assert!(p.is_output());
        assert!(!p.is_input());
        assert!(!p.is_physical());
        assert_eq!(p.client_name(), "mixer1");
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(
            (PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL).to_string(),
            "input|physical"
        );
        assert_eq!(PortFlags::NONE.to_string(), "-");
    }

    #[test]
    fn test_latency() {
        let status = ServerStatus {
            is_running: true,
            sample_rate: 48000,
            buffer_size: 480,
            cpu_load: 3.0,
        };
        assert!((status.latency_ms() - 10.0).abs() < 1e-4);
        assert_eq!(ServerStatus::stopped().latency_ms(), 0.0);
    }
}
