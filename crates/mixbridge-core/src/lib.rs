//! MixBridge Core - Audio-server bridge for a multi-channel software mixer
//!
//! Wraps a native audio-server client (JACK on Linux) behind [`AudioBridge`]:
//! a lifecycle-guarded control surface plus a real-time-safe relay that turns
//! server callbacks into bounded `flume` notification streams.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod gc;
pub mod types;

pub use bridge::{AudioBridge, LifecycleState, RelayStats};
pub use client::AudioServerClient;
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult, NativeError, NativeResult};
pub use types::*;
