//! Bridge error types
//!
//! Lifecycle misuse and invalid channels are raised before any native call.
//! Expected negative outcomes (server unreachable, port missing, connection
//! refused by the graph) are `Ok(false)` results, not errors.

use thiserror::Error;

use crate::types::ChannelIndex;

/// Errors returned by the bridge's control surface
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Operation attempted after the bridge was torn down
    #[error("Audio bridge has been disposed")]
    Disposed,

    /// Operation requires a successful `initialize` first
    #[error("Audio server client is not initialized")]
    NotInitialized,

    /// Channel index outside the range defined by `create_ports`
    #[error("Invalid channel {channel} (channel count: {channel_count})")]
    InvalidChannel {
        channel: ChannelIndex,
        channel_count: usize,
    },

    /// Unexpected failure inside the native collaborator
    #[error("{operation} failed: {message}")]
    Native {
        operation: &'static str,
        message: String,
    },
}

impl BridgeError {
    /// True for the two lifecycle misuse variants
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, BridgeError::Disposed | BridgeError::NotInitialized)
    }

    /// Original native error text, if this wraps a collaborator failure
    pub fn native_message(&self) -> Option<&str> {
        match self {
            BridgeError::Native { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Result type for control-surface operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Exceptional failure reported by a native collaborator
///
/// Ordinary "it didn't work" outcomes are `Ok(false)`; this is for the cases
/// where the native layer itself broke.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct NativeError(pub String);

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Result type for collaborator operations
pub type NativeResult<T> = Result<T, NativeError>;
