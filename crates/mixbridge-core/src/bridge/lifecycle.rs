//! Tri-state lifecycle guard
//!
//! `Uninitialized → Initialized → Disposed`, with `Uninitialized → Disposed`
//! for bridges torn down before a successful `initialize`. Disposed is
//! absorbing: no transition leaves it.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{BridgeError, BridgeResult};

/// Lifecycle state of an [`AudioBridge`](super::AudioBridge)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Disposed,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Disposed,
            _ => LifecycleState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Uninitialized => 0,
            LifecycleState::Initialized => 1,
            LifecycleState::Disposed => 2,
        }
    }
}

/// Atomic lifecycle state checked before every native delegation
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Uninitialized.as_u8()),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Gate for operations that only need the bridge to be alive
    pub(crate) fn ensure_alive(&self) -> BridgeResult<LifecycleState> {
        match self.state() {
            LifecycleState::Disposed => Err(BridgeError::Disposed),
            state => Ok(state),
        }
    }

    /// Gate for operations that need a registered client
    pub(crate) fn ensure_initialized(&self) -> BridgeResult<()> {
        match self.state() {
            LifecycleState::Disposed => Err(BridgeError::Disposed),
            LifecycleState::Uninitialized => Err(BridgeError::NotInitialized),
            LifecycleState::Initialized => Ok(()),
        }
    }

    /// `Uninitialized → Initialized`; false if the bridge is no longer
    /// uninitialized
    pub(crate) fn mark_initialized(&self) -> bool {
        self.state
            .compare_exchange(
                LifecycleState::Uninitialized.as_u8(),
                LifecycleState::Initialized.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to Disposed, returning the state it replaced
    ///
    /// Exactly one caller ever observes a non-Disposed previous state.
    pub(crate) fn mark_disposed(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.swap(LifecycleState::Disposed.as_u8(), Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_gates() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
        assert_eq!(lifecycle.ensure_alive(), Ok(LifecycleState::Uninitialized));
        assert_eq!(lifecycle.ensure_initialized(), Err(BridgeError::NotInitialized));
    }

    #[test]
    fn test_initialize_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.mark_initialized());
        assert!(!lifecycle.mark_initialized());
        assert_eq!(lifecycle.ensure_initialized(), Ok(()));
    }

    #[test]
    fn test_disposed_is_absorbing() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.mark_initialized());
        assert_eq!(lifecycle.mark_disposed(), LifecycleState::Initialized);
        assert_eq!(lifecycle.mark_disposed(), LifecycleState::Disposed);
        assert!(!lifecycle.mark_initialized());
        assert_eq!(lifecycle.ensure_alive(), Err(BridgeError::Disposed));
        assert_eq!(lifecycle.ensure_initialized(), Err(BridgeError::Disposed));
    }

    #[test]
    fn test_dispose_from_uninitialized() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.mark_disposed(), LifecycleState::Uninitialized);
        assert_eq!(lifecycle.state(), LifecycleState::Disposed);
    }
}
