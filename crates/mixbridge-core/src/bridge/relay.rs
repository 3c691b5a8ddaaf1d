//! Callback relay: real-time thread → consumer notification queues
//!
//! The audio server invokes status and meter callbacks on a thread it owns,
//! possibly the real-time audio thread. The relay turns each invocation into
//! a `try_send` on every subscriber's bounded `flume` channel.
//!
//! # Real-Time Path
//!
//! ```text
//! ┌──────────────────┐  upgrade Weak   ┌──────────────┐  try_send   ┌──────────────┐
//! │ Server RT thread │────────────────►│ CallbackRelay│────────────►│ Subscriber   │
//! │ (meter callback) │  gate + count   │ (SharedCell) │  (drop if   │ queues       │
//! └──────────────────┘                 └──────────────┘   full)     └──────────────┘
//! ```
//!
//! - No locks: listener lists and the meter bank are read through
//!   `basedrop::SharedCell` and replaced copy-on-write by consumer threads.
//! - No blocking: full queues drop the sample and count it.
//! - No unwinding into the server: each invocation runs under `catch_unwind`.
//!
//! # Gate
//!
//! Every invocation registers itself in `in_flight` before reading the gate
//! (both `SeqCst`). Closing the gate clears the bit and then waits for
//! `in_flight` to drain, so once `close_meters`/`shutdown` return no
//! listener can receive another event of the closed kind.
//!
//! # Disconnect
//!
//! Each subscriber's sender lives in one [`ListenerSlot`] shared by every
//! version of the listener list, including versions still waiting in the
//! collector. `shutdown` empties the slots on the calling thread, so every
//! subscriber sees `Disconnected` as soon as it returns.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;

use basedrop::{Handle, Shared, SharedCell};
use flume::{Receiver, Sender, TrySendError};

use super::meters::MeterBank;
use crate::gc::gc_handle;
use crate::types::{ChannelIndex, MeterLevel, MeterSample, StatusChange};

const STATUS_OPEN: u8 = 0b01;
const METERS_OPEN: u8 = 0b10;

/// Spins before falling back to yielding while waiting for quiescence
const SPIN_LIMIT: u32 = 64;

/// Counters describing what the relay delivered and dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    /// Meter samples placed in a subscriber queue
    pub delivered_meters: u64,
    /// Meter samples lost to full queues
    pub dropped_meters: u64,
    /// Status changes lost to full queues
    pub dropped_status: u64,
    /// Panics caught inside relay invocations
    pub contained_panics: u64,
}

pub(crate) struct CallbackRelay {
    gate: AtomicU8,
    in_flight: AtomicUsize,
    status_listeners: SharedCell<Listeners<StatusChange>>,
    meter_listeners: SharedCell<Listeners<MeterSample>>,
    meters: SharedCell<MeterBank>,
    /// Serializes copy-on-write updates from consumer threads
    writer: Mutex<()>,
    gc: Handle,
    status_capacity: usize,
    meter_capacity: usize,
    delivered_meters: AtomicU64,
    dropped_meters: AtomicU64,
    dropped_status: AtomicU64,
    contained_panics: AtomicU64,
}

impl CallbackRelay {
    pub(crate) fn new(status_capacity: usize, meter_capacity: usize) -> Arc<Self> {
        let gc = gc_handle();
        Arc::new(Self {
            gate: AtomicU8::new(STATUS_OPEN),
            in_flight: AtomicUsize::new(0),
            status_listeners: SharedCell::new(Shared::new(&gc, Vec::new())),
            meter_listeners: SharedCell::new(Shared::new(&gc, Vec::new())),
            meters: SharedCell::new(Shared::new(&gc, MeterBank::new(0))),
            writer: Mutex::new(()),
            status_capacity: status_capacity.max(1),
            meter_capacity: meter_capacity.max(1),
            gc,
            delivered_meters: AtomicU64::new(0),
            dropped_meters: AtomicU64::new(0),
            dropped_status: AtomicU64::new(0),
            contained_panics: AtomicU64::new(0),
        })
    }

    /// Liveness-checked token handed to the native callbacks
    pub(crate) fn token(self: &Arc<Self>) -> RelayToken {
        RelayToken {
            relay: Arc::downgrade(self),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Consumer side
    // ─────────────────────────────────────────────────────────────

    pub(crate) fn subscribe_status(&self) -> Receiver<StatusChange> {
        let (tx, rx) = flume::bounded(self.status_capacity);
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let listeners = append_listener(&self.status_listeners.get(), &self.gc, tx);
        self.status_listeners.set(Shared::new(&self.gc, listeners));
        rx
    }

    pub(crate) fn subscribe_meters(&self) -> Receiver<MeterSample> {
        let (tx, rx) = flume::bounded(self.meter_capacity);
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let listeners = append_listener(&self.meter_listeners.get(), &self.gc, tx);
        self.meter_listeners.set(Shared::new(&self.gc, listeners));
        rx
    }

    /// Replace the meter bank after ports were (re)created
    pub(crate) fn reset_meters(&self, channel_count: usize) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.meters.set(Shared::new(&self.gc, MeterBank::new(channel_count)));
    }

    pub(crate) fn channel_meter(&self, channel: ChannelIndex) -> Option<MeterLevel> {
        self.meters.get().load(channel)
    }

    pub(crate) fn open_meters(&self) {
        self.gate.fetch_or(METERS_OPEN, Ordering::SeqCst);
    }

    /// Stop meter delivery and wait until no invocation is still delivering
    pub(crate) fn close_meters(&self) {
        self.gate.fetch_and(!METERS_OPEN, Ordering::SeqCst);
        self.wait_quiescent();
    }

    /// Close the relay for good and disconnect every subscriber
    pub(crate) fn shutdown(&self) {
        self.gate.store(0, Ordering::SeqCst);
        self.wait_quiescent();

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let status = self.status_listeners.replace(Shared::new(&self.gc, Vec::new()));
        for slot in status.iter() {
            slot.disconnect(&self.gc);
        }
        let meters = self.meter_listeners.replace(Shared::new(&self.gc, Vec::new()));
        for slot in meters.iter() {
            slot.disconnect(&self.gc);
        }
    }

    pub(crate) fn stats(&self) -> RelayStats {
        RelayStats {
            delivered_meters: self.delivered_meters.load(Ordering::Relaxed),
            dropped_meters: self.dropped_meters.load(Ordering::Relaxed),
            dropped_status: self.dropped_status.load(Ordering::Relaxed),
            contained_panics: self.contained_panics.load(Ordering::Relaxed),
        }
    }

    fn wait_quiescent(&self) {
        let mut spins = 0u32;
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Real-time side
    // ─────────────────────────────────────────────────────────────

    #[inline]
    fn enter(&self, kind: u8) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.gate.load(Ordering::SeqCst) & kind == 0 {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    #[inline]
    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn relay_status(&self, is_running: bool) {
        if !self.enter(STATUS_OPEN) {
            return;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let event = StatusChange { is_running };
            for slot in self.status_listeners.get().iter() {
                if let Err(TrySendError::Full(_)) = slot.try_send(event) {
                    self.dropped_status.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
        if outcome.is_err() {
            self.contained_panics.fetch_add(1, Ordering::Relaxed);
        }
        self.exit();
    }

    fn relay_meter(&self, channel: ChannelIndex, level: MeterLevel) {
        if !self.enter(METERS_OPEN) {
            return;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            // Strips outside the bridge's channel range are not published
            if !self.meters.get().store(channel, level) {
                return;
            }
            let sample = MeterSample {
                channel,
                peak: level.peak,
                rms: level.rms,
            };
            for slot in self.meter_listeners.get().iter() {
                match slot.try_send(sample) {
                    Ok(()) => {
                        self.delivered_meters.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        self.dropped_meters.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }));
        if outcome.is_err() {
            self.contained_panics.fetch_add(1, Ordering::Relaxed);
        }
        self.exit();
    }
}

type Listeners<T> = Vec<Arc<ListenerSlot<T>>>;

/// One subscriber's sender
///
/// The relay holds the only `Sender`; list versions share the slot through
/// `Arc`, so emptying the slot disconnects the subscriber no matter how many
/// retired lists still reference it.
struct ListenerSlot<T: Send + 'static> {
    tx: SharedCell<Option<Sender<T>>>,
}

impl<T: Send + 'static> ListenerSlot<T> {
    fn new(gc: &Handle, tx: Sender<T>) -> Arc<Self> {
        Arc::new(Self {
            tx: SharedCell::new(Shared::new(gc, Some(tx))),
        })
    }

    #[inline]
    fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let current = self.tx.get();
        match &*current {
            Some(tx) => tx.try_send(value),
            None => Err(TrySendError::Disconnected(value)),
        }
    }

    fn is_disconnected(&self) -> bool {
        let current = self.tx.get();
        match &*current {
            Some(tx) => tx.is_disconnected(),
            None => true,
        }
    }

    /// Drop the sender on the calling thread
    ///
    /// Only called once no real-time invocation can still be reading the slot.
    fn disconnect(&self, gc: &Handle) {
        let mut retired = self.tx.replace(Shared::new(gc, None));
        match Shared::get_mut(&mut retired) {
            Some(tx) => drop(tx.take()),
            None => log::warn!("Subscriber slot still in use at shutdown, disconnect deferred"),
        }
    }
}

/// Copy the live listeners, prune closed ones and append a slot for `tx`
fn append_listener<T: Send + 'static>(
    current: &[Arc<ListenerSlot<T>>],
    gc: &Handle,
    tx: Sender<T>,
) -> Listeners<T> {
    let mut listeners: Listeners<T> = current
        .iter()
        .filter(|slot| !slot.is_disconnected())
        .cloned()
        .collect();
    listeners.push(ListenerSlot::new(gc, tx));
    listeners
}

/// Opaque context captured by the native callbacks
///
/// Holds only a weak reference: a callback that outlives the bridge finds
/// nothing to upgrade and returns without touching freed state.
#[derive(Clone)]
pub(crate) struct RelayToken {
    relay: Weak<CallbackRelay>,
}

impl RelayToken {
    pub(crate) fn server_status_changed(&self, is_running: bool) {
        if let Some(relay) = self.relay.upgrade() {
            relay.relay_status(is_running);
        }
    }

    pub(crate) fn meter_updated(&self, channel: ChannelIndex, level: MeterLevel) {
        if let Some(relay) = self.relay.upgrade() {
            relay.relay_meter(channel, level);
        }
    }
}
