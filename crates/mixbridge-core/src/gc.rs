//! RT-safe deferred deallocation for data read by the real-time thread
//!
//! Listener lists and meter banks are swapped from consumer threads while the
//! server's real-time thread may still hold the previous version. They live in
//! `basedrop::Shared` so that whichever thread drops the last reference only
//! enqueues the pointer; the free happens on the collector thread below.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Interval between collection passes
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    let spawned = thread::Builder::new()
        .name("mixbridge-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it is created on the thread that owns it
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }

            log::debug!("Bridge GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        });

    match spawned.map(|_| rx.recv()) {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => fallback_handle(&e.to_string()),
        Err(e) => fallback_handle(&e.to_string()),
    }
}

/// Handle to a collector that is never drained
///
/// Only used when the GC thread cannot be started; retired values then leak
/// instead of being freed on the real-time thread.
fn fallback_handle(reason: &str) -> Handle {
    log::error!("Failed to start bridge GC thread ({}), deferred drops will leak", reason);
    let collector: &'static mut Collector = Box::leak(Box::new(Collector::new()));
    collector.handle()
}

/// Handle for creating `basedrop::Shared` values
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::{Shared, SharedCell};

    #[test]
    fn test_shared_cell_swap_keeps_old_reader_valid() {
        let handle = gc_handle();
        let cell = SharedCell::new(Shared::new(&handle, vec![1, 2, 3]));

        let reader = cell.get();
        cell.set(Shared::new(&handle, vec![4]));

        assert_eq!(*reader, vec![1, 2, 3]);
        assert_eq!(*cell.get(), vec![4]);
    }
}
