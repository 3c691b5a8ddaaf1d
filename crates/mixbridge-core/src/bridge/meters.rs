//! Latest meter level per channel
//!
//! Written by the callback relay on the real-time thread, read by consumers
//! polling `channel_meter`. Levels are stored as f32 bit patterns in relaxed
//! atomics; peak and RMS of one channel may come from adjacent updates.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::{ChannelIndex, MeterLevel};

/// Lock-free peak/RMS pair for one channel
#[derive(Debug)]
struct ChannelMeter {
    peak: AtomicU32,
    rms: AtomicU32,
}

impl ChannelMeter {
    fn new() -> Self {
        Self {
            peak: AtomicU32::new(0f32.to_bits()),
            rms: AtomicU32::new(0f32.to_bits()),
        }
    }
}

/// Fixed-size bank of channel meters, replaced whenever ports are recreated
#[derive(Debug)]
pub(crate) struct MeterBank {
    channels: Vec<ChannelMeter>,
}

impl MeterBank {
    pub(crate) fn new(channel_count: usize) -> Self {
        Self {
            channels: (0..channel_count).map(|_| ChannelMeter::new()).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }

    /// Store a new reading; out-of-range channels are ignored
    #[inline]
    pub(crate) fn store(&self, channel: ChannelIndex, level: MeterLevel) -> bool {
        match self.channels.get(channel) {
            Some(meter) => {
                meter.peak.store(level.peak.to_bits(), Ordering::Relaxed);
                meter.rms.store(level.rms.to_bits(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub(crate) fn load(&self, channel: ChannelIndex) -> Option<MeterLevel> {
        self.channels.get(channel).map(|meter| MeterLevel {
            peak: f32::from_bits(meter.peak.load(Ordering::Relaxed)),
            rms: f32::from_bits(meter.rms.load(Ordering::Relaxed)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_load() {
        let bank = MeterBank::new(2);
        assert_eq!(bank.load(1), Some(MeterLevel::SILENT));
        assert!(bank.store(1, MeterLevel::new(0.8, 0.4)));
        assert_eq!(bank.load(1), Some(MeterLevel::new(0.8, 0.4)));
        assert_eq!(bank.load(0), Some(MeterLevel::SILENT));
    }

    #[test]
    fn test_out_of_range_ignored() {
        let bank = MeterBank::new(1);
        assert!(!bank.store(3, MeterLevel::new(1.0, 1.0)));
        assert_eq!(bank.load(3), None);
        assert_eq!(bank.len(), 1);
    }
}
