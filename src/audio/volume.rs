use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use crate::audio::constants::MAX_VOLUME;

/// Player volume shared between the control side and the transcoder task.
///
/// Stored as a percentage in `0..=100`; the gain applied to samples is
/// `volume / 100`.
#[derive(Debug, Clone)]
pub struct VolumeHandle(Arc<AtomicU8>);

impl Default for VolumeHandle {
    fn default() -> Self {
        Self::new(MAX_VOLUME as u16)
    }
}

impl VolumeHandle {
    pub fn new(volume: u16) -> Self {
        Self(Arc::new(AtomicU8::new(clamp(volume))))
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    /// Stores the clamped volume and returns the value actually applied.
    pub fn set(&self, volume: u16) -> u8 {
        let volume = clamp(volume);
        self.0.store(volume, Ordering::Relaxed);
        volume
    }

    /// Scales interleaved samples in place. A no-op at full volume.
    pub fn apply(&self, samples: &mut [i16]) {
        let volume = self.get();
        if volume == MAX_VOLUME {
            return;
        }
        let gain = volume as f32 / MAX_VOLUME as f32;
        for sample in samples.iter_mut() {
            let s = (*sample as f32 * gain) as i32;
            *sample = s.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }
}

fn clamp(volume: u16) -> u8 {
    volume.min(MAX_VOLUME as u16) as u8
}
