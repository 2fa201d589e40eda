//! Installation state and lifecycle
//!
//! All mutable mixer state lives in one [`MixerState`] behind the mixer
//! lock. The lock doubles as the service barrier: control operations hold
//! it across their critical sections, and the driver-invoked service
//! renders a page under the same lock, so the two never interleave.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard};

use pv_core::{
    Fx16, Handle, MAX_VOICES, MIN_HANDLE, MIX_BUFFER_SAMPLES, MixerError, MixerResult,
    PanTable, TOTAL_BUFFER_SIZE,
};
use pv_driver::{DriverConfig, PcmDriver};

use crate::arena::{ACTIVE_HEAD, HandleTable, VoiceArena};
use crate::service::MixService;

/// Per-handle play state mirrored outside the lock, release-stored by
/// whoever mutates it under the lock.
pub(crate) const SLOT_FREE: u8 = 0;
pub(crate) const SLOT_PLAYING: u8 = 1;
pub(crate) const SLOT_PAUSED: u8 = 2;

/// Fills the music scratch page with interleaved signed 16-bit samples.
pub type MusicFn = Box<dyn FnMut(&mut [i16]) + Send>;

/// Invoked with a voice's callback token when it ends or is killed.
pub type VoiceDoneFn = Box<dyn FnMut(u64) + Send>;

/// Requested mixer configuration; the driver may adjust rate and channels.
#[derive(Debug, Clone, Copy)]
pub struct MixerConfig {
    pub mix_rate: u32,
    pub max_voices: usize,
    pub channels: u16,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self { mix_rate: 44100, max_voices: 32, channels: 2 }
    }
}

pub(crate) struct Shared {
    pub state: Mutex<MixerState>,
    pub slots: Arc<[AtomicU8]>,
    pub installed: AtomicBool,
}

pub(crate) struct MixerState {
    pub channels: u16,
    pub mix_rate: u32,
    /// FX pages in the ring; always a power of two.
    pub num_pages: usize,
    /// Interleaved i16 values per page.
    pub page_samples: usize,
    pub mix_page: usize,

    /// `2 * num_pages` contiguous pages: FX half, then music half.
    pub ring: Vec<i16>,
    pub page_empty: Vec<bool>,
    pub music_scratch: Vec<i16>,

    pub arena: VoiceArena,
    pub handles: HandleTable,
    pub slots: Arc<[AtomicU8]>,

    pub pan_table: PanTable,
    pub global_volume: Fx16,
    pub smooth_factor: Fx16,
    pub reverse_stereo: bool,

    pub reverb_level: i32,
    pub reverb_volume: Fx16,
    /// Distance behind the mix cursor, in i16 units within the FX half.
    pub reverb_delay: usize,

    pub music_callback: Option<MusicFn>,
    pub voice_done: Option<VoiceDoneFn>,
}

impl MixerState {
    fn new(
        mix_rate: u32,
        channels: u16,
        max_voices: usize,
        slots: Arc<[AtomicU8]>,
    ) -> Self {
        let page_samples = MIX_BUFFER_SAMPLES * channels as usize;
        let num_pages = TOTAL_BUFFER_SIZE / (page_samples * 2);
        debug_assert!(num_pages.is_power_of_two());

        // Reaches 90% of a gain step in ~30 ms of output.
        let smooth_factor = Fx16::from_f32(1.0 - 0.1f32.powf(30.0 / mix_rate as f32));

        Self {
            channels,
            mix_rate,
            num_pages,
            page_samples,
            mix_page: 0,
            ring: vec![0; 2 * num_pages * page_samples],
            page_empty: vec![true; num_pages],
            music_scratch: vec![0; page_samples],
            arena: VoiceArena::new(max_voices),
            handles: HandleTable::new(max_voices),
            slots,
            pan_table: PanTable::build(),
            global_volume: Fx16::ONE,
            smooth_factor,
            reverse_stereo: false,
            reverb_level: 0,
            reverb_volume: Fx16::ZERO,
            reverb_delay: 3 * page_samples,
            music_callback: None,
            voice_done: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn test_instance(mix_rate: u32, channels: u16, max_voices: usize) -> Self {
        let slots = (0..max_voices).map(|_| AtomicU8::new(SLOT_FREE)).collect();
        Self::new(mix_rate, channels, max_voices, slots)
    }

    /// Map a handle to its arena index.
    pub fn resolve(&self, handle: Handle) -> MixerResult<u32> {
        if handle < MIN_HANDLE || handle > self.handles.capacity() as Handle {
            log::warn!("no voice found for handle {handle:#010x}");
            return Err(MixerError::VoiceNotFound);
        }
        self.handles.get(handle).ok_or(MixerError::VoiceNotFound)
    }
}

/// A running mixer installation.
///
/// Created by [`Mixer::init`], torn down by [`Mixer::shutdown`] or drop.
/// Control methods are callable from any thread.
pub struct Mixer {
    pub(crate) shared: Arc<Shared>,
    driver: Mutex<Option<Box<dyn PcmDriver>>>,
}

impl Mixer {
    /// Open the driver, lay out the mix buffer ring, and start playback.
    ///
    /// The driver may adjust the requested rate and channel count; the
    /// mixer adopts whatever it returns. Any failure tears down partial
    /// state before propagating.
    pub fn init(mut driver: Box<dyn PcmDriver>, config: MixerConfig) -> MixerResult<Self> {
        let max_voices = config.max_voices.clamp(1, MAX_VOICES);

        let mut requested = DriverConfig {
            mix_rate: config.mix_rate.max(1),
            channels: config.channels.clamp(1, 2),
        };
        driver
            .init(&mut requested)
            .map_err(|e| MixerError::Driver(e.to_string()))?;

        let mix_rate = requested.mix_rate.max(1);
        let channels = requested.channels.clamp(1, 2);

        let slots: Arc<[AtomicU8]> =
            (0..max_voices).map(|_| AtomicU8::new(SLOT_FREE)).collect();

        let state = MixerState::new(mix_rate, channels, max_voices, Arc::clone(&slots));
        let page_samples = state.page_samples;

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            slots,
            installed: AtomicBool::new(true),
        });

        let service = MixService::new(Arc::clone(&shared), page_samples, channels);
        if let Err(e) = driver.begin_playback(Box::new(service)) {
            shared.installed.store(false, Ordering::Release);
            driver.shutdown();
            return Err(MixerError::Driver(e.to_string()));
        }

        Ok(Self { shared, driver: Mutex::new(Some(driver)) })
    }

    /// Drain and stop: kill every voice, stop the driver (which returns
    /// only once pending service calls have finished), and close it.
    pub fn shutdown(&self) {
        let Some(mut driver) = self.driver.lock().take() else {
            return;
        };

        let _ = self.kill_all_voices(true);
        self.shared.installed.store(false, Ordering::Release);
        driver.stop_playback();

        // Nothing services the ring anymore; stop whatever remains (the
        // music voice survives kill_all_voices).
        {
            let mut state = self.shared.state.lock();
            loop {
                let index = state.arena.first_active();
                if index == ACTIVE_HEAD {
                    break;
                }
                state.finish_voice(index, true);
            }
        }

        driver.shutdown();
    }

    /// Lock the mixer state, failing once the mixer is shut down.
    pub(crate) fn state(&self) -> MixerResult<MutexGuard<'_, MixerState>> {
        if !self.shared.installed.load(Ordering::Acquire) {
            return Err(MixerError::NotInstalled);
        }
        Ok(self.shared.state.lock())
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
