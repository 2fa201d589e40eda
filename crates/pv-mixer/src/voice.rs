//! Voice records
//!
//! One [`VoiceNode`] per playable sound, stored in a fixed arena and
//! linked into either the active list or the pool. List links are arena
//! indices; the arena itself lives in `arena.rs`.

use pv_core::{Fx16, Handle, MIX_BUFFER_SAMPLES, pitch_scale};

use crate::kernels::{MixKernel, kernel_for_mode, mix_mode};
use crate::source::{BlockState, Playback, PrefetchTask, SampleSource};

/// Per-channel Q16 gain pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StereoGain {
    pub left: Fx16,
    pub right: Fx16,
}

pub(crate) struct VoiceNode {
    /// Handle table slot + [`pv_core::MIN_HANDLE`]; zero while pooled.
    pub handle: Handle,
    pub priority: i32,
    pub paused: bool,

    pub bits: u8,
    pub channels: u8,
    pub sampling_rate: u32,
    pub pitch_scale: Fx16,
    /// Q16.16 cursor increment per output sample.
    pub rate_scale: u32,
    /// Cursor distance covered by one output page.
    pub fixed_point_buffer_size: u32,

    pub block: BlockState,
    pub volume: Fx16,
    pub goal: StereoGain,
    pub panned: StereoGain,
    pub mix: MixKernel,

    pub source: Option<Box<dyn SampleSource>>,
    pub task: Option<PrefetchTask>,
    pub callback_val: u64,

    pub prev: u32,
    pub next: u32,
}

impl VoiceNode {
    pub fn empty() -> Self {
        Self {
            handle: 0,
            priority: 0,
            paused: false,
            bits: 8,
            channels: 1,
            sampling_rate: 0,
            pitch_scale: Fx16::ONE,
            rate_scale: 0,
            fixed_point_buffer_size: 0,
            block: BlockState::default(),
            volume: Fx16::ONE,
            goal: StereoGain::default(),
            panned: StereoGain::default(),
            mix: kernel_for_mode(0),
            source: None,
            task: None,
            callback_val: 0,
            prev: 0,
            next: 0,
        }
    }

    /// Pull the next block from the source, if any.
    pub fn get_sound(&mut self) -> Playback {
        let Self { source, block, .. } = self;
        match source.as_mut() {
            Some(source) => source.refill(block),
            None => Playback::NoMoreData,
        }
    }

    /// Derive the cursor increment from a source rate, a pitch offset in
    /// hundredths of a semitone, and the output rate.
    pub fn set_pitch(&mut self, rate: u32, pitch_offset: i32, mix_rate: u32) {
        self.sampling_rate = rate;
        self.pitch_scale = pitch_scale(pitch_offset);
        // An active voice always advances its cursor.
        self.rate_scale =
            (((rate as u64 * self.pitch_scale.0 as u64) / mix_rate as u64) as u32).max(1);
        self.fixed_point_buffer_size =
            self.rate_scale * (MIX_BUFFER_SAMPLES as u32 - 1);
    }

    /// Pick the mix kernel for this voice's format and the output layout.
    pub fn select_kernel(&mut self, out_channels: u16) {
        self.mix = kernel_for_mode(mix_mode(out_channels, self.bits, self.channels));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_scale_tracks_rates() {
        let mut voice = VoiceNode::empty();

        voice.set_pitch(44100, 0, 44100);
        assert_eq!(voice.rate_scale, 1 << 16);
        assert_eq!(
            voice.fixed_point_buffer_size,
            (1 << 16) * (MIX_BUFFER_SAMPLES as u32 - 1)
        );

        voice.set_pitch(22050, 0, 44100);
        assert_eq!(voice.rate_scale, 1 << 15);

        // One octave up doubles the increment.
        voice.set_pitch(22050, 1200, 44100);
        assert!((voice.rate_scale as i64 - (1 << 16)).abs() <= 4);
    }

    #[test]
    fn test_no_source_reports_end() {
        let mut voice = VoiceNode::empty();
        assert_eq!(voice.get_sound(), Playback::NoMoreData);
    }
}
