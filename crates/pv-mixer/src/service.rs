//! The per-page service routine
//!
//! The driver clocks this exactly once per output page. Each tick rotates
//! the mix page, clears it or folds in reverb, composites every active
//! non-music voice in priority order, copies the result into the matching
//! music page, sums the music callback's output on top, and mixes the
//! music voice last at unity global volume.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use pv_core::{Fx16, MIN_HANDLE, MIX_BUFFER_SAMPLES, MUSIC_PRIORITY};
use pv_driver::PcmService;

use crate::arena::ACTIVE_HEAD;
use crate::engine::{MixerState, SLOT_FREE, Shared};
use crate::kernels::KernelParams;
use crate::source::{BlockState, Playback, TaskState};
use crate::voice::VoiceNode;

/// The mixer's side of the driver contract: renders one page per call,
/// under the mixer lock, and copies out the freshly mixed music-half page.
pub(crate) struct MixService {
    shared: Arc<Shared>,
    page_samples: usize,
    channels: u16,
}

impl MixService {
    pub fn new(shared: Arc<Shared>, page_samples: usize, channels: u16) -> Self {
        Self { shared, page_samples, channels }
    }
}

impl PcmService for MixService {
    fn render_next(&mut self, out: &mut [i16]) {
        let mut state = self.shared.state.lock();
        state.service();

        let base = (state.mix_page + state.num_pages) * state.page_samples;
        let count = out.len().min(state.page_samples);
        out[..count].copy_from_slice(&state.ring[base..base + count]);
    }

    fn page_samples(&self) -> usize {
        self.page_samples
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

impl MixerState {
    /// Mix one page. Runs only under the mixer lock and never blocks.
    pub(crate) fn service(&mut self) {
        self.mix_page = (self.mix_page + 1) & (self.num_pages - 1);

        if self.reverb_level == 0 {
            if !self.page_empty[self.mix_page] {
                let base = self.mix_page * self.page_samples;
                self.ring[base..base + self.page_samples].fill(0);
                self.page_empty[self.mix_page] = true;
            }
        } else {
            self.apply_reverb();
        }

        let mut music_voice = None;
        let mut index = self.arena.first_active();
        while index != ACTIVE_HEAD {
            let voice = self.arena.node(index);
            let next = voice.next;

            if voice.paused {
                index = next;
                continue;
            }
            if voice.priority == MUSIC_PRIORITY {
                music_voice = Some(index);
                index = next;
                continue;
            }

            self.page_empty[self.mix_page] = false;
            if !self.mix_voice(index, self.mix_page, false) {
                self.finish_voice(index, true);
            }
            index = next;
        }

        // The music half starts from a copy of the effects page.
        let page_samples = self.page_samples;
        let fx_base = self.mix_page * page_samples;
        let music_base = (self.mix_page + self.num_pages) * page_samples;
        self.ring
            .copy_within(fx_base..fx_base + page_samples, music_base);

        if let Some(mut callback) = self.music_callback.take() {
            callback(&mut self.music_scratch);
            self.music_callback = Some(callback);

            let MixerState { ring, music_scratch, .. } = self;
            let dest = &mut ring[music_base..music_base + page_samples];
            for (out, &add) in dest.iter_mut().zip(music_scratch.iter()) {
                *out = (*out as i32 + add as i32)
                    .clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
        }

        if let Some(index) = music_voice {
            if !self.mix_voice(index, self.mix_page + self.num_pages, true) {
                self.finish_voice(index, true);
            }
        }
    }

    /// Composite one voice into `page`, pulling blocks as needed.
    /// Returns false once the source reports no more data.
    pub(crate) fn mix_voice(&mut self, index: u32, page: usize, music: bool) -> bool {
        let page_samples = self.page_samples;
        let out_channels = self.channels as usize;
        let smooth = self.smooth_factor;
        // The music channel is never ducked by the global gain.
        let global = if music { Fx16::ONE } else { self.global_volume };

        let MixerState { ring, arena, .. } = self;
        let voice = arena.node_mut(index);

        if let Some(task) = voice.task.as_mut() {
            match task.poll() {
                TaskState::Pending => return true,
                TaskState::Done(Ok(())) => voice.task = None,
                TaskState::Done(Err(e)) => {
                    log::error!("error playing sound {:#x}: {e}", voice.callback_val);
                    return false;
                }
            }
        }

        if voice.block.length == 0 && voice.get_sound() != Playback::KeepPlaying {
            return false;
        }

        let volume = voice.volume.smul(global);
        let rate = voice.rate_scale as u64;
        let mut bufsiz = voice.fixed_point_buffer_size as u64;
        let mut length = MIX_BUFFER_SAMPLES as u64;
        let page_base = page * page_samples;

        loop {
            let in_channels = voice.channels as u64;
            let position = voice.block.position as u64;
            let block_len = voice.block.length as u64;
            let mut mixlen = length;

            // Would the last output sample of this run read past the block?
            if position + bufsiz >= block_len {
                if position >= block_len.saturating_sub(in_channels) {
                    if voice.get_sound() != Playback::KeepPlaying {
                        return false;
                    }
                    break;
                }
                mixlen = ((block_len - position + rate - in_channels) / rate).min(length);
            }

            let done = (MIX_BUFFER_SAMPLES as u64 - length) as usize;
            let new_position = {
                let VoiceNode { source, block, goal, panned, mix, .. } = &mut *voice;
                let Some(source) = source.as_ref() else {
                    return false;
                };
                (*mix)(KernelParams {
                    src: source.bytes(),
                    dst: &mut ring[page_base + done * out_channels..page_base + page_samples],
                    count: mixlen as u32,
                    position: block.position,
                    rate: rate as u32,
                    volume,
                    goal: *goal,
                    panned,
                    smooth,
                })
            };

            voice.block.position = new_position;
            length -= mixlen;

            if (voice.block.position as u64)
                >= (voice.block.length as u64).saturating_sub(voice.channels as u64)
            {
                // Block exhausted; pull the next one.
                if voice.get_sound() != Playback::KeepPlaying {
                    return false;
                }
                if length > (voice.channels as u64 - 1) {
                    bufsiz = rate * (length - voice.channels as u64);
                }
            }

            if length == 0 {
                break;
            }
        }

        true
    }

    /// End a voice: run the completion callback, release decoder state,
    /// free the handle, and return the record to the pool.
    pub(crate) fn finish_voice(&mut self, index: u32, use_callback: bool) {
        let token = self.arena.node(index).callback_val;
        if use_callback {
            if let Some(mut callback) = self.voice_done.take() {
                callback(token);
                self.voice_done = Some(callback);
            }
        }

        let voice = self.arena.node_mut(index);
        voice.source = None;
        voice.task = None;
        voice.block = BlockState::default();
        voice.sampling_rate = 0;

        let handle = voice.handle;
        voice.handle = 0;
        if handle >= MIN_HANDLE {
            self.handles.release(handle);
            self.slots[(handle - MIN_HANDLE) as usize].store(SLOT_FREE, Ordering::Release);
        }

        self.arena.move_to_pool(index);
    }
}
