//! Handle-addressed control operations
//!
//! Every operation resolves its handle and runs under the mixer lock;
//! nothing here ever runs concurrently with the service routine. An
//! operation that finds an in-flight prefetch task on its voice waits for
//! the task *before* taking the lock, so the wait never stalls the driver.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use pv_core::{
    Fx16, Handle, MAX_TOTAL_VOLUME, MIN_HANDLE, MixerError, MixerResult, PanTable,
};

use crate::arena::ACTIVE_HEAD;
use crate::engine::{Mixer, MixerState, MusicFn, SLOT_PAUSED, SLOT_PLAYING, VoiceDoneFn};
use crate::source::{
    BlockState, DemandFeedFn, DemandFeedSource, LoopRegion, RawSource, SampleSource,
};
use crate::voice::{StereoGain, VoiceNode};

/// Where a voice sits in the stereo field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanPosition {
    /// Explicit overall/left/right levels, each 0..=255.
    Levels { vol: i32, left: i32, right: i32 },
    /// An angle/distance pair resolved through the pan table. Negative
    /// distances flip the angle by half a turn.
    Position { angle: i32, distance: i32 },
}

/// Everything needed to start a voice.
#[derive(Debug, Clone, Copy)]
pub struct VoiceParams {
    pub bits: u8,
    pub channels: u8,
    /// Source rate in Hz.
    pub rate: u32,
    /// Hundredths of a semitone added to the source pitch.
    pub pitch_offset: i32,
    pub priority: i32,
    /// Overall Q16 gain applied on top of the panned levels.
    pub volume: Fx16,
    pub pan: PanPosition,
    /// Opaque token passed to the completion callback.
    pub callback_val: u64,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            bits: 16,
            channels: 1,
            rate: 44100,
            pitch_offset: 0,
            priority: 0,
            volume: Fx16::ONE,
            pan: PanPosition::Levels { vol: 255, left: 255, right: 255 },
            callback_val: 0,
        }
    }
}

impl Mixer {
    /// Resolve `handle` and run `op` under the mixer lock, waiting out any
    /// in-flight prefetch task first.
    fn with_voice<R>(
        &self,
        handle: Handle,
        op: impl FnOnce(&mut MixerState, u32) -> MixerResult<R>,
    ) -> MixerResult<R> {
        loop {
            let mut state = self.state()?;
            let index = state.resolve(handle)?;

            let pending = if let Some(task) = state.arena.node_mut(index).task.as_mut() {
                if task.is_pending() { Some(task.receiver()) } else { None }
            } else {
                None
            };

            let Some(receiver) = pending else {
                return op(&mut state, index);
            };

            // Wait unlocked; the block is bounded by the decoder finishing
            // its one outstanding block.
            drop(state);
            let result = receiver.recv().unwrap_or(Err(MixerError::InvalidFile));

            let mut state = self.state()?;
            if let Ok(index) = state.resolve(handle) {
                if let Some(task) = state.arena.node_mut(index).task.as_mut() {
                    task.complete(result);
                }
            }
        }
    }

    /// Start a voice over any [`SampleSource`]; streaming decoders plug in
    /// here. Returns the new voice's handle.
    pub fn play_source(
        &self,
        mut source: Box<dyn SampleSource>,
        params: &VoiceParams,
    ) -> MixerResult<Handle> {
        if !matches!(params.bits, 8 | 16)
            || !matches!(params.channels, 1 | 2)
            || params.rate == 0
        {
            return Err(MixerError::InvalidFile);
        }

        let mut state = self.state()?;
        let index = state
            .alloc_voice(params.priority)
            .ok_or(MixerError::NoVoices)?;
        let (vol, left, right) = resolve_pan(&state.pan_table, &params.pan);
        let mix_rate = state.mix_rate;
        let task = source.prefetch();

        let voice = state.arena.node_mut(index);
        voice.priority = params.priority;
        voice.bits = params.bits;
        voice.channels = params.channels;
        voice.callback_val = params.callback_val;
        voice.block = BlockState::default();
        voice.task = task;
        voice.source = Some(source);
        voice.set_pitch(params.rate, params.pitch_offset, mix_rate);
        let handle = voice.handle;

        state.set_voice_volume(index, vol, left, right, params.volume);
        state.play_voice(index);
        Ok(handle)
    }

    /// Start a voice over caller-provided PCM bytes.
    pub fn play_raw(&self, data: Arc<[u8]>, params: &VoiceParams) -> MixerResult<Handle> {
        let source = RawSource::new(data, params.bits, params.channels, None)?;
        self.play_source(Box::new(source), params)
    }

    /// Start a raw voice that rewinds into `region` on exhaustion.
    pub fn play_raw_looped(
        &self,
        data: Arc<[u8]>,
        params: &VoiceParams,
        region: LoopRegion,
    ) -> MixerResult<Handle> {
        let source = RawSource::new(data, params.bits, params.channels, Some(region))?;
        self.play_source(Box::new(source), params)
    }

    /// Start a voice fed by a client block producer.
    pub fn play_demand_feed(
        &self,
        feed: DemandFeedFn,
        params: &VoiceParams,
    ) -> MixerResult<Handle> {
        let source = DemandFeedSource::new(feed, params.bits, params.channels)?;
        self.play_source(Box::new(source), params)
    }

    /// Stop a voice, invoking its completion callback.
    pub fn kill(&self, handle: Handle) -> MixerResult<()> {
        self.kill_with_callback(handle, true)
    }

    pub fn kill_with_callback(&self, handle: Handle, use_callback: bool) -> MixerResult<()> {
        self.with_voice(handle, |state, index| {
            state.finish_voice(index, use_callback);
            Ok(())
        })
    }

    /// Stop every non-music voice, tail to head.
    pub fn kill_all_voices(&self, use_callback: bool) -> MixerResult<()> {
        let mut state = self.state()?;
        loop {
            let mut index = state.arena.last_active();
            while index != ACTIVE_HEAD
                && state.arena.node(index).priority == pv_core::MUSIC_PRIORITY
            {
                index = state.arena.node(index).prev;
            }
            if index == ACTIVE_HEAD {
                return Ok(());
            }
            state.finish_voice(index, use_callback);
        }
    }

    /// Number of voices on the active list, paused ones included.
    pub fn voices_playing(&self) -> usize {
        self.state().map(|state| state.arena.active_count()).unwrap_or(0)
    }

    /// Lock-free: is this handle an unpaused active voice?
    pub fn voice_playing(&self, handle: Handle) -> bool {
        if !self.shared.installed.load(Ordering::Acquire) {
            return false;
        }
        let index = handle - MIN_HANDLE;
        index >= 0
            && (index as usize) < self.shared.slots.len()
            && self.shared.slots[index as usize].load(Ordering::Acquire) == SLOT_PLAYING
    }

    /// Would an allocation at this priority succeed right now?
    pub fn voice_available(&self, priority: i32) -> bool {
        let Ok(state) = self.state() else {
            return false;
        };
        if !state.arena.pool_empty() {
            return true;
        }
        state
            .lowest_priority_voice()
            .is_some_and(|index| state.arena.node(index).priority <= priority)
    }

    /// Re-derive the voice's rate from a new pitch offset.
    pub fn set_pitch(&self, handle: Handle, pitch_offset: i32) -> MixerResult<()> {
        self.with_voice(handle, |state, index| {
            let mix_rate = state.mix_rate;
            let voice = state.arena.node_mut(index);
            let rate = voice.sampling_rate;
            voice.set_pitch(rate, pitch_offset, mix_rate);
            Ok(())
        })
    }

    /// Replace the voice's source rate outright.
    pub fn set_frequency(&self, handle: Handle, frequency: u32) -> MixerResult<()> {
        self.with_voice(handle, |state, index| {
            let mix_rate = state.mix_rate;
            state.arena.node_mut(index).set_pitch(frequency, 0, mix_rate);
            Ok(())
        })
    }

    pub fn frequency(&self, handle: Handle) -> MixerResult<u32> {
        self.with_voice(handle, |state, index| Ok(state.arena.node(index).sampling_rate))
    }

    /// Set the voice's overall and per-channel levels, each 0..=255.
    pub fn set_pan(&self, handle: Handle, vol: i32, left: i32, right: i32) -> MixerResult<()> {
        self.with_voice(handle, |state, index| {
            let volume = state.arena.node(index).volume;
            state.set_voice_volume(index, vol, left, right, volume);
            Ok(())
        })
    }

    /// Position the voice by pan-table angle and distance.
    pub fn pan_3d(&self, handle: Handle, angle: i32, distance: i32) -> MixerResult<()> {
        self.with_voice(handle, |state, index| {
            let (vol, pan) = state.pan_table.position(angle, distance);
            let volume = state.arena.node(index).volume;
            state.set_voice_volume(index, vol, pan.left as i32, pan.right as i32, volume);
            Ok(())
        })
    }

    pub fn pause_voice(&self, handle: Handle, paused: bool) -> MixerResult<()> {
        self.with_voice(handle, |state, index| {
            let voice = state.arena.node_mut(index);
            voice.paused = paused;
            let slot = (voice.handle - MIN_HANDLE) as usize;
            let value = if paused { SLOT_PAUSED } else { SLOT_PLAYING };
            state.slots[slot].store(value, Ordering::Release);
            Ok(())
        })
    }

    /// Current playback offset in source bytes.
    pub fn position(&self, handle: Handle) -> MixerResult<u32> {
        self.with_voice(handle, |state, index| {
            let voice = state.arena.node(index);
            Ok(match &voice.source {
                Some(source) => source.tell(&voice.block),
                None => 0,
            })
        })
    }

    /// Seek to a source byte offset, for sources that support it.
    pub fn set_position(&self, handle: Handle, offset: u32) -> MixerResult<()> {
        self.with_voice(handle, |state, index| {
            let VoiceNode { source, block, .. } = state.arena.node_mut(index);
            if let Some(source) = source.as_mut() {
                source.seek(block, offset);
            }
            Ok(())
        })
    }

    /// Let the voice run to the end of its data instead of looping.
    pub fn end_looping(&self, handle: Handle) -> MixerResult<()> {
        self.with_voice(handle, |state, index| {
            if let Some(source) = state.arena.node_mut(index).source.as_mut() {
                source.end_loop();
            }
            Ok(())
        })
    }

    /// Global output volume, 0..=255.
    pub fn set_volume(&self, level: i32) -> MixerResult<()> {
        let mut state = self.state()?;
        state.global_volume =
            Fx16::from_ratio(level.clamp(0, MAX_TOTAL_VOLUME), MAX_TOTAL_VOLUME);
        Ok(())
    }

    pub fn volume(&self) -> MixerResult<i32> {
        let state = self.state()?;
        let scaled = state.global_volume.0 as i64 * MAX_TOTAL_VOLUME as i64 + (1 << 15);
        Ok((scaled >> 16) as i32)
    }

    /// Swap left and right on subsequent pan updates.
    pub fn set_reverse_stereo(&self, reverse: bool) -> MixerResult<()> {
        let mut state = self.state()?;
        state.reverse_stereo = reverse;
        Ok(())
    }

    pub fn reverse_stereo(&self) -> MixerResult<bool> {
        Ok(self.state()?.reverse_stereo)
    }

    /// Install the music callback. It is invoked once per page, after the
    /// effects voices and before the music voice, and must fill the whole
    /// buffer it is given. It must not call back into the mixer.
    pub fn hook_music_routine(&self, callback: MusicFn) -> MixerResult<()> {
        let mut state = self.state()?;
        state.music_callback = Some(callback);
        Ok(())
    }

    pub fn unhook_music_routine(&self) -> MixerResult<()> {
        let mut state = self.state()?;
        state.music_callback = None;
        Ok(())
    }

    /// Install (or clear) the completion callback, invoked with a voice's
    /// token when it ends, is killed, or is evicted. It must not call back
    /// into the mixer.
    pub fn on_voice_done(&self, callback: Option<VoiceDoneFn>) -> MixerResult<()> {
        let mut state = self.state()?;
        state.voice_done = callback;
        Ok(())
    }
}

fn resolve_pan(table: &PanTable, pan: &PanPosition) -> (i32, i32, i32) {
    match *pan {
        PanPosition::Levels { vol, left, right } => (vol, left, right),
        PanPosition::Position { angle, distance } => {
            let (vol, pan) = table.position(angle, distance);
            (vol, pan.left as i32, pan.right as i32)
        }
    }
}

impl MixerState {
    /// Take a voice off the pool, evicting the lowest-priority active
    /// voice at or below `priority` if the pool is dry. The evicted
    /// voice's completion callback runs.
    pub(crate) fn alloc_voice(&mut self, priority: i32) -> Option<u32> {
        if self.arena.pool_empty() {
            if let Some(victim) = self.lowest_priority_voice() {
                if self.arena.node(victim).priority <= priority {
                    self.finish_voice(victim, true);
                }
            }
            if self.arena.pool_empty() {
                return None;
            }
        }

        let index = self.arena.pop_pool()?;
        let Some(handle) = self.handles.acquire(index) else {
            self.arena.move_to_pool(index);
            return None;
        };

        let voice = self.arena.node_mut(index);
        voice.handle = handle;
        voice.paused = false;
        voice.block = BlockState::default();
        voice.source = None;
        voice.task = None;

        self.slots[(handle - MIN_HANDLE) as usize].store(SLOT_PLAYING, Ordering::Release);
        Some(index)
    }

    /// The eviction candidate: lowest priority, ties broken by strictly
    /// lower gains on both channels, otherwise first in list order.
    pub(crate) fn lowest_priority_voice(&self) -> Option<u32> {
        let mut best: Option<u32> = None;
        let mut index = self.arena.first_active();
        while index != ACTIVE_HEAD {
            let node = self.arena.node(index);
            best = match best {
                None => Some(index),
                Some(current) => {
                    let keep = self.arena.node(current);
                    let lower = node.priority < keep.priority
                        || (node.priority == keep.priority
                            && node.panned.left < keep.panned.left
                            && node.panned.right < keep.panned.right);
                    Some(if lower { index } else { current })
                }
            };
            index = node.next;
        }
        best
    }

    /// Apply levels to a voice and re-select its mix kernel. Mono output
    /// folds both channels to the overall level.
    pub(crate) fn set_voice_volume(
        &mut self,
        index: u32,
        vol: i32,
        mut left: i32,
        mut right: i32,
        volume: Fx16,
    ) {
        if self.channels == 1 {
            left = vol;
            right = vol;
        }
        if self.reverse_stereo {
            std::mem::swap(&mut left, &mut right);
        }

        let out_channels = self.channels;
        let voice = self.arena.node_mut(index);
        voice.goal = StereoGain {
            left: Fx16::from_ratio(left.clamp(0, MAX_TOTAL_VOLUME), MAX_TOTAL_VOLUME),
            right: Fx16::from_ratio(right.clamp(0, MAX_TOTAL_VOLUME), MAX_TOTAL_VOLUME),
        };
        voice.volume = volume;
        voice.select_kernel(out_channels);
    }

    /// Put an allocated voice on the active list and start it unpaused,
    /// with its smoothed gains snapped to the goal.
    pub(crate) fn play_voice(&mut self, index: u32) {
        self.arena.sorted_insert(index);
        let voice = self.arena.node_mut(index);
        voice.panned = voice.goal;
        voice.paused = false;
        let slot = (voice.handle - MIN_HANDLE) as usize;
        self.slots[slot].store(SLOT_PLAYING, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing_state(priorities: &[i32]) -> (MixerState, Vec<u32>) {
        let mut state = MixerState::test_instance(44100, 2, priorities.len());
        let mut indices = Vec::new();
        for &priority in priorities {
            let index = state.alloc_voice(priority).unwrap();
            state.arena.node_mut(index).priority = priority;
            state.set_voice_volume(index, 255, 255, 255, Fx16::ONE);
            state.play_voice(index);
            indices.push(index);
        }
        (state, indices)
    }

    #[test]
    fn test_alloc_exhaustion_then_eviction() {
        let (mut state, indices) = playing_state(&[1, 1, 1]);

        // Equal-or-lower priorities evict; a lower request does not.
        assert!(state.alloc_voice(0).is_none());
        assert_eq!(state.arena.active_count(), 3);

        let index = state.alloc_voice(2).unwrap();
        assert_eq!(state.arena.active_count(), 2);
        // The evicted record is the first-listed priority-1 voice.
        assert_eq!(index, indices[0]);
    }

    #[test]
    fn test_eviction_prefers_quieter_voice() {
        let (mut state, indices) = playing_state(&[1, 1]);
        state.set_voice_volume(indices[1], 255, 10, 10, Fx16::ONE);
        state.arena.node_mut(indices[1]).panned = state.arena.node(indices[1]).goal;

        let evicted = state.alloc_voice(1).unwrap();
        assert_eq!(evicted, indices[1]);
    }

    #[test]
    fn test_mono_output_folds_pan() {
        let mut state = MixerState::test_instance(44100, 1, 1);
        let index = state.alloc_voice(0).unwrap();
        state.set_voice_volume(index, 100, 255, 0, Fx16::ONE);

        let goal = state.arena.node(index).goal;
        assert_eq!(goal.left, goal.right);
        assert_eq!(goal.left, Fx16::from_ratio(100, MAX_TOTAL_VOLUME));
    }

    #[test]
    fn test_reverse_stereo_swaps_goals() {
        let mut state = MixerState::test_instance(44100, 2, 1);
        state.reverse_stereo = true;
        let index = state.alloc_voice(0).unwrap();
        state.set_voice_volume(index, 255, 255, 0, Fx16::ONE);

        let goal = state.arena.node(index).goal;
        assert_eq!(goal.left, Fx16::ZERO);
        assert_eq!(goal.right, Fx16::ONE);
    }
}
