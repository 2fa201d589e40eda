//! Sample sources
//!
//! A voice pulls PCM through a [`SampleSource`]: when its current block is
//! exhausted the mixer calls [`SampleSource::refill`], which repositions
//! the block window and reports whether more data exists. Two sources ship
//! in-tree — raw PCM with an optional loop region, and demand-feed, where
//! a client closure produces blocks on exhaustion. Streaming decoders
//! (Vorbis, FLAC, trackers, ...) implement this trait externally.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

use pv_core::{MixerError, MixerResult};

/// Result of a block refill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playback {
    KeepPlaying,
    NoMoreData,
}

/// Read state of the current block: a Q16.16 cursor and Q16.16 length,
/// both in source frames. A zero length means a refill is due.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockState {
    pub position: u32,
    pub length: u32,
}

/// Largest window handed to the mix kernels in one block, in frames.
pub const MAX_BLOCK_FRAMES: u32 = 0x8000;

/// A streaming producer of PCM blocks for one voice.
pub trait SampleSource: Send {
    /// Advance to the next block window, carrying the fractional cursor
    /// across the boundary. Returns [`Playback::NoMoreData`] when the
    /// source is exhausted.
    fn refill(&mut self, block: &mut BlockState) -> Playback;

    /// Bytes of the current block window.
    fn bytes(&self) -> &[u8];

    /// Current playback offset in source bytes, for sources that track it.
    fn tell(&self, block: &BlockState) -> u32 {
        let _ = block;
        0
    }

    /// Seek to a byte offset; the next refill resumes there. Sources that
    /// cannot seek ignore this.
    fn seek(&mut self, block: &mut BlockState, offset: u32) {
        let _ = (block, offset);
    }

    /// Drop any loop region so playback runs to the end of the data.
    fn end_loop(&mut self) {}

    /// Hand over the in-flight decode task, if this source decodes ahead.
    fn prefetch(&mut self) -> Option<PrefetchTask> {
        None
    }
}

// ─── prefetch tasks ──────────────────────────────────────────────────────

/// Handle to a decoder working one block ahead on its own thread.
///
/// Control operations wait on the task before touching the voice; the
/// per-page mix skips the voice until the task resolves and ends it if the
/// decode failed.
pub struct PrefetchTask {
    rx: Receiver<MixerResult<()>>,
    done: Option<MixerResult<()>>,
}

pub(crate) enum TaskState {
    Pending,
    Done(MixerResult<()>),
}

impl PrefetchTask {
    /// A sender/task pair; the decoder sends exactly one result when its
    /// block is ready.
    pub fn channel() -> (Sender<MixerResult<()>>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx, done: None })
    }

    pub(crate) fn poll(&mut self) -> TaskState {
        if let Some(result) = &self.done {
            return TaskState::Done(result.clone());
        }
        let result = match self.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return TaskState::Pending,
            Err(TryRecvError::Disconnected) => Err(MixerError::InvalidFile),
        };
        self.done = Some(result.clone());
        TaskState::Done(result)
    }

    pub(crate) fn is_pending(&mut self) -> bool {
        matches!(self.poll(), TaskState::Pending)
    }

    pub(crate) fn receiver(&self) -> Receiver<MixerResult<()>> {
        self.rx.clone()
    }

    pub(crate) fn complete(&mut self, result: MixerResult<()>) {
        if self.done.is_none() {
            self.done = Some(result);
        }
    }
}

// ─── raw PCM ─────────────────────────────────────────────────────────────

/// Loop region within a raw source, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRegion {
    pub start: u32,
    pub frames: u32,
}

/// Caller-provided PCM bytes played front to back, optionally rewinding
/// into a loop region on exhaustion.
pub struct RawSource {
    data: Arc<[u8]>,
    frame_bytes: u32,
    total_frames: u32,
    next_frame: u32,
    remaining: u32,
    loop_region: Option<LoopRegion>,
    window_start: u32,
    window_frames: u32,
}

impl RawSource {
    pub fn new(
        data: Arc<[u8]>,
        bits: u8,
        channels: u8,
        loop_region: Option<LoopRegion>,
    ) -> MixerResult<Self> {
        let frame_bytes = (bits as u32 / 8) * channels as u32;
        if frame_bytes == 0 || (data.len() as u32) < frame_bytes {
            return Err(MixerError::InvalidFile);
        }
        let total_frames = data.len() as u32 / frame_bytes;
        if let Some(region) = loop_region {
            let end = region.start as u64 + region.frames as u64;
            if region.frames == 0 || end > total_frames as u64 {
                return Err(MixerError::InvalidFile);
            }
        }
        Ok(Self {
            data,
            frame_bytes,
            total_frames,
            next_frame: 0,
            remaining: total_frames,
            loop_region,
            window_start: 0,
            window_frames: 0,
        })
    }
}

impl SampleSource for RawSource {
    fn refill(&mut self, block: &mut BlockState) -> Playback {
        if self.remaining == 0 {
            let Some(region) = self.loop_region else {
                return Playback::NoMoreData;
            };
            self.next_frame = region.start;
            self.remaining = region.frames;
            block.position = 0;
            block.length = 0;
        }

        block.position = block.position.saturating_sub(block.length);
        self.window_start = self.next_frame;
        self.window_frames = self.remaining.min(MAX_BLOCK_FRAMES);
        self.next_frame += self.window_frames;
        self.remaining -= self.window_frames;
        block.length = self.window_frames << 16;

        Playback::KeepPlaying
    }

    fn bytes(&self) -> &[u8] {
        let start = (self.window_start * self.frame_bytes) as usize;
        let end = start + (self.window_frames * self.frame_bytes) as usize;
        &self.data[start..end]
    }

    fn tell(&self, block: &BlockState) -> u32 {
        let frame = self.window_start as u64 + (block.position >> 16) as u64;
        (frame.min(self.total_frames as u64) * self.frame_bytes as u64) as u32
    }

    fn seek(&mut self, block: &mut BlockState, offset: u32) {
        let frame = (offset / self.frame_bytes).min(self.total_frames);
        self.next_frame = frame;
        self.remaining = self.total_frames - frame;
        self.window_start = frame;
        self.window_frames = 0;
        block.position = 0;
        block.length = 0;
    }

    fn end_loop(&mut self) {
        self.loop_region = None;
    }
}

// ─── demand feed ─────────────────────────────────────────────────────────

/// Client block producer: returns the next contiguous region, or `None`
/// to end the voice.
pub type DemandFeedFn = Box<dyn FnMut() -> Option<Arc<[u8]>> + Send>;

/// Source whose data arrives from a client closure on block exhaustion.
pub struct DemandFeedSource {
    feed: DemandFeedFn,
    current: Option<Arc<[u8]>>,
    frame_bytes: u32,
    window_start: u32,
    window_frames: u32,
    remaining: u32,
}

impl DemandFeedSource {
    pub fn new(feed: DemandFeedFn, bits: u8, channels: u8) -> MixerResult<Self> {
        let frame_bytes = (bits as u32 / 8) * channels as u32;
        if frame_bytes == 0 {
            return Err(MixerError::InvalidFile);
        }
        Ok(Self {
            feed,
            current: None,
            frame_bytes,
            window_start: 0,
            window_frames: 0,
            remaining: 0,
        })
    }
}

impl SampleSource for DemandFeedSource {
    fn refill(&mut self, block: &mut BlockState) -> Playback {
        if self.remaining > 0 {
            block.position = block.position.saturating_sub(block.length);
            self.window_start += self.window_frames;
            self.window_frames = self.remaining.min(MAX_BLOCK_FRAMES);
            self.remaining -= self.window_frames;
            block.length = self.window_frames << 16;
            return Playback::KeepPlaying;
        }

        let Some(next) = (self.feed)() else {
            return Playback::NoMoreData;
        };
        let frames = next.len() as u32 / self.frame_bytes;
        if frames == 0 {
            return Playback::NoMoreData;
        }

        self.current = Some(next);
        self.window_start = 0;
        self.window_frames = frames.min(MAX_BLOCK_FRAMES);
        self.remaining = frames - self.window_frames;
        block.position = 0;
        block.length = self.window_frames << 16;

        Playback::KeepPlaying
    }

    fn bytes(&self) -> &[u8] {
        match &self.current {
            Some(data) => {
                let start = (self.window_start * self.frame_bytes) as usize;
                let end = start + (self.window_frames * self.frame_bytes) as usize;
                &data[start..end]
            }
            None => &[],
        }
    }
}
