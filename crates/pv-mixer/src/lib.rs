//! pv-mixer: a software multi-voice PCM mixer
//!
//! Composites a bounded pool of independently parameterized voices into a
//! ring of interleaved signed 16-bit pages. A PCM driver clocks the
//! service routine once per output page on its own thread; control
//! operations (play, kill, pan, pitch, seek, pause, reverb, music hooks)
//! run from any thread under the mixer lock. Voices pull their PCM
//! through [`SampleSource`], so raw buffers, client demand-feed
//! producers, and external streaming decoders all mix the same way.

mod arena;
mod control;
mod engine;
mod kernels;
mod reverb;
mod service;
mod source;
mod voice;

pub use control::{PanPosition, VoiceParams};
pub use engine::{Mixer, MixerConfig, MusicFn, VoiceDoneFn};
pub use source::{
    BlockState, DemandFeedFn, DemandFeedSource, LoopRegion, MAX_BLOCK_FRAMES, Playback,
    PrefetchTask, RawSource, SampleSource,
};

pub use pv_core::{
    Fx16, Handle, MAX_TOTAL_VOLUME, MAX_VOICES, MAX_VOLUME, MIN_HANDLE,
    MIX_BUFFER_SAMPLES, MUSIC_PRIORITY, MixerError, MixerResult, NUM_PAN_POSITIONS, Pan,
    PanTable,
};
pub use pv_driver::{
    CpalDriver, DriverConfig, DriverError, NullDriver, NullPump, PcmDriver, PcmService,
};
