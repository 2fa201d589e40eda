//! pv-core: Shared types and constants for the polyvoice mixer
//!
//! Fixed-point arithmetic, the pan/volume table, pitch scaling, and the
//! mixer error taxonomy live here so both the driver boundary and the
//! mixer proper can depend on them.

mod error;
mod fixed;
mod pan;
mod pitch;

pub use error::*;
pub use fixed::*;
pub use pan::*;
pub use pitch::*;

/// Output samples (frames) mixed per page.
pub const MIX_BUFFER_SAMPLES: usize = 256;

/// Bytes in one half of the mix buffer ring. The page count is derived
/// from this and must come out a power of two.
pub const TOTAL_BUFFER_SIZE: usize = 65536;

/// Hard cap on the voice pool size.
pub const MAX_VOICES: usize = 256;

/// Lowest valid voice handle. A voice whose handle is below this is not
/// in the handle table.
pub const MIN_HANDLE: Handle = 1;

/// Number of discrete pan angles in the pan table.
pub const NUM_PAN_POSITIONS: usize = 128;

/// Largest pan angle; also the mask that wraps angles into range.
pub const MAX_PAN_POSITION: usize = NUM_PAN_POSITIONS - 1;

/// Largest distance/level accepted by the pan table.
pub const MAX_VOLUME: i32 = 255;

/// Largest per-voice and global volume level.
pub const MAX_TOTAL_VOLUME: i32 = 255;

/// Priority value reserved for the music voice. At most one voice on the
/// active list may carry it.
pub const MUSIC_PRIORITY: i32 = i32::MAX;

/// Stable voice identifier handed out by the mixer. Zero is never a valid
/// handle.
pub type Handle = i32;
