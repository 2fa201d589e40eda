//! pv-driver: the PCM device boundary of the polyvoice mixer
//!
//! The mixer never talks to a sound device directly. It hands a
//! [`PcmService`] to a [`PcmDriver`], and the driver clocks the service:
//! exactly one [`PcmService::render_next`] call per output page, on
//! whatever thread the device owns. Two drivers ship in-tree: an offline
//! [`NullDriver`] for tests and headless rendering, and a cpal-backed
//! [`CpalDriver`] for real output.

mod error;
mod null;
mod stream;

pub use error::*;
pub use null::*;
pub use stream::*;

/// Rate and channel layout negotiated with the device.
///
/// The mixer fills in its request before [`PcmDriver::init`]; the driver
/// may adjust both fields to what the device actually supports, and the
/// mixer adopts whatever comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Output sample rate in Hz.
    pub mix_rate: u32,
    /// Output channels, 1 or 2.
    pub channels: u16,
}

/// One page of mixed output per call.
///
/// `render_next` advances the mixer by exactly one page and copies the
/// freshly mixed interleaved signed 16-bit samples into `out`, which must
/// hold [`PcmService::page_samples`] values.
pub trait PcmService: Send {
    fn render_next(&mut self, out: &mut [i16]);

    /// Interleaved i16 values per page.
    fn page_samples(&self) -> usize;

    /// Channels interleaved in each page, 1 or 2.
    fn channels(&self) -> u16;
}

/// A platform PCM driver.
///
/// Lifecycle: `init` (may adjust the requested config), `begin_playback`
/// (starts invoking the service once per page), `stop_playback` (returns
/// only after any in-flight service call has completed), `shutdown`.
pub trait PcmDriver: Send {
    fn init(&mut self, config: &mut DriverConfig) -> DriverResult<()>;

    fn begin_playback(&mut self, service: Box<dyn PcmService>) -> DriverResult<()>;

    fn stop_playback(&mut self);

    fn shutdown(&mut self);
}
