//! Feedback-delay reverb over the FX page ring
//!
//! Instead of clearing the fresh mix page, the service folds in the ring's
//! own output from `reverb_delay` samples ago, attenuated and saturated.
//! Older pages become input to newer ones, which makes the FX half a
//! cheap comb filter.

use pv_core::{Fx16, MAX_VOLUME, MIX_BUFFER_SAMPLES, MixerResult, mix_volume};

use crate::engine::{Mixer, MixerState};

impl MixerState {
    /// Fold delayed ring output into the current page. The source trails
    /// the destination by the configured delay and wraps inside the FX
    /// half, so at most two passes cover the page.
    pub(crate) fn apply_reverb(&mut self) {
        let half = self.num_pages * self.page_samples;
        let base = self.mix_page * self.page_samples;
        let volume = self.reverb_volume;

        let mut source = (base + half - self.reverb_delay) % half;
        let mut dest = base;
        let mut remaining = self.page_samples;

        while remaining > 0 {
            let count = remaining.min(half - source);
            for offset in 0..count {
                let wet = volume.scale(self.ring[source + offset] as i32);
                let sum = self.ring[dest + offset] as i32 + wet;
                self.ring[dest + offset] =
                    sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
            // A second pass only happens after wrapping to the ring start.
            source = 0;
            dest += count;
            remaining -= count;
        }
    }
}

impl Mixer {
    /// Set the reverb level, 0..=255; zero disables reverb entirely.
    pub fn set_reverb(&self, level: i32) -> MixerResult<()> {
        let mut state = self.state()?;
        state.reverb_level = mix_volume(level);
        state.reverb_volume = Fx16::from_ratio(state.reverb_level, MAX_VOLUME);
        Ok(())
    }

    /// Set the reverb delay in output samples; clamped to one page at the
    /// short end and the whole FX ring at the long end.
    pub fn set_reverb_delay(&self, delay: usize) -> MixerResult<()> {
        let mut state = self.state()?;
        let max = MIX_BUFFER_SAMPLES * state.num_pages;
        let clamped = delay.clamp(MIX_BUFFER_SAMPLES, max);
        state.reverb_delay = clamped * state.channels as usize;
        Ok(())
    }

    /// Current reverb delay in output samples.
    pub fn reverb_delay(&self) -> MixerResult<usize> {
        let state = self.state()?;
        Ok(state.reverb_delay / state.channels as usize)
    }

    /// Longest supported reverb delay in output samples.
    pub fn max_reverb_delay(&self) -> MixerResult<usize> {
        let state = self.state()?;
        Ok(MIX_BUFFER_SAMPLES * state.num_pages)
    }
}
