//! Pitch-offset to playback-rate scaling

use crate::Fx16;

/// Pitch offsets are hundredths of a semitone; 1200 is one octave.
const OCTAVE_CENTS: i32 = 1200;

/// Q16 rate multiplier for a pitch offset: `2^(offset / 1200)`.
///
/// Computed with float math at control time; the mix path only ever sees
/// the resulting fixed-point scale.
pub fn pitch_scale(offset: i32) -> Fx16 {
    if offset == 0 {
        return Fx16::ONE;
    }
    Fx16::from_f32((offset as f32 / OCTAVE_CENTS as f32).exp2())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_offset_is_unity() {
        assert_eq!(pitch_scale(0), Fx16::ONE);
    }

    #[test]
    fn test_octave_doubles_and_halves() {
        let up = pitch_scale(OCTAVE_CENTS);
        let down = pitch_scale(-OCTAVE_CENTS);
        assert!((up.0 - 2 * Fx16::ONE.0).abs() <= 2);
        assert!((down.0 - Fx16::ONE.0 / 2).abs() <= 2);
    }

    #[test]
    fn test_monotonic_in_offset() {
        let mut last = pitch_scale(-2400);
        for offset in (-2300..=2400).step_by(100) {
            let scale = pitch_scale(offset);
            assert!(scale > last);
            last = scale;
        }
    }
}
