//! 16-bit PCM conversion

const I16_SCALE: f32 = 1.0 / 32768.0;

/// Convert a signed 16-bit sample to `[-1, 1)`
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 * I16_SCALE
}

/// Convert a float sample to 16 bits, hard-clipping outside `[-1, 1]`
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i16_range() {
        assert_eq!(i16_to_f32(0), 0.0);
        assert_eq!(i16_to_f32(i16::MIN), -1.0);
        assert!(i16_to_f32(i16::MAX) < 1.0);
        assert!((i16_to_f32(16384) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_hard_clip() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-3.0), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(f32::NAN), 0);
    }

    #[test]
    fn test_round_trip_close() {
        for s in [-32768i16, -1000, -1, 0, 1, 1000, 32767] {
            let back = f32_to_i16(i16_to_f32(s));
            assert!((back as i32 - s as i32).abs() <= 1, "{} -> {}", s, back);
        }
    }
}
