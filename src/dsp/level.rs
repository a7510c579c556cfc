//! Gain and level metering over 16-bit PCM.

/// Scale samples by a linear factor, saturating at the i16 bounds. Clipping
/// saturates, never wraps.
pub fn apply_gain(samples: &mut [i16], factor: f32) {
    if (factor - 1.0).abs() < f32::EPSILON {
        return;
    }
    for s in samples.iter_mut() {
        let scaled = (*s as f32 * factor).round();
        *s = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Root-mean-square level of a frame. Empty input meters as silence.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| s as f64 * s as f64).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(peak: f32, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let phase = i as f32 / len as f32 * std::f32::consts::TAU;
                (peak * phase.sin()).round() as i16
            })
            .collect()
    }

    #[test]
    fn gain_doubles_peak_amplitude() {
        let mut buf = sine(1000.0, 160);
        apply_gain(&mut buf, 2.0);
        let peak = buf.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!((1998..=2000).contains(&peak));
    }

    #[test]
    fn gain_saturates_instead_of_wrapping() {
        let mut buf = sine(30_000.0, 160);
        apply_gain(&mut buf, 2.0);
        let peak = buf.iter().copied().max().unwrap();
        let trough = buf.iter().copied().min().unwrap();
        assert_eq!(peak, i16::MAX);
        assert_eq!(trough, i16::MIN);
        // No wrapped sample: a positive half-wave input stays positive.
        let quarter = &sine(30_000.0, 160)[..40];
        let mut scaled = quarter.to_vec();
        apply_gain(&mut scaled, 2.0);
        for (orig, out) in quarter.iter().zip(&scaled) {
            if *orig > 0 {
                assert!(*out > 0);
            }
        }
    }

    #[test]
    fn unity_gain_is_identity() {
        let orig = sine(12_345.0, 64);
        let mut buf = orig.clone();
        apply_gain(&mut buf, 1.0);
        assert_eq!(orig, buf);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0i16; 160]), 0.0);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn rms_of_constant_signal_equals_its_magnitude() {
        let buf = [1000i16; 160];
        assert!((rms(&buf) - 1000.0).abs() < 0.01);
    }
}
