//! Status LED patterns, expressed as PWM levels.

use crate::{clock::Millis, pwm::MAX_LEVEL};

/// Triangle wave: full at the period boundary, dark at mid-period.
pub fn breathe(now: Millis, period_ms: u32) -> u8 {
    let period = period_ms.max(2);
    let half = period / 2;
    let phase = now % period;
    let distance = phase.abs_diff(half);
    ((u64::from(distance) * u64::from(MAX_LEVEL)) / u64::from(half)).min(u64::from(MAX_LEVEL)) as u8
}

/// Square wave: lit for the first half of the period.
pub fn blink(now: Millis, period_ms: u32) -> u8 {
    let period = period_ms.max(2);
    if now % period > period / 2 {
        0
    } else {
        MAX_LEVEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breathe_is_a_triangle() {
        assert_eq!(breathe(0, 5_000), 255);
        assert_eq!(breathe(2_500, 5_000), 0);
        assert_eq!(breathe(1_250, 5_000), 127);
        assert_eq!(breathe(3_750, 5_000), 127);
        assert_eq!(breathe(5_000, 5_000), 255);
    }

    #[test]
    fn blink_halves_the_period() {
        assert_eq!(blink(100, 1_000), 255);
        assert_eq!(blink(500, 1_000), 255);
        assert_eq!(blink(501, 1_000), 0);
        assert_eq!(blink(1_000, 1_000), 255);
    }
}
