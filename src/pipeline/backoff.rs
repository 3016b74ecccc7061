//! Jittered exponential backoff between processing attempts.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;

/// Delay before retrying after the given attempt (1-based).
///
/// Exponential growth capped at `max`, then scaled by a jitter multiplier
/// uniform in `[0.5, 1.5)` so synchronized workers fan out instead of
/// retrying in lockstep.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let attempt = attempt.max(1);
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    let exp = base.saturating_mul(factor).min(max);
    exp.mul_f64(0.5 + jitter_unit())
}

/// Uniform sample in `[0, 1)` from the OS RNG: top 53 bits of a random u64,
/// the exactly-representable mantissa width of an f64. Falls back to `0.5`
/// if the RNG fails.
fn jitter_unit() -> f64 {
    let mut buf = [0u8; 8];
    match OsRng.try_fill_bytes(&mut buf) {
        Ok(()) => (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64,
        Err(_) => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_inside_the_jitter_envelope() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(30);
        for attempt in 1..=6 {
            let exp = base
                .saturating_mul(1 << (attempt - 1))
                .min(max);
            for _ in 0..200 {
                let delay = backoff_delay(attempt, base, max);
                assert!(delay >= exp.mul_f64(0.5), "attempt {attempt}: {delay:?} too short");
                assert!(delay < exp.mul_f64(1.5), "attempt {attempt}: {delay:?} too long");
            }
        }
    }

    #[test]
    fn growth_is_capped_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(5);
        for _ in 0..100 {
            let delay = backoff_delay(30, base, max);
            assert!(delay < max.mul_f64(1.5));
            assert!(delay >= max.mul_f64(0.5));
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let delay = backoff_delay(u32::MAX, Duration::from_millis(10), Duration::from_secs(60));
        assert!(delay < Duration::from_secs(90));
    }

    #[test]
    fn jitter_unit_is_in_half_open_range() {
        for _ in 0..1000 {
            let u = jitter_unit();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
