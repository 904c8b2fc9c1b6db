use std::cmp::min;
use std::time::Duration;
use anyhow::bail;

/// Delay before re-sending a departure after a failed attempt. The delay starts at `initial` and
///  is multiplied by `factor_eighths / 8` for every further failure, capped at `max`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor_eighths: u32,
}

impl RetryBackoff {
    pub fn new(initial: Duration, max: Duration, factor_eighths: u32) -> RetryBackoff {
        RetryBackoff {
            initial,
            max,
            factor_eighths,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.factor_eighths < 8 {
            bail!("backoff factor must be at least 1 (8 eighths), was {} eighths", self.factor_eighths);
        }
        if self.initial > self.max {
            bail!("initial backoff {:?} exceeds the maximum {:?}", self.initial, self.max);
        }
        Ok(())
    }

    /// `failed_attempts` is the number of failed attempts including the one that just happened
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..failed_attempts {
            if delay >= self.max {
                break;
            }
            delay = delay.checked_mul(self.factor_eighths)
                .map(|d| d / 8)
                .unwrap_or(self.max);
        }
        min(delay, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(2000, 32000, 16, 1, 2000)]
    #[case::second(2000, 32000, 16, 2, 4000)]
    #[case::fourth(2000, 32000, 16, 4, 16000)]
    #[case::capped(2000, 32000, 16, 6, 32000)]
    #[case::far_beyond_cap(2000, 32000, 16, 1000, 32000)]
    #[case::constant(500, 32000, 8, 5, 500)]
    #[case::factor_1_5(1000, 32000, 12, 3, 2250)]
    #[case::zero_attempts(2000, 32000, 16, 0, 2000)]
    #[case::no_delay(0, 32000, 16, 3, 0)]
    fn test_delay_after(#[case] initial_millis: u64, #[case] max_millis: u64, #[case] factor_eighths: u32, #[case] failed_attempts: u32, #[case] expected_millis: u64) {
        let backoff = RetryBackoff::new(Duration::from_millis(initial_millis), Duration::from_millis(max_millis), factor_eighths);
        assert_eq!(backoff.delay_after(failed_attempts), Duration::from_millis(expected_millis));
    }

    #[rstest]
    #[case::valid(1000, 2000, 16, true)]
    #[case::factor_too_small(1000, 2000, 7, false)]
    #[case::initial_above_max(3000, 2000, 16, false)]
    fn test_validate(#[case] initial_millis: u64, #[case] max_millis: u64, #[case] factor_eighths: u32, #[case] expected_valid: bool) {
        let backoff = RetryBackoff::new(Duration::from_millis(initial_millis), Duration::from_millis(max_millis), factor_eighths);
        assert_eq!(backoff.validate().is_ok(), expected_valid);
    }
}
