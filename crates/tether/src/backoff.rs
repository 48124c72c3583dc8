use std::time::Duration;

pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(1200);
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_millis(2500);

/// Logarithmic reconnect delay: `min(log10(attempts + 1) * base, cap)`.
///
/// Zero after the first failure, then slowly growing until it reaches the
/// cap. It never gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// `attempts` is the number of unsuccessful reconnects recorded before
    /// this failure.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = (f64::from(attempts) + 1.0).log10();
        self.base.mul_f64(factor).min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_BASE, DEFAULT_RECONNECT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_reconnects_immediately() {
        assert_eq!(Backoff::default().delay(0), Duration::ZERO);
    }

    #[test]
    fn follows_log10_curve() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1).as_millis(), 361);
        assert_eq!(backoff.delay(2).as_millis(), 572);
        assert_eq!(backoff.delay(3).as_millis(), 722);
    }

    #[test]
    fn never_decreases_and_never_exceeds_cap() {
        let backoff = Backoff::default();
        let mut previous = Duration::ZERO;
        for attempts in 0..500 {
            let delay = backoff.delay(attempts);
            assert!(delay >= previous, "delay shrank at attempt {attempts}");
            assert!(delay <= DEFAULT_RECONNECT_CAP);
            previous = delay;
        }
        assert_eq!(previous, DEFAULT_RECONNECT_CAP);
    }

    #[test]
    fn custom_cap_applies() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(9), Duration::from_secs(1));
    }
}
