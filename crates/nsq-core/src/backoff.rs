use nsq_timing::Duration;

/// Tunables for [`BackoffTimer`], matching the defaults documented for
/// `nsq_consumer::ConsumerConfig`.
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Fraction of `max_interval - min_interval` given to the short
    /// component; the remainder goes to the long component.
    pub ratio: f64,
    pub short_length: u32,
    pub long_length: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::ZERO,
            max_interval: Duration::from_secs(128),
            ratio: 0.25,
            short_length: 10,
            long_length: 250,
        }
    }
}

/// Two-component exponential backoff: a short interval that reacts fast to
/// a burst of failures and a long interval that recovers slowly from
/// sustained ones.
///
/// `failure()` pushes both components toward their caps by one unit;
/// `success()` pulls them back toward zero by one unit. The externally
/// visible interval is `min_interval + short + long`, always within
/// `[min_interval, max_interval]`.
#[derive(Clone, Copy, Debug)]
pub struct BackoffTimer {
    min_interval: Duration,
    short_unit: Duration,
    short_interval: Duration,
    max_short: Duration,
    long_unit: Duration,
    long_interval: Duration,
    max_long: Duration,
}

impl BackoffTimer {
    pub fn new(config: BackoffConfig) -> Self {
        let envelope = config.max_interval.saturating_sub(config.min_interval);
        let max_short = envelope.mul_f64(config.ratio);
        let max_long = envelope.saturating_sub(max_short);
        let short_length = config.short_length.max(1);
        let long_length = config.long_length.max(1);

        Self {
            min_interval: config.min_interval,
            short_unit: Duration::from_secs_f64(max_short.as_secs_f64() / f64::from(short_length)),
            short_interval: Duration::ZERO,
            max_short,
            long_unit: Duration::from_secs_f64(max_long.as_secs_f64() / f64::from(long_length)),
            long_interval: Duration::ZERO,
            max_long,
        }
    }

    pub fn failure(&mut self) {
        self.short_interval = min_duration(self.short_interval + self.short_unit, self.max_short);
        self.long_interval = min_duration(self.long_interval + self.long_unit, self.max_long);
    }

    pub fn success(&mut self) {
        self.short_interval = self.short_interval.saturating_sub(self.short_unit);
        self.long_interval = self.long_interval.saturating_sub(self.long_unit);
    }

    pub fn interval(&self) -> Duration {
        self.min_interval + self.short_interval + self.long_interval
    }
}

#[inline]
fn min_duration(a: Duration, b: Duration) -> Duration {
    if a > b {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> BackoffTimer {
        BackoffTimer::new(BackoffConfig::default())
    }

    #[test]
    fn starts_at_zero() {
        assert_eq!(timer().interval(), Duration::ZERO);
    }

    #[test]
    fn failure_then_success_from_zero_returns_to_zero() {
        let mut t = timer();
        t.failure();
        assert!(t.interval() > Duration::ZERO);
        t.success();
        assert_eq!(t.interval(), Duration::ZERO);
    }

    #[test]
    fn interval_is_monotone_in_consecutive_failures_up_to_cap() {
        let mut t = timer();
        let mut last = Duration::ZERO;
        for _ in 0..300 {
            t.failure();
            let now = t.interval();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(t.interval(), BackoffConfig::default().max_interval);
    }

    #[test]
    fn interval_never_exceeds_max() {
        let mut t = timer();
        for _ in 0..1000 {
            t.failure();
            assert!(t.interval() <= BackoffConfig::default().max_interval);
        }
    }

    #[test]
    fn success_never_drops_below_min() {
        let mut t = timer();
        for _ in 0..1000 {
            t.success();
            assert!(t.interval() >= BackoffConfig::default().min_interval);
        }
    }
}
