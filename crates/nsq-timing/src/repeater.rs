use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::{Duration, Instant};

/// A periodic-fire helper: call `fired()` (or `maybe()`) on every loop tick
/// and it returns `true` at most once per `interval`.
///
/// `last_acted: None` means "never fired yet", so a fresh `Repeater` always
/// fires on its first poll — this is what `force_fire` resets it back to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Default for Repeater {
    fn default() -> Self {
        Self::every(Duration::ZERO)
    }
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn maybe<F>(&mut self, mut f: F)
    where
        F: FnMut(Duration),
    {
        if let Some(el) = self.elapsed_if_due() {
            f(el);
            self.last_acted = Some(Instant::now());
        }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.elapsed_if_due().is_some() {
            self.last_acted = Some(Instant::now());
            true
        } else {
            false
        }
    }

    #[inline]
    fn elapsed_if_due(&self) -> Option<Duration> {
        match self.last_acted {
            None => Some(Duration::ZERO),
            Some(last) => {
                let el = last.elapsed();
                (el >= self.interval).then_some(el)
            }
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }

    /// Forces the next `fired()`/`maybe()` call to fire immediately.
    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }
}

impl Add<Duration> for Repeater {
    type Output = Repeater;
    fn add(self, rhs: Duration) -> Self::Output {
        Repeater { interval: self.interval.saturating_add(rhs), ..self }
    }
}

impl Sub<Duration> for Repeater {
    type Output = Repeater;
    fn sub(self, rhs: Duration) -> Self::Output {
        Repeater { interval: self.interval.saturating_sub(rhs), ..self }
    }
}

impl AddAssign<Duration> for Repeater {
    fn add_assign(&mut self, rhs: Duration) {
        self.interval = self.interval.saturating_add(rhs);
    }
}

impl SubAssign<Duration> for Repeater {
    fn sub_assign(&mut self, rhs: Duration) {
        self.interval = self.interval.saturating_sub(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_immediately_then_waits() {
        let mut r = Repeater::every(Duration::from_secs(3600));
        assert!(r.fired());
        assert!(!r.fired());
    }

    #[test]
    fn force_fire_resets() {
        let mut r = Repeater::every(Duration::from_secs(3600));
        assert!(r.fired());
        r.force_fire();
        assert!(r.fired());
    }
}
