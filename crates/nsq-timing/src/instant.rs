use std::{
    ops::{Add, AddAssign, Sub},
    time::Instant as StdInstant,
};

use crate::Duration;

/// Thin wrapper over [`std::time::Instant`]; exists so `Repeater` and the
/// rest of the crate can talk in terms of this crate's `Duration` without
/// every call site converting back and forth.
#[derive(Copy, Clone, Debug)]
pub struct Instant(StdInstant);

impl Instant {
    #[inline]
    pub fn now() -> Self {
        Self(StdInstant::now())
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        Duration::from(self.0.elapsed())
    }

    #[inline]
    pub fn elapsed_since(&self, since: Instant) -> Duration {
        Duration::from(self.0.saturating_duration_since(since.0))
    }

    #[inline]
    pub fn saturating_sub(&self, other: Instant) -> Duration {
        Duration::from(self.0.saturating_duration_since(other.0))
    }
}

impl Default for Instant {
    fn default() -> Self {
        Self::now()
    }
}

impl PartialEq for Instant {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Instant {}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sub for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration::from(self.0.saturating_duration_since(rhs.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0 + rhs.as_std())
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.as_std();
    }
}
