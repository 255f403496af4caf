use std::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
    str::FromStr,
    time::Duration as StdDuration,
};

use humantime::{Duration as HumanDuration, DurationError as HumanDurationError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Thin wrapper over [`std::time::Duration`] that additionally parses
/// human-readable strings ("15s", "128s", "500ms") the way config files
/// write them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(StdDuration);

impl Duration {
    pub const ZERO: Self = Self(StdDuration::ZERO);

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(StdDuration::from_secs(s))
    }

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(StdDuration::from_millis(ms))
    }

    #[inline]
    pub fn from_secs_f64(s: f64) -> Self {
        Self(StdDuration::from_secs_f64(s))
    }

    #[inline]
    pub fn as_std(self) -> StdDuration {
        self.0
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0.as_secs_f64()
    }

    #[inline]
    pub fn as_millis(self) -> u128 {
        self.0.as_millis()
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Duration) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn saturating_add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn mul_f64(self, rhs: f64) -> Self {
        Self(self.0.mul_f64(rhs.max(0.0)))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl From<StdDuration> for Duration {
    #[inline]
    fn from(value: StdDuration) -> Self {
        Self(value)
    }
}

impl From<Duration> for StdDuration {
    #[inline]
    fn from(value: Duration) -> Self {
        value.0
    }
}

impl FromStr for Duration {
    type Err = HumanDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<HumanDuration>().map(|d| Self(d.into()))
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl AddAssign for Duration {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Duration {
    #[inline]
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration string (\"15s\", \"500ms\") or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(|e| E::custom(format!("invalid duration {value:?}: {e}")))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Duration::from_secs(value))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
                Ok(Duration::from_secs_f64(value))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_strings() {
        assert_eq!(Duration::from_str("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(Duration::from_str("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn serde_roundtrip_from_number() {
        let d: Duration = serde_json::from_str("60").unwrap();
        assert_eq!(d, Duration::from_secs(60));
    }

    #[test]
    fn serde_roundtrip_from_string() {
        let d: Duration = serde_json::from_str(r#""128s""#).unwrap();
        assert_eq!(d, Duration::from_secs(128));
    }
}
