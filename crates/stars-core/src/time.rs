use serde::Deserialize;
use serde::Serialize;
use std::ops::Add;
use std::ops::AddAssign;
use std::ops::Mul;
use std::ops::Sub;

/// An instant, counted in microseconds from an arbitrary epoch.
///
/// The overlay never reads a wall clock on its own; every operation that
/// needs "now" receives it as a parameter, so simulations and tests can run
/// on a virtual clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Time = Time(0);

    pub fn from_micros(us: i64) -> Self {
        Time(us)
    }
    pub fn from_secs(s: f64) -> Self {
        Time((s * 1e6) as i64)
    }
    pub fn micros(self) -> i64 {
        self.0
    }
    pub fn seconds(self) -> f64 {
        self.0 as f64 / 1e6
    }
}

/// A span of time, in microseconds. May be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Duration(i64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub fn from_micros(us: i64) -> Self {
        Duration(us)
    }
    pub fn from_secs(s: f64) -> Self {
        Duration((s * 1e6) as i64)
    }
    pub fn micros(self) -> i64 {
        self.0
    }
    pub fn seconds(self) -> f64 {
        self.0 as f64 / 1e6
    }
}

impl Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl Mul<f64> for Duration {
    type Output = Duration;
    fn mul(self, rhs: f64) -> Duration {
        Duration((self.0 as f64 * rhs) as i64)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn arithmetic_round_trips_through_seconds() {
        let t = Time::from_secs(5.0) + Duration::from_secs(2.5);
        assert_eq!(t, Time::from_secs(7.5));
        assert_eq!((t - Time::from_secs(5.0)).seconds(), 2.5);
    }
    #[test]
    fn negative_spans_are_representable() {
        let d = Time::from_secs(1.0) - Time::from_secs(3.0);
        assert_eq!(d.seconds(), -2.0);
    }
    #[test]
    fn ordering_follows_the_axis() {
        assert!(Time::from_secs(1.0) < Time::from_secs(2.0));
        assert!(Duration::from_secs(-1.0) < Duration::ZERO);
    }
}
