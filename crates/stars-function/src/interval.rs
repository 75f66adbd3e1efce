use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stars_core::Time;

/// A value that can live on a normalization axis: ordered, copyable, with a
/// signed distance to another value and a population-weighted mean.
pub trait Scalar: Copy + PartialOrd + PartialEq + Serialize + DeserializeOwned {
    /// Signed distance `self - origin`, projected onto the reals.
    fn span(self, origin: Self) -> f64;
    /// Population-weighted mean of two values.
    fn weighted_mean(l: Self, lc: u32, r: Self, rc: u32) -> Self;
}

impl Scalar for u32 {
    fn span(self, origin: Self) -> f64 {
        self as f64 - origin as f64
    }
    fn weighted_mean(l: Self, lc: u32, r: Self, rc: u32) -> Self {
        ((l as u64 * lc as u64 + r as u64 * rc as u64) / (lc as u64 + rc as u64)) as u32
    }
}

impl Scalar for u64 {
    fn span(self, origin: Self) -> f64 {
        self as f64 - origin as f64
    }
    fn weighted_mean(l: Self, lc: u32, r: Self, rc: u32) -> Self {
        (l * lc as u64 + r * rc as u64) / (lc as u64 + rc as u64)
    }
}

impl Scalar for f64 {
    fn span(self, origin: Self) -> f64 {
        self - origin
    }
    fn weighted_mean(l: Self, lc: u32, r: Self, rc: u32) -> Self {
        (l * lc as f64 + r * rc as f64) / (lc + rc) as f64
    }
}

impl Scalar for Time {
    fn span(self, origin: Self) -> f64 {
        (self - origin).seconds()
    }
    fn weighted_mean(l: Self, lc: u32, r: Self, rc: u32) -> Self {
        let lm = l.micros() as i128;
        let rm = r.micros() as i128;
        Time::from_micros(((lm * lc as i128 + rm * rc as i128) / (lc + rc) as i128) as i64)
    }
}

/// A closed range `[min, max]` over one attribute axis.
///
/// Clustering bins the range into equal buckets; two values whose buckets
/// differ are "far apart" and their clusters are never merged directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval<T> {
    min: T,
    max: T,
}

impl<T: Scalar> Interval<T> {
    /// A degenerate range holding a single value.
    pub fn at(v: T) -> Self {
        Self { min: v, max: v }
    }

    pub fn min(&self) -> T {
        self.min
    }

    pub fn max(&self) -> T {
        self.max
    }

    /// Collapse the range onto a single value.
    pub fn set_limits(&mut self, v: T) {
        self.min = v;
        self.max = v;
    }

    /// Widen the range to cover `v`.
    pub fn extend(&mut self, v: T) {
        if v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
    }

    /// Widen the range to cover another range.
    pub fn include(&mut self, other: &Self) {
        self.extend(other.min);
        self.extend(other.max);
    }

    /// Width of the range on the real axis.
    pub fn extent(&self) -> f64 {
        self.max.span(self.min)
    }

    /// A range with no width cannot separate values.
    pub fn degenerate(&self) -> bool {
        self.extent() == 0.0
    }

    /// Index of the bucket `v` falls into when the range is split into
    /// `buckets` equal parts.
    pub fn bucket(&self, v: T, buckets: usize) -> usize {
        (v.span(self.min) * buckets as f64 / self.extent()).floor() as usize
    }
}
