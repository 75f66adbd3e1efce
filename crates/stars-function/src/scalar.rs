use super::*;
use serde::Deserialize;
use serde::Serialize;
use std::marker::PhantomData;

/// Reduction rule applied when two parameter populations merge.
pub trait Reduce {
    fn reduce<T: Scalar>(l: T, lc: u32, r: T, rc: u32) -> T;
}

/// Keep the smaller value: conservative bound for capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Min;

/// Keep the larger value: conservative bound for queue ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Max;

/// Population-weighted mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mean;

impl Reduce for Min {
    fn reduce<T: Scalar>(l: T, _: u32, r: T, _: u32) -> T {
        if l < r { l } else { r }
    }
}

impl Reduce for Max {
    fn reduce<T: Scalar>(l: T, _: u32, r: T, _: u32) -> T {
        if l > r { l } else { r }
    }
}

impl Reduce for Mean {
    fn reduce<T: Scalar>(l: T, lc: u32, r: T, rc: u32) -> T {
        T::weighted_mean(l, lc, r, rc)
    }
}

/// One scalar attribute of a cluster record, with the error moments that an
/// aggregation history leaves behind.
///
/// After merging populations observing the original values `s_i`, the
/// invariant is `value = reduce(S)`, `linear = Σ (value - s_i)` and
/// `mse = Σ (value - s_i)²`. The incremental update in [`Self::aggregate`]
/// maintains both moments exactly (up to floating-point accumulation order)
/// without revisiting the constituents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Parameter<R, T> {
    value: T,
    mse: f64,
    linear: f64,
    #[serde(skip)]
    reduce: PhantomData<R>,
}

/// Minimum-tracking parameter (memory, disk, power floors).
pub type MinParam<T> = Parameter<Min, T>;
/// Maximum-tracking parameter (queue end times).
pub type MaxParam<T> = Parameter<Max, T>;
/// Mean-tracking parameter.
pub type MeanParam<T> = Parameter<Mean, T>;

impl<R, T: PartialEq> PartialEq for Parameter<R, T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.mse == other.mse && self.linear == other.linear
    }
}

impl<R: Reduce, T: Scalar> Parameter<R, T> {
    pub fn new(value: T) -> Self {
        Self { value, mse: 0.0, linear: 0.0, reduce: PhantomData }
    }

    pub fn value(&self) -> T {
        self.value
    }

    /// Accumulated mean-square error against the original observations.
    pub fn mse(&self) -> f64 {
        self.mse
    }

    /// Accumulated linear error against the original observations.
    pub fn linear(&self) -> f64 {
        self.linear
    }

    /// Merge another parameter into this one. `count` and `rcount` are the
    /// populations each side represents.
    ///
    /// With `v' = reduce(value, other.value)` and per-side shifts
    /// `d = v' - value`, the new moments follow from expanding
    /// `Σ (v' - s_i)² = Σ ((value - s_i) + d)²`, which only needs the
    /// previously carried `mse` and `linear` sums.
    pub fn aggregate(&mut self, count: u32, other: &Self, rcount: u32) {
        self.aggregate_as::<R>(count, other, rcount);
    }

    /// Merge with a reduction rule chosen at the call site, for policies
    /// whose merge method is runtime-configurable. The moment bookkeeping is
    /// identical for every rule.
    pub fn aggregate_as<R2: Reduce>(&mut self, count: u32, other: &Self, rcount: u32) {
        let v = R2::reduce(self.value, count, other.value, rcount);
        let dl = v.span(self.value);
        let dr = v.span(other.value);
        self.mse += count as f64 * dl * dl + 2.0 * dl * self.linear
            + other.mse + rcount as f64 * dr * dr + 2.0 * dr * other.linear;
        self.linear += count as f64 * dl + other.linear + rcount as f64 * dr;
        self.value = v;
    }

    /// Aggregation loss normalized by population and range width. Zero when
    /// the range cannot separate values.
    pub fn norm(&self, range: &Interval<T>, count: u32) -> f64 {
        let extent = range.extent();
        if extent == 0.0 {
            0.0
        } else {
            self.mse / (count as f64 * extent * extent)
        }
    }

    /// Coarse inequality: true when the two values fall into different
    /// buckets of `range`.
    pub fn far(&self, other: &Self, range: &Interval<T>, buckets: usize) -> bool {
        !range.degenerate() && range.bucket(self.value, buckets) != range.bucket(other.value, buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    /// Recompute the moments from scratch for a set of observations.
    fn moments(value: f64, observed: &[f64]) -> (f64, f64) {
        let linear = observed.iter().map(|s| value - s).sum::<f64>();
        let mse = observed.iter().map(|s| (value - s) * (value - s)).sum::<f64>();
        (mse, linear)
    }

    #[test]
    fn min_reduction_keeps_the_floor() {
        let mut p = MinParam::new(100.0);
        p.aggregate(1, &MinParam::new(40.0), 1);
        p.aggregate(2, &MinParam::new(70.0), 1);
        assert_eq!(p.value(), 40.0);
    }

    #[test]
    fn incremental_moments_match_direct_computation() {
        let mut rng = SmallRng::seed_from_u64(0x5ca1a2);
        for _ in 0..100 {
            let observed = (0..rng.random_range(2..20))
                .map(|_| rng.random_range(0.0..1000.0))
                .collect::<Vec<f64>>();
            let mut p = MinParam::new(observed[0]);
            let mut count = 1;
            for &s in &observed[1..] {
                p.aggregate(count, &MinParam::new(s), 1);
                count += 1;
            }
            let floor = observed.iter().cloned().fold(f64::INFINITY, f64::min);
            assert_eq!(p.value(), floor);
            let (mse, linear) = moments(floor, &observed);
            assert!((p.mse() - mse).abs() < 1e-6 * mse.max(1.0));
            assert!((p.linear() - linear).abs() < 1e-6 * linear.abs().max(1.0));
        }
    }

    #[test]
    fn pairwise_merge_order_does_not_change_moments() {
        let a = MinParam::new(10.0);
        let b = MinParam::new(30.0);
        let c = MinParam::new(20.0);
        let d = MinParam::new(50.0);
        let mut left = a;
        left.aggregate(1, &b, 1);
        let mut right = c;
        right.aggregate(1, &d, 1);
        left.aggregate(2, &right, 2);
        let mut seq = a;
        let mut n = 1;
        for other in [b, c, d] {
            seq.aggregate(n, &other, 1);
            n += 1;
        }
        assert!((left.mse() - seq.mse()).abs() < 1e-9);
        assert!((left.linear() - seq.linear()).abs() < 1e-9);
    }

    #[test]
    fn mean_reduction_weights_by_population() {
        let mut p = MeanParam::new(10.0);
        p.aggregate(3, &MeanParam::new(50.0), 1);
        assert_eq!(p.value(), 20.0);
    }

    #[test]
    fn norm_is_zero_on_a_degenerate_range() {
        let mut p = MinParam::new(5u32);
        p.aggregate(1, &MinParam::new(9), 1);
        assert_eq!(p.norm(&Interval::at(5), 2), 0.0);
    }

    #[test]
    fn far_follows_bucket_boundaries() {
        let mut range = Interval::at(0u32);
        range.extend(100);
        let low = MinParam::new(10u32);
        let high = MinParam::new(90u32);
        let near = MinParam::new(12u32);
        assert!(low.far(&high, &range, 4));
        assert!(!low.far(&near, &range, 4));
    }

    #[test]
    fn max_queue_end_tracks_the_latest_time() {
        use stars_core::Time;
        let mut p = MaxParam::new(Time::from_secs(10.0));
        p.aggregate(1, &MaxParam::new(Time::from_secs(30.0)), 1);
        assert_eq!(p.value(), Time::from_secs(30.0));
        assert!(p.mse() > 0.0);
    }
}
