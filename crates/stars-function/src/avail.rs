use serde::Deserialize;
use serde::Serialize;
use stars_core::Duration;
use stars_core::Power;
use stars_core::Time;

/// Cumulative available computation as a piecewise-linear function of time.
///
/// Points are `(instant, availability)` pairs in increasing time order;
/// between points the function interpolates linearly and past the last point
/// it grows at `slope` units per second. An empty point list means the node
/// is free: availability grows at `slope` from the present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AvailFunction {
    points: Vec<(Time, u64)>,
    slope: f64,
}

/// Walk the union of slope-change points of `N` functions over
/// `[reference, horizon)`, splitting each joint interval at the crossing
/// point of the first two functions so every emitted sub-interval has a
/// fixed minimum. `min` is the index of the smaller of the first two.
fn stepper<const N: usize>(
    fs: [&AvailFunction; N],
    reference: Time,
    horizon: Time,
    mut step: impl FnMut(Time, Time, &[f64; N], &[f64; N], usize),
) {
    let mut a = reference;
    let mut it = [0usize; N];
    let mut fa = [0.0f64; N];
    let mut m = [0.0f64; N];
    let mut last = [(a, 0.0f64); N];

    for i in 0..N {
        if let Some(first) = fs[i].points.first() {
            if first.0 < a {
                a = first.0;
            }
        }
        m[i] = if fs[i].points.is_empty() { fs[i].slope } else { 0.0 };
    }
    for point in last.iter_mut() {
        point.0 = a;
    }

    while a < horizon {
        // Next slope-change point.
        let mut next = 0;
        let mut b = horizon;
        for i in 0..N {
            if it[i] < fs[i].points.len() && fs[i].points[it[i]].0 < b {
                b = fs[i].points[it[i]].0;
                next = i;
            }
        }

        if b > a {
            let fb0 = last[0].1 + m[0] * (b - last[0].0).seconds();
            let fb1 = last[1 % N].1 + m[1 % N] * (b - last[1 % N].0).seconds();
            let order = if fa[0] < fa[1 % N] || (fa[0] == fa[1 % N] && m[0] < m[1 % N]) { 0 } else { 1 };
            if (fb0 - fb1) * (fa[0] - fa[1 % N]) < 0.0 {
                // The first two functions cross inside; emit two segments.
                let bb = a + Duration::from_secs((fa[1 % N] - fa[0]) / (m[0] - m[1 % N]));
                if bb > a {
                    step(a, bb, &fa, &m, order);
                    for i in 0..N {
                        fa[i] = last[i].1 + m[i] * (bb - last[i].0).seconds();
                    }
                }
                if b > bb {
                    step(bb, b, &fa, &m, order ^ 1);
                    for i in 0..N {
                        fa[i] = last[i].1 + m[i] * (b - last[i].0).seconds();
                    }
                }
            } else {
                step(a, b, &fa, &m, order);
                for i in 0..N {
                    fa[i] = last[i].1 + m[i] * (b - last[i].0).seconds();
                }
            }
        }
        a = b;
        if it[next] < fs[next].points.len() {
            last[next] = (fs[next].points[it[next]].0, fs[next].points[it[next]].1 as f64);
            fa[next] = last[next].1;
            it[next] += 1;
        }
        m[next] = if it[next] == fs[next].points.len() {
            fs[next].slope
        } else {
            (fs[next].points[it[next]].1 as f64 - fa[next])
                / (fs[next].points[it[next]].0 - a).seconds()
        };
    }
}

/// Envelope collector: records a point whenever the tracked slope changes.
struct EnvelopePoints {
    points: Vec<(Time, u64)>,
    mm: f64,
    lasty: f64,
}

impl EnvelopePoints {
    fn new(capacity: usize) -> Self {
        Self { points: Vec::with_capacity(capacity), mm: 0.0, lasty: 0.0 }
    }

    fn step(&mut self, a: Time, b: Time, fa: &[f64], m: &[f64], i: usize) {
        if self.mm != m[i] {
            self.points.push((a, fa[i] as u64));
            self.mm = m[i];
        }
        self.lasty = fa[i] + m[i] * (b - a).seconds();
    }
}

/// Squared-difference integral between the larger and smaller of the first
/// two walked functions, with per-side population weights.
struct SqDiff {
    result: f64,
    val: [f64; 2],
    reference: Time,
    i: usize,
    n1: f64,
    n2: f64,
    dt: f64,
    cta: f64,
    k: f64,
}

impl SqDiff {
    fn new(lv: u32, rv: u32, reference: Time) -> Self {
        Self {
            result: 0.0,
            val: [lv as f64, rv as f64],
            reference,
            i: 0,
            n1: 0.0,
            n2: 0.0,
            dt: 0.0,
            cta: 0.0,
            k: 0.0,
        }
    }

    fn step(&mut self, a: Time, b: Time, fa: &[f64], m: &[f64], min: usize) {
        self.i = min ^ 1;
        self.n1 = fa[self.i] - fa[min];
        self.n2 = m[self.i] - m[min];
        if self.n1 == 0.0 && self.n2 == 0.0 {
            return;
        }
        self.dt = (b - a).seconds();
        // One second past the reference avoids the pole of the 1/t weight.
        self.cta = (a - self.reference).seconds() + 1.0;
        self.k = self.n1 - self.n2 * self.cta;
        let r = self.val[self.i]
            * (self.n2 * self.n2 * self.dt
                + 2.0 * self.n2 * self.k * (self.dt / self.cta + 1.0).ln()
                + self.k * self.k * self.dt / (self.cta * (self.dt + self.cta)));
        // Rounding can push tiny results negative.
        self.result += r.max(0.0);
    }

    /// Cross term against the accumulated deviation walked at index `3 - min`.
    fn loss_step(&mut self, _a: Time, _b: Time, fa: &[f64], m: &[f64], min: usize) {
        if self.n1 == 0.0 && self.n2 == 0.0 {
            return;
        }
        let lin = 3 - min;
        if lin >= fa.len() {
            return;
        }
        let n3 = m[lin] - m[self.i];
        let t = fa[lin] - fa[self.i] - n3 * self.cta;
        let r = 2.0
            * self.val[self.i]
            * (self.n2 * n3 * self.dt
                + (self.k * n3 + self.n2 * t) * (self.dt / self.cta + 1.0).ln()
                + self.k * t * self.dt / (self.cta * (self.dt + self.cta)));
        self.result += r.max(0.0);
    }
}

impl AvailFunction {
    /// Build from an execution profile: `times` is an even-length sequence of
    /// instants bounding alternating free intervals, over which availability
    /// accumulates at `power` units per second.
    pub fn from_profile(power: Power, times: &[Time]) -> Self {
        assert!(times.len() % 2 == 0, "profile must pair interval bounds");
        let mut points = Vec::with_capacity(times.len());
        let mut avail = 0u64;
        for pair in times.chunks(2) {
            points.push((pair[0], avail));
            avail += ((pair[1] - pair[0]).seconds() * power) as u64;
            points.push((pair[1], avail));
        }
        Self { points, slope: power }
    }

    /// A node with nothing queued: availability grows at `power` immediately.
    pub fn free(power: Power) -> Self {
        Self { points: Vec::new(), slope: power }
    }

    pub fn points(&self) -> &[(Time, u64)] {
        &self.points
    }

    pub fn slope(&self) -> f64 {
        self.slope
    }

    /// Whether this function represents a completely free node.
    pub fn is_free(&self) -> bool {
        self.points.is_empty()
    }

    /// Time of the last recorded point; a free function is meaningful one
    /// second past the present.
    pub fn horizon(&self, now: Time) -> Time {
        self.points.last().map(|p| p.0).unwrap_or(now + Duration::from_secs(1.0))
    }

    /// Conservative (pointwise-minimum) envelope of two functions.
    pub fn min(l: &Self, r: &Self, now: Time) -> Self {
        let mut out = Self::default();
        if !l.points.is_empty() || !r.points.is_empty() {
            let horizon = if l.points.is_empty() {
                r.points.last().expect("nonempty").0
            } else {
                l.points.last().expect("nonempty").0
            };
            let mut env = EnvelopePoints::new(2 * l.points.len().max(r.points.len()));
            stepper([l, r], now, horizon, |a, b, fa, m, i| env.step(a, b, fa, m, i));
            env.points.push((horizon, env.lasty as u64));
            out.points = env.points;
        }
        out.slope = l.slope.min(r.slope);
        out
    }

    /// Optimistic (pointwise-maximum) envelope of two functions.
    pub fn max(l: &Self, r: &Self, now: Time) -> Self {
        let mut out = Self::default();
        if !l.points.is_empty() || !r.points.is_empty() {
            let horizon = if l.points.is_empty() {
                r.points.last().expect("nonempty").0
            } else {
                l.points.last().expect("nonempty").0
            };
            let mut env = EnvelopePoints::new(2 * l.points.len().max(r.points.len()));
            stepper([l, r], now, horizon, |a, b, fa, m, i| env.step(a, b, fa, m, i ^ 1));
            env.points.push((horizon, env.lasty as u64));
            out.points = env.points;
        }
        out.slope = l.slope.max(r.slope);
        out
    }

    /// Squared difference against another function over `[reference, h)`,
    /// weighted toward the present by `1/t`.
    pub fn sqdiff(&self, other: &Self, reference: Time, h: Time) -> f64 {
        let mut sq = SqDiff::new(1, 1, reference);
        stepper([self, other], reference, h, |a, b, fa, m, i| sq.step(a, b, fa, m, i));
        sq.result
    }

    /// Pointwise minimum of `l` and `r` together with the squared loss of
    /// approximating both populations (sized `lv`, `rv`, with accumulated
    /// deviations `lc`, `rc`) by that minimum.
    pub fn min_and_loss(
        l: &Self,
        r: &Self,
        lv: u32,
        rv: u32,
        lc: &Self,
        rc: &Self,
        reference: Time,
        h: Time,
    ) -> (Self, f64) {
        let size = l.points.len().max(r.points.len());
        let mut env = EnvelopePoints::new(2 * size);
        let mut sq = SqDiff::new(lv, rv, reference);
        stepper([l, r, lc, rc], reference, h, |a, b, fa, m, i| {
            env.step(a, b, fa, m, i);
            sq.step(a, b, fa, m, i);
            sq.loss_step(a, b, fa, m, i);
        });
        let mut out = Self::default();
        if size > 0 {
            env.points.push((h, env.lasty as u64));
            out.points = env.points;
        }
        out.slope = l.slope.min(r.slope);
        (out, sq.result)
    }

    /// Reduce the point count to the configured bound, keeping the result a
    /// lower bound of the original. Returns the weighted squared loss
    /// against the population this function represents.
    ///
    /// Candidate moves per round: under a concave corner, drop the middle
    /// point (the chord lies below); under a convex corner, replace the two
    /// flanking points by the intersection of the extended edges (which lies
    /// below a convex polyline). A quality-bounded beam keeps the cheapest
    /// reductions.
    pub fn reduce_min(
        &mut self,
        v: u32,
        accum_max: &Self,
        reference: Time,
        h: Time,
        points: usize,
        quality: usize,
    ) -> f64 {
        let limit = points.max(2);
        if self.points.len() <= limit {
            return 0.0;
        }
        let original = self.clone();
        let mut candidates: Vec<(AvailFunction, f64)> = vec![(self.clone(), 0.0)];
        while candidates[0].0.points.len() > limit {
            let (best, best_cost) = candidates.remove(0);
            let generated = candidates.len();
            let pts = &best.points;
            let mut prevm = 0.0;
            let mut curm = 0.0;
            let mut prev = 0;
            for cur in 0..pts.len() - 1 {
                let next = cur + 1;
                let nextm =
                    (pts[next].1 as f64 - pts[cur].1 as f64) / (pts[next].0 - pts[cur].0).seconds();
                if nextm <= curm || curm > prevm {
                    let mut points = Vec::with_capacity(pts.len() - 1);
                    if nextm <= curm {
                        // Concave corner: chord under the arc.
                        points.extend_from_slice(&pts[..cur]);
                        points.extend_from_slice(&pts[next..]);
                    } else {
                        // Convex corner: extended edges meet below.
                        let diffx = (pts[prev].1 as f64
                            + nextm * (pts[cur].0 - pts[prev].0).seconds()
                            - pts[cur].1 as f64)
                            / (nextm - prevm);
                        points.extend_from_slice(&pts[..prev]);
                        points.push((
                            pts[prev].0 + Duration::from_secs(diffx),
                            (pts[prev].1 as f64 + prevm * diffx) as u64,
                        ));
                        points.extend_from_slice(&pts[next..]);
                    }
                    let func = AvailFunction { points, slope: self.slope };
                    let mut sq = SqDiff::new(v, 0, reference);
                    stepper([&original, &func, accum_max], reference, h, |a, b, fa, m, i| {
                        sq.step(a, b, fa, m, i);
                        sq.loss_step(a, b, fa, m, i);
                    });
                    let cost = sq.result;
                    let at = candidates
                        .binary_search_by(|probe| probe.1.total_cmp(&cost))
                        .unwrap_or_else(|e| e);
                    candidates.insert(at, (func, cost));
                    candidates.truncate(quality.max(1));
                }
                prevm = curm;
                curm = nextm;
                prev = cur;
            }
            if candidates.len() == generated {
                // No corner qualified for elimination; keep what we have.
                self.points = best.points;
                return best_cost;
            }
        }
        let (reduced, cost) = candidates.swap_remove(0);
        self.points = reduced.points;
        cost
    }

    /// Reduce the point count keeping the result an upper bound of the
    /// original; the dual of [`Self::reduce_min`].
    pub fn reduce_max(&mut self, reference: Time, h: Time, points: usize, quality: usize) -> f64 {
        let limit = points.max(2);
        if self.points.len() <= limit {
            return 0.0;
        }
        let original = self.clone();
        let mut candidates: Vec<(AvailFunction, f64)> = vec![(self.clone(), 0.0)];
        while candidates[0].0.points.len() > limit {
            let (best, best_cost) = candidates.remove(0);
            let generated = candidates.len();
            let pts = &best.points;
            let mut prev = 0;
            let mut prevm = 0.0;
            let mut curm = (pts[1].1 as f64 - pts[0].1 as f64) / (pts[1].0 - pts[0].0).seconds();
            for cur in 1..pts.len() - 1 {
                let next = cur + 1;
                let nextm =
                    (pts[next].1 as f64 - pts[cur].1 as f64) / (pts[next].0 - pts[cur].0).seconds();
                if nextm > curm || curm <= prevm {
                    let mut points = Vec::with_capacity(pts.len() - 1);
                    if nextm <= curm {
                        // Concave corner: extended edges meet above.
                        let diffx = (pts[cur].1 as f64
                            - nextm * (pts[cur].0 - pts[prev].0).seconds()
                            - pts[prev].1 as f64)
                            / (prevm - nextm);
                        points.extend_from_slice(&pts[..prev]);
                        points.push((
                            pts[prev].0 + Duration::from_secs(diffx),
                            (pts[prev].1 as f64 + prevm * diffx) as u64,
                        ));
                        points.extend_from_slice(&pts[next..]);
                    } else {
                        // Convex corner: chord over the arc.
                        points.extend_from_slice(&pts[..cur]);
                        points.extend_from_slice(&pts[next..]);
                    }
                    let func = AvailFunction { points, slope: self.slope };
                    let mut sq = SqDiff::new(1, 0, reference);
                    stepper([&func, &original], reference, h, |a, b, fa, m, i| {
                        sq.step(a, b, fa, m, i);
                    });
                    let cost = sq.result;
                    let at = candidates
                        .binary_search_by(|probe| probe.1.total_cmp(&cost))
                        .unwrap_or_else(|e| e);
                    candidates.insert(at, (func, cost));
                    candidates.truncate(quality.max(1));
                }
                prevm = curm;
                curm = nextm;
                prev = cur;
            }
            if candidates.len() == generated {
                // No corner qualified for elimination; keep what we have.
                self.points = best.points;
                return best_cost;
            }
        }
        let (reduced, cost) = candidates.swap_remove(0);
        self.points = reduced.points;
        cost
    }

    /// Computation available before deadline `d`, seen from `now`.
    pub fn availability_before(&self, d: Time, now: Time) -> u64 {
        if self.points.is_empty() {
            if d > now { (self.slope * (d - now).seconds()) as u64 } else { 0 }
        } else if d <= now || d < self.points[0].0 {
            0
        } else {
            let mut prev = 0;
            let mut next = 1;
            while next < self.points.len() && self.points[next].0 < d {
                prev = next;
                next += 1;
            }
            let (pt, pv) = self.points[prev];
            if next == self.points.len() {
                pv + ((d - pt).seconds() * self.slope) as u64
            } else {
                let (nt, nv) = self.points[next];
                if nt == pt {
                    pv
                } else {
                    pv + ((d - pt).seconds() * (nv as f64 - pv as f64) / (nt - pt).seconds()) as u64
                }
            }
        }
    }

    /// Carve a committed task of `length` computation units, due by
    /// `deadline`, out of the function. The availability at and after the
    /// deadline drops by `length`; the reclaimed room is flattened into a
    /// plateau ending at the deadline.
    pub fn update(&mut self, length: u64, deadline: Time, horizon: Time, now: Time) {
        if self.points.is_empty() {
            let start = now + Duration::from_secs(length as f64 / self.slope);
            let horizon = horizon.max(start);
            let end_avail = (self.slope * (horizon - start).seconds()) as u64;
            self.points.push((start, 0));
            self.points.push((horizon, end_avail));
            return;
        }
        // Last point at or before the deadline, and the availability there.
        let mut prev = self.points[0];
        let mut last_elim = 0;
        while last_elim < self.points.len() && self.points[last_elim].0 <= deadline {
            prev = self.points[last_elim];
            last_elim += 1;
        }
        let at_deadline = if last_elim == self.points.len() {
            prev.1
        } else {
            let (nt, nv) = self.points[last_elim];
            prev.1
                + ((deadline - prev.0).seconds() * (nv as f64 - prev.1 as f64)
                    / (nt - prev.0).seconds()) as u64
        };
        debug_assert!(at_deadline >= length, "assignment exceeds availability");
        let final_avail = at_deadline - length;
        // First point whose availability reaches the post-assignment level.
        let mut prev = self.points[0];
        let mut first_elim = 0;
        while first_elim < last_elim && self.points[first_elim].1 < final_avail {
            prev = self.points[first_elim];
            first_elim += 1;
        }
        let (ft, fv) = self.points[first_elim];
        let task_start = prev.0
            + Duration::from_secs(
                (final_avail as f64 - prev.1 as f64) * (ft - prev.0).seconds()
                    / (fv as f64 - prev.1 as f64),
            );
        let mut points = Vec::with_capacity(self.points.len() - last_elim + first_elim + 2);
        points.extend_from_slice(&self.points[..first_elim]);
        points.push((task_start, final_avail));
        points.push((deadline, final_avail));
        for &(t, v) in &self.points[last_elim..] {
            points.push((t, v - length));
        }
        self.points = points;
    }
}
