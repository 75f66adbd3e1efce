use serde::Deserialize;
use serde::Serialize;
use stars_core::Power;
use stars_core::Slowness;
use stars_core::Time;
use stars_task::TaskProxy;
use stars_task::TaskQueue;

/// Shortest task length the slowness model distinguishes.
pub const MIN_TASK_LENGTH: f64 = 1000.0;

/// One piece of a slowness function: `L(a, n) = x/a + y·a·n + z1·n + z2`.
///
/// `x` carries queue seconds ahead of the hypothetical task, `y` the
/// per-unit-length delay it inflicts on tasks behind it, `z1` the per-task
/// constant (the reciprocal power when the new task dominates), and `z2` the
/// constant slowness of a dominating task unaffected by the new length.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SubFunction {
    pub x: f64,
    pub y: f64,
    pub z1: f64,
    pub z2: f64,
}

impl SubFunction {
    pub fn new(x: f64, y: f64, z1: f64, z2: f64) -> Self {
        Self { x, y, z1, z2 }
    }

    /// Value at task length `a` when `n` tasks of that length are appended.
    pub fn value(&self, a: f64, n: u32) -> f64 {
        self.x / a + self.y * a * n as f64 + self.z1 * n as f64 + self.z2
    }
}

/// Worst-case slowness as a piecewise-rational function of task length.
///
/// Pieces are ordered by start ascending; each applies on
/// `[start_i, start_{i+1})` and the last on `[start_last, ∞)`. No two
/// adjacent pieces carry an equal sub-function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlownessFunction {
    pieces: Vec<(f64, SubFunction)>,
}

impl Default for SlownessFunction {
    fn default() -> Self {
        Self { pieces: vec![(MIN_TASK_LENGTH, SubFunction::default())] }
    }
}

/// Walk the union of piece boundaries of `N` functions in increasing order
/// of start. Within each joint interval the crossing points of the first two
/// functions split it further, so each emitted sub-interval has a single
/// dominant function, reported as the index of the larger of the first two.
fn stepper<const N: usize>(
    fs: [&SlownessFunction; N],
    mut emit: impl FnMut(f64, f64, [&SubFunction; N], usize),
) {
    let mut cur = [0usize; N];
    let mut next = [1usize; N];
    let mut s = MIN_TASK_LENGTH;

    loop {
        // Next joint boundary.
        let mut e = f64::INFINITY;
        let mut next_f = 0;
        for i in 0..N {
            if next[i] < fs[i].pieces.len() && fs[i].pieces[next[i]].0 < e {
                e = fs[i].pieces[next[i]].0;
                next_f = i;
            }
        }

        if e > s {
            let pieces = std::array::from_fn(|i| &fs[i].pieces[cur[i]].1);
            let f0 = pieces[0];
            let f1 = pieces[1 % N];
            // Crossing points of f0 - f1 = c/a + alpha·a + b over (s, e).
            let alpha = f0.y - f1.y;
            let b = f0.z1 - f1.z1 + f0.z2 - f1.z2;
            let c = f0.x - f1.x;
            let mut edges = [s, 0.0, 0.0, 0.0];
            let mut num_edges = 1;
            if alpha == 0.0 {
                if b != 0.0 {
                    let cp = -c / b;
                    if cp > s && cp < e {
                        edges[num_edges] = cp;
                        num_edges += 1;
                    }
                }
            } else if b == 0.0 {
                let cp = -c / alpha;
                if cp > s * s && cp < e * e {
                    edges[num_edges] = cp.sqrt();
                    num_edges += 1;
                }
            } else {
                let square = b * b - 4.0 * alpha * c;
                if square == 0.0 {
                    let cp = -b / (2.0 * alpha);
                    if cp > s && cp < e {
                        edges[num_edges] = cp;
                        num_edges += 1;
                    }
                } else if square > 0.0 {
                    let mut cp1 = (-b + square.sqrt()) / (2.0 * alpha);
                    let mut cp2 = (-b - square.sqrt()) / (2.0 * alpha);
                    if cp1 > cp2 {
                        std::mem::swap(&mut cp1, &mut cp2);
                    }
                    if cp1 > s && cp1 < e {
                        edges[num_edges] = cp1;
                        num_edges += 1;
                    }
                    if cp2 > s && cp2 < e {
                        edges[num_edges] = cp2;
                        num_edges += 1;
                    }
                }
            }
            edges[num_edges] = e;
            num_edges += 1;
            for w in 0..num_edges - 1 {
                let (lo, hi) = (edges[w], edges[w + 1]);
                let mid = if hi < f64::INFINITY { (lo + hi) / 2.0 } else { lo + 1000.0 };
                let max = if c / mid + alpha * mid + b > 0.0 { 0 } else { 1 };
                emit(lo, hi, pieces, max);
            }
        }
        if e.is_infinite() {
            break;
        }
        s = e;
        cur[next_f] = next[next_f];
        next[next_f] += 1;
    }
}

/// Shared per-sub-interval quantities of the squared-difference integral
/// `∫ (f_max - f_min)² da` between the dominant and dominated pieces.
struct SqDiff {
    result: f64,
    val: [f64; 2],
    ah: f64,
    i: usize,
    u: f64,
    v: f64,
    w: f64,
    ab: f64,
    ba: f64,
    ba2: f64,
    ba3: f64,
    fracba: f64,
}

impl SqDiff {
    fn new(lv: u32, rv: u32, ah: f64) -> Self {
        Self {
            result: 0.0,
            val: [lv as f64, rv as f64],
            ah,
            i: 0,
            u: 0.0,
            v: 0.0,
            w: 0.0,
            ab: 0.0,
            ba: 0.0,
            ba2: 0.0,
            ba3: 0.0,
            fracba: 0.0,
        }
    }

    fn step(&mut self, a: f64, b: f64, f: [&SubFunction; 4], max: usize) {
        let b = if b.is_infinite() { self.ah } else { b };
        self.i = max ^ 1;
        self.u = f[max].x - f[self.i].x;
        self.v = f[max].y - f[self.i].y;
        self.w = f[max].z1 - f[self.i].z1 + f[max].z2 - f[self.i].z2;
        self.ab = a * b;
        self.ba = b - a;
        self.ba2 = b * b - a * a;
        self.ba3 = b * b * b - a * a * a;
        self.fracba = b / a;
        let tmp = (self.u * self.u / self.ab + 2.0 * self.u * self.v + self.w * self.w) * self.ba
            + self.w * self.v * self.ba2
            + self.v * self.v * self.ba3 / 3.0
            + 2.0 * self.u * self.w * self.fracba.ln();
        self.result += self.val[self.i] * tmp;
    }
}

impl SlownessFunction {
    /// Single-piece function with the given sub-function.
    pub fn piece(sf: SubFunction) -> Self {
        Self { pieces: vec![(MIN_TASK_LENGTH, sf)] }
    }

    pub fn pieces(&self) -> &[(f64, SubFunction)] {
        &self.pieces
    }

    /// The maximum significant task length.
    pub fn horizon(&self) -> f64 {
        self.pieces.last().map(|p| p.0).unwrap_or(0.0)
    }

    /// Build the worst-slowness function of a task queue.
    ///
    /// For a hypothetical task of variable length appended to `queue`, track
    /// which task dominates the maximum slowness of the min-slowness
    /// schedule, emitting one piece per dominance interval. `switch_values`
    /// must come from [`TaskQueue::switch_values`] on the same queue.
    pub fn from_queue(queue: &TaskQueue, switch_values: &[Slowness], power: Power, now: Time) -> Self {
        if queue.is_empty() {
            log::debug!("{:<32}power {}", "empty queue availability", power);
            return Self::piece(SubFunction::new(0.0, 0.0, 1.0 / power, 0.0));
        }
        log::debug!("{:<32}{} tasks, power {}", "building availability", queue.len(), power);

        let mut tasks: TaskQueue = queue.clone();
        tasks.push(TaskProxy::hypothetical(MIN_TASK_LENGTH, power, now));
        for task in tasks.iter_mut() {
            task.r = (task.rabs - now).seconds();
        }

        let mut pieces: Vec<(f64, SubFunction)> = Vec::new();
        loop {
            // Order the queue for the current candidate length. The new task
            // is at the end of the queue.
            let mut sv = switch_values.to_vec();
            if !sv.is_empty() {
                let back = *tasks.last().expect("nonempty queue");
                for task in tasks.iter().skip(1) {
                    if task.a != back.a {
                        let l = task.r / (back.a - task.a);
                        if l > sv[0] {
                            sv.push(l);
                        }
                    }
                }
                sv.sort_by(f64::total_cmp);
                sv.dedup();
                tasks.sort_min_slowness(&sv, now);
            }

            // Find the new task and the task that sets the maximum slowness.
            let mut tn = 0;
            let mut tm = 0;
            let mut e = tasks[0].t;
            let mut max_slowness = (e - tasks[0].r) / tasks[0].a;
            let mut max_tendency = 0.0;
            tasks[0].tsum = tasks[0].t;
            let mut before_new = true;
            let mut min_before_new = true;
            for i in 1..tasks.len() {
                let mut tendency = if before_new { 0.0 } else { 1.0 / tasks[i].a };
                if tasks[i].id.is_none() {
                    tn = i;
                    tendency = -1.0;
                    tasks[i].tsum = tasks[i - 1].tsum;
                    before_new = false;
                } else {
                    tasks[i].tsum = tasks[i - 1].tsum + tasks[i].t;
                }
                e += tasks[i].t;
                let slowness = (e - tasks[i].r) / tasks[i].a;
                if slowness > max_slowness || (slowness == max_slowness && tendency > max_tendency) {
                    max_slowness = slowness;
                    tm = i;
                    min_before_new = before_new;
                    max_tendency = tendency;
                }
            }

            // Emit the piece for the dominant task and find the nearest task
            // length at which the dominance or the order changes.
            let cur_a = tasks[tn].a;
            let mut min_a = f64::INFINITY;
            let mut candidate = |a: f64| {
                if a > cur_a && a < min_a {
                    min_a = a;
                }
            };
            let quadratic = |b: f64, c: f64| {
                let square = b * b + 4.0 * c;
                if square >= 0.0 { Some((-b + square.sqrt()) / 2.0) } else { None }
            };
            let tmv = tasks[tm];
            let tnv = tasks[tn];

            if tm == tn {
                // The new task itself dominates.
                let sf = SubFunction::new(tmv.tsum, 0.0, 1.0 / power, 0.0);
                if pieces.last().map(|p| p.1 != sf).unwrap_or(true) {
                    pieces.push((cur_a, sf));
                }
                for i in 0..tn {
                    let t = tasks[i];
                    candidate(t.a * tmv.tsum / (t.tsum - t.a / power - t.r));
                }
                for i in tn + 1..tasks.len() {
                    let t = tasks[i];
                    if let Some(a) = quadratic((t.tsum - t.r) * power - t.a, tmv.tsum * t.a * power) {
                        candidate(a);
                    }
                }
                if tn + 1 < tasks.len() {
                    let tn1 = tasks[tn + 1];
                    if let Some(a) = quadratic((tmv.tsum - tn1.r) * power - tn1.a, tmv.tsum * tn1.a * power) {
                        candidate(a);
                    }
                }
                if !sv.is_empty() && sv[0] < max_slowness {
                    let mut i = sv.len() - 1;
                    while sv[i] >= max_slowness {
                        i -= 1;
                    }
                    candidate(tmv.tsum / (sv[i] - 1.0 / power));
                }
            } else if min_before_new {
                // A task ahead of the new one dominates; its slowness does
                // not depend on the new task's length.
                let sf = SubFunction::new(0.0, 0.0, 0.0, (tmv.tsum - tmv.r) / tmv.a);
                if pieces.last().map(|p| p.1 != sf).unwrap_or(true) {
                    pieces.push((cur_a, sf));
                }
                candidate(tmv.a * tnv.tsum / (tmv.tsum - tmv.a / power - tmv.r));
                for i in tn + 1..tasks.len() {
                    let t = tasks[i];
                    candidate((t.a * (tmv.tsum - tmv.r) / tmv.a - t.tsum + t.r) * power);
                }
                if tn + 1 < tasks.len() {
                    let tn1 = tasks[tn + 1];
                    candidate(tn1.a - tmv.a * tn1.r / (tmv.tsum - tmv.r));
                }
            } else {
                // A task behind the new one dominates; it is delayed by the
                // new task's execution time.
                let sf = SubFunction::new(0.0, 1.0 / (tmv.a * power), 0.0, (tmv.tsum - tmv.r) / tmv.a);
                if pieces.last().map(|p| p.1 != sf).unwrap_or(true) {
                    pieces.push((cur_a, sf));
                }
                for i in 0..tn {
                    let t = tasks[i];
                    candidate((tmv.a * (t.tsum - t.r) / t.a - tmv.tsum + tmv.r) * power);
                }
                if let Some(a) = quadratic((tmv.tsum - tmv.r) * power - tmv.a, tnv.tsum * tmv.a * power) {
                    candidate(a);
                }
                for i in tn + 1..tasks.len() {
                    let t = tasks[i];
                    candidate(((tmv.tsum - tmv.r) * t.a - (t.tsum - t.r) * tmv.a) * power / (tmv.a - t.a));
                }
                if tn + 1 < tasks.len() {
                    let tn1 = tasks[tn + 1];
                    if let Some(a) = quadratic(
                        (tmv.tsum - tmv.r) * power - tn1.a,
                        (tmv.a * tn1.r + tn1.a * (tmv.tsum - tmv.r)) * power,
                    ) {
                        candidate(a);
                    }
                }
                if !sv.is_empty() && sv[sv.len() - 1] > max_slowness {
                    let mut i = 0;
                    while sv[i] <= max_slowness {
                        i += 1;
                    }
                    candidate((sv[i] * tmv.a - tmv.tsum + tmv.r) * power);
                }
            }

            if min_a.is_infinite() {
                break;
            }
            // Grow the new task past the boundary and put it back at the end.
            tasks[tn].a = min_a + 1.0;
            tasks[tn].t = tasks[tn].a / power;
            if tn + 1 < tasks.len() {
                let t = tasks.remove(tn);
                tasks.push(t);
            }
        }
        Self { pieces }
    }

    /// Pointwise minimum of two functions.
    pub fn min(l: &Self, r: &Self) -> Self {
        let mut pieces: Vec<(f64, SubFunction)> = Vec::new();
        stepper([l, r], |a, _, f, max| {
            if pieces.last().map(|p| p.1 != *f[max ^ 1]).unwrap_or(true) {
                pieces.push((a, *f[max ^ 1]));
            }
        });
        Self { pieces }
    }

    /// Pointwise maximum of two functions.
    pub fn max(l: &Self, r: &Self) -> Self {
        let mut pieces: Vec<(f64, SubFunction)> = Vec::new();
        stepper([l, r], |a, _, f, max| {
            if pieces.last().map(|p| p.1 != *f[max]).unwrap_or(true) {
                pieces.push((a, *f[max]));
            }
        });
        Self { pieces }
    }

    /// Accumulated-deviation carrier for clustering:
    /// `(max_l + max_r) + lv·(max(l,r) − l) + rv·(max(l,r) − r)` as one
    /// combined piece per sub-interval.
    pub fn max_diff(l: &Self, r: &Self, lv: u32, rv: u32, max_l: &Self, max_r: &Self) -> Self {
        let val = [lv as f64, rv as f64];
        let mut pieces: Vec<(f64, SubFunction)> = Vec::new();
        stepper([l, r, max_l, max_r], |a, _, f, max| {
            let k = val[max ^ 1];
            let sf = SubFunction::new(
                f[2].x + f[3].x + k * (f[max].x - f[max ^ 1].x),
                f[2].y + f[3].y + k * (f[max].y - f[max ^ 1].y),
                f[2].z1 + f[3].z1 + k * (f[max].z1 - f[max ^ 1].z1),
                f[2].z2 + f[3].z2 + k * (f[max].z2 - f[max ^ 1].z2),
            );
            if pieces.last().map(|p| p.1 != sf).unwrap_or(true) {
                pieces.push((a, sf));
            }
        });
        Self { pieces }
    }

    /// Squared difference `∫ (self − other)² da` up to task length `ah`.
    pub fn sqdiff(&self, other: &Self, ah: f64) -> f64 {
        let mut sq = SqDiff::new(1, 1, ah);
        stepper([self, other], |a, b, f, max| {
            sq.step(a, b, [f[0], f[1], f[0], f[1]], max);
        });
        sq.result
    }

    /// Pointwise maximum of `l` and `r`, returning at the same time the
    /// squared loss of approximating both populations (sized `lv` and `rv`,
    /// with accumulated deviations `max_l` and `max_r`) by that maximum.
    pub fn max_and_loss(
        l: &Self,
        r: &Self,
        lv: u32,
        rv: u32,
        max_l: &Self,
        max_r: &Self,
        ah: f64,
    ) -> (Self, f64) {
        let mut sq = SqDiff::new(lv, rv, ah);
        let mut pieces: Vec<(f64, SubFunction)> = Vec::new();
        stepper([l, r, max_l, max_r], |a, b, f, max| {
            if pieces.last().map(|p| p.1 != *f[max]).unwrap_or(true) {
                pieces.push((a, *f[max]));
            }
            sq.step(a, b, f, max);
            // Cross term with the accumulated deviation of the dominated side.
            let lin = 3 - max;
            let u2 = f[lin].x;
            let v2 = f[lin].y;
            let w2 = f[lin].z1 + f[lin].z2;
            let tmp = (sq.u * u2 / sq.ab + u2 * sq.v + sq.u * v2 + sq.w * w2) * sq.ba
                + (sq.w * v2 + sq.v * w2) * sq.ba2 / 2.0
                + sq.v * v2 * sq.ba3 / 3.0
                + (u2 * sq.w + sq.u * w2) * sq.fracba.ln();
            sq.result += 2.0 * tmp;
        });
        (Self { pieces }, sq.result)
    }

    /// The largest difference `l − r` over `[lo, hi)`, clamped at zero.
    fn deficit(l: &SubFunction, r: &SubFunction, lo: f64, hi: f64) -> f64 {
        let dx = l.x - r.x;
        let dy = l.y - r.y;
        let dz = l.z1 - r.z1 + l.z2 - r.z2;
        let at = |a: f64| dx / a + dy * a + dz;
        let mut worst = at(lo).max(at(hi));
        if dy != 0.0 {
            let stationary = dx / dy;
            if stationary > 0.0 {
                let a = stationary.sqrt();
                if a > lo && a < hi {
                    worst = worst.max(at(a));
                }
            }
        }
        worst.max(0.0)
    }

    /// Reduce the piece count to `pieces`, keeping the result an upper
    /// bound of the original. Returns `v` times the squared loss.
    ///
    /// Beam search: each round joins one adjacent pair into an
    /// area-preserving combination (shifted up by its worst deficit so the
    /// reduction stays conservative), keeping the `quality` cheapest
    /// candidates.
    pub fn reduce_max(&mut self, v: u32, ah: f64, pieces: usize, quality: usize) -> f64 {
        let limit = pieces.max(1);
        if self.pieces.len() <= limit {
            return 0.0;
        }
        let mut candidates: Vec<(SlownessFunction, f64)> = vec![(self.clone(), 0.0)];
        while candidates[0].0.pieces.len() > limit {
            let (best, _) = candidates.remove(0);
            for cur in 1..best.pieces.len() {
                let prev = cur - 1;
                let a = best.pieces[prev].0;
                let b = best.pieces[cur].0;
                let c = if cur + 1 < best.pieces.len() { best.pieces[cur + 1].0 } else { ah };
                let pc = (b - a) / (c - a);
                let cc = (c - b) / (c - a);
                let (pf, cf) = (best.pieces[prev].1, best.pieces[cur].1);
                let mut join = SubFunction::new(
                    pf.x * pc + cf.x * cc,
                    pf.y * pc + cf.y * cc,
                    pf.z1 * pc + cf.z1 * cc,
                    pf.z2 * pc + cf.z2 * cc,
                );
                let shortfall = Self::deficit(&pf, &join, a, b).max(Self::deficit(&cf, &join, b, c));
                join.z2 += shortfall;
                let mut pieces = Vec::with_capacity(best.pieces.len() - 1);
                pieces.extend_from_slice(&best.pieces[..prev]);
                pieces.push((a, join));
                pieces.extend_from_slice(&best.pieces[cur + 1..]);
                let func = SlownessFunction { pieces };
                let cost = func.sqdiff(self, ah);
                let at = candidates
                    .binary_search_by(|probe| probe.1.total_cmp(&cost))
                    .unwrap_or_else(|e| e);
                candidates.insert(at, (func, cost));
                candidates.truncate(quality);
            }
        }
        let (reduced, cost) = candidates.swap_remove(0);
        self.pieces = reduced.pieces;
        v as f64 * cost
    }

    /// Shift the release-time reference of every piece from `old` to `new`,
    /// recomputing the boundaries the shift invalidates.
    pub fn modify_reference(&mut self, old: Time, new: Time) {
        let difference = (new - old).seconds();
        for i in 0..self.pieces.len() {
            if self.pieces[i].1.x > 0.0 {
                self.pieces[i].1.x = (self.pieces[i].1.x - difference).max(0.0);
            }
            if i + 1 < self.pieces.len() {
                let it = self.pieces[i].1;
                let next = self.pieces[i + 1].1;
                let alpha = it.y - next.y;
                let b = it.z1 - next.z1 + it.z2 - next.z2;
                let c = it.x - next.x;
                if alpha == 0.0 {
                    if b != 0.0 {
                        self.pieces[i + 1].0 = -c / b + 1.0;
                    }
                } else {
                    let square = b * b - 4.0 * alpha * c;
                    if square >= 0.0 {
                        let root = if alpha < 0.0 {
                            (-b - square.sqrt()) / (2.0 * alpha)
                        } else {
                            (-b + square.sqrt()) / (2.0 * alpha)
                        };
                        self.pieces[i + 1].0 = root + 1.0;
                    }
                }
            }
        }
    }

    /// Slowness reached by one task of length `a`.
    pub fn slowness(&self, a: u64) -> Slowness {
        let a = a as f64;
        let mut it = 0;
        while it + 1 < self.pieces.len() && self.pieces[it + 1].0 < a {
            it += 1;
        }
        self.pieces[it].1.value(a, 1)
    }

    /// Slowness reached when `n` tasks of length `a` are appended. For
    /// `n > 1` the stored boundaries no longer apply, so each boundary is
    /// recomputed from the piece-crossing equation before advancing.
    pub fn estimate_slowness(&self, a: u64, n: u32) -> Slowness {
        let a = a as f64;
        let mut it = 0;
        while it + 1 < self.pieces.len() {
            let cur = self.pieces[it].1;
            let next = self.pieces[it + 1].1;
            let alpha = n as f64 * (cur.y - next.y);
            let b = n as f64 * (cur.z1 - next.z1) + cur.z2 - next.z2;
            let c = cur.x - next.x;
            let mut limit = self.pieces[it + 1].0;
            if alpha == 0.0 {
                if b != 0.0 {
                    limit = -c / b + 1.0;
                }
            } else {
                let square = b * b - 4.0 * alpha * c;
                if square >= 0.0 {
                    limit = if alpha < 0.0 {
                        (-b - square.sqrt()) / (2.0 * alpha) + 1.0
                    } else {
                        (-b + square.sqrt()) / (2.0 * alpha) + 1.0
                    };
                }
            }
            if limit < a {
                it += 1;
            } else {
                break;
            }
        }
        self.pieces[it].1.value(a, n)
    }

    /// Fold a committed assignment of `n` tasks of length `length` into the
    /// function: the queue extension lands in the hyperbolic term where the
    /// new task dominates and in the constant term where a later task does.
    pub fn update(&mut self, length: u64, n: u32) {
        for (_, sf) in self.pieces.iter_mut() {
            sf.x += sf.z1 * length as f64 * n as f64;
            sf.z2 += sf.y * length as f64 * n as f64;
        }
    }

    /// The largest per-task constant, i.e. the reciprocal speed of the
    /// slowest represented machine.
    pub fn slowest_machine(&self) -> f64 {
        self.pieces.iter().map(|p| p.1.z1).fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stars_core::Duration;

    fn queue(specs: &[(f64, f64)], power: f64, now: Time) -> TaskQueue {
        specs
            .iter()
            .enumerate()
            .map(|(i, &(a, ago))| TaskProxy::new(i as u32, a, a / power, now - Duration::from_secs(ago)))
            .collect::<Vec<_>>()
            .into()
    }

    fn build(specs: &[(f64, f64)], power: f64, now: Time) -> SlownessFunction {
        let q = queue(specs, power, now);
        let sv = q.switch_values(now);
        SlownessFunction::from_queue(&q, &sv, power, now)
    }

    #[test]
    fn empty_queue_is_a_single_reciprocal_power_piece() {
        let f = SlownessFunction::from_queue(&TaskQueue::default(), &[], 1000.0, Time::ZERO);
        assert_eq!(f.pieces(), &[(MIN_TASK_LENGTH, SubFunction::new(0.0, 0.0, 0.001, 0.0))]);
        assert_eq!(f.slowness(5000), 0.001);
        assert_eq!(f.slowness(500000), 0.001);
    }

    #[test]
    fn one_queued_task_shifts_the_hyperbolic_term() {
        let now = Time::from_secs(100.0);
        let f = build(&[(10000.0, 5.0)], 1000.0, now);
        // The queued task finishes 10s from now; a same-length task appended
        // behind it reaches slowness (10 + 10) / 10000 with 5s already spent
        // waiting charged to the queue head.
        let got = f.estimate_slowness(10000, 1);
        assert!((got - 0.0015).abs() < 1e-9, "slowness {}", got);
    }

    #[test]
    fn pointwise_extrema_match_sampling() {
        let now = Time::from_secs(1000.0);
        let l = build(&[(4000.0, 2.0), (9000.0, 11.0), (2000.0, 5.0)], 800.0, now);
        let r = build(&[(12000.0, 1.0), (3000.0, 6.0)], 1500.0, now);
        let lo = SlownessFunction::min(&l, &r);
        let hi = SlownessFunction::max(&l, &r);
        let mut a = MIN_TASK_LENGTH as u64;
        while a < 200000 {
            let (lv, rv) = (l.slowness(a), r.slowness(a));
            assert!((lo.slowness(a) - lv.min(rv)).abs() < 1e-9, "min at {}", a);
            assert!((hi.slowness(a) - lv.max(rv)).abs() < 1e-9, "max at {}", a);
            a += 731;
        }
    }

    #[test]
    fn sqdiff_is_nonnegative_and_zero_on_self() {
        let now = Time::from_secs(50.0);
        let l = build(&[(5000.0, 3.0), (7000.0, 9.0)], 1000.0, now);
        let r = build(&[(2500.0, 1.0)], 600.0, now);
        let h = l.horizon().max(r.horizon()) + 100000.0;
        assert!(l.sqdiff(&r, h) >= 0.0);
        assert!(l.sqdiff(&l, h).abs() < 1e-6);
    }

    #[test]
    fn max_and_loss_agrees_with_max() {
        let now = Time::from_secs(10.0);
        let l = build(&[(5000.0, 2.0)], 1000.0, now);
        let r = build(&[(8000.0, 4.0), (1000.0, 1.0)], 2000.0, now);
        let h = l.horizon().max(r.horizon()) + 50000.0;
        let (joined, loss) = SlownessFunction::max_and_loss(&l, &r, 1, 1, &l, &r, h);
        let expect = SlownessFunction::max(&l, &r);
        assert_eq!(joined, expect);
        assert!(loss.is_finite());
    }

    #[test]
    fn reduce_max_stays_above_the_original() {
        let now = Time::from_secs(500.0);
        let specs = [
            (3000.0, 2.0),
            (15000.0, 8.0),
            (2000.0, 1.0),
            (9000.0, 14.0),
            (4000.0, 4.0),
            (22000.0, 6.0),
            (5000.0, 3.0),
        ];
        let original = build(&specs, 1200.0, now);
        let mut reduced = original.clone();
        let h = original.horizon() + 100000.0;
        let cost = reduced.reduce_max(2, h, 3, 10);
        assert!(reduced.pieces().len() <= 3);
        assert!(cost >= 0.0);
        let mut a = MIN_TASK_LENGTH as u64 + 1;
        while (a as f64) < h {
            assert!(
                reduced.slowness(a) >= original.slowness(a) - 1e-9,
                "dipped below at {}",
                a
            );
            a += 997;
        }
    }

    #[test]
    fn update_reflects_the_assignment_immediately() {
        let power = 1000.0;
        let mut f = SlownessFunction::from_queue(&TaskQueue::default(), &[], power, Time::ZERO);
        f.update(10000, 1);
        // One committed task of length 10000 waits 10s ahead of any new task.
        let got = f.slowness(10000);
        assert!((got - 0.002).abs() < 1e-9, "slowness {}", got);
        let original = SlownessFunction::from_queue(&TaskQueue::default(), &[], power, Time::ZERO);
        let mut a = 2000;
        while a < 100000 {
            assert!(f.slowness(a) >= original.slowness(a));
            a += 1371;
        }
    }

    #[test]
    fn reference_shift_drains_the_queue_term() {
        let now = Time::from_secs(100.0);
        let mut f = build(&[(10000.0, 5.0)], 1000.0, now);
        let x0 = f.pieces()[0].1.x;
        assert!(x0 > 0.0);
        f.modify_reference(now, now + Duration::from_secs(4.0));
        assert!((f.pieces()[0].1.x - (x0 - 4.0)).abs() < 1e-9);
        f.modify_reference(now, now + Duration::from_secs(1000.0));
        assert_eq!(f.pieces()[0].1.x, 0.0);
    }

    #[test]
    fn slowest_machine_is_the_largest_reciprocal_speed() {
        let f = SlownessFunction::from_queue(&TaskQueue::default(), &[], 500.0, Time::ZERO);
        assert_eq!(f.slowest_machine(), 0.002);
    }

    #[test]
    fn serialization_round_trips() {
        let now = Time::from_secs(5.0);
        let f = build(&[(4000.0, 2.0)], 1000.0, now);
        let json = serde_json::to_string(&f).expect("serialize");
        let back: SlownessFunction = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(f, back);
    }
}
