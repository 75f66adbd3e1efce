use serde::Deserialize;
use serde::Serialize;
use stars_clustering::Cluster;
use stars_clustering::ClusteringList;
use stars_core::Power;
use stars_core::Slowness;
use stars_core::Time;
use stars_core::config;
use stars_function::Interval;
use stars_function::MinParam;
use stars_function::SlownessFunction;
use stars_task::TaskDescription;
use stars_task::TaskQueue;

/// Memory and disk floors plus the worst-case slowness envelope of a
/// population of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdlCluster {
    pub value: u32,
    pub min_mem: MinParam<u32>,
    pub min_disk: MinParam<u32>,
    pub max_slowness: SlownessFunction,
    pub accum_lsq: f64,
    pub accum_max_slowness: SlownessFunction,
}

impl MdlCluster {
    pub fn new(mem: u32, disk: u32, max_slowness: SlownessFunction) -> Self {
        Self {
            value: 1,
            min_mem: MinParam::new(mem),
            min_disk: MinParam::new(disk),
            accum_lsq: 0.0,
            accum_max_slowness: max_slowness.clone(),
            max_slowness,
        }
    }

    pub fn fulfills(&self, req: &TaskDescription) -> bool {
        self.min_mem.value() >= req.max_memory && self.min_disk.value() >= req.max_disk
    }

    /// Charge the piece-count reduction of the envelopes to the accumulated
    /// error.
    fn reduce(&mut self, ctx: &SlownessCtx) {
        self.accum_lsq += self.max_slowness.reduce_max(self.value, ctx.length_horizon, ctx.num_pieces, 10);
        self.accum_max_slowness.reduce_max(1, ctx.length_horizon, ctx.num_pieces, 10);
    }
}

/// Normalization context of the fair-slowness policy.
#[derive(Debug, Clone)]
pub struct SlownessCtx {
    pub memory: Interval<u32>,
    pub disk: Interval<u32>,
    /// Squared difference between the summary's extremum envelopes.
    pub slowness_range: f64,
    pub length_horizon: f64,
    pub min_fn: SlownessFunction,
    pub intervals: usize,
    pub num_pieces: usize,
}

impl Cluster for MdlCluster {
    type Ctx = SlownessCtx;

    fn weight(&self) -> u32 {
        self.value
    }

    fn invalidate(&mut self) {
        self.value = 0;
    }

    fn far(&self, other: &Self, ctx: &Self::Ctx) -> bool {
        if self.min_mem.far(&other.min_mem, &ctx.memory, ctx.intervals)
            || self.min_disk.far(&other.min_disk, &ctx.disk, ctx.intervals)
        {
            return true;
        }
        if ctx.slowness_range != 0.0 {
            let scale = ctx.intervals as f64 / ctx.slowness_range;
            let own = (self.max_slowness.sqdiff(&ctx.min_fn, ctx.length_horizon) * scale).floor();
            let theirs = (other.max_slowness.sqdiff(&ctx.min_fn, ctx.length_horizon) * scale).floor();
            if own != theirs {
                return true;
            }
        }
        false
    }

    fn distance(&self, other: &Self, ctx: &Self::Ctx) -> (f64, Self) {
        let mut sum = self.clone();
        sum.merge(other, ctx);
        let mut d = sum.min_mem.norm(&ctx.memory, sum.value) + sum.min_disk.norm(&ctx.disk, sum.value);
        if ctx.slowness_range != 0.0 {
            d += sum.accum_lsq / (sum.value as f64 * ctx.slowness_range);
        }
        (d, sum)
    }

    fn merge(&mut self, other: &Self, ctx: &Self::Ctx) {
        let (max_slowness, loss) = SlownessFunction::max_and_loss(
            &self.max_slowness,
            &other.max_slowness,
            self.value,
            other.value,
            &self.accum_max_slowness,
            &other.accum_max_slowness,
            ctx.length_horizon,
        );
        self.accum_lsq += other.accum_lsq + loss;
        self.accum_max_slowness = SlownessFunction::max_diff(
            &self.max_slowness,
            &other.max_slowness,
            self.value,
            other.value,
            &self.accum_max_slowness,
            &other.accum_max_slowness,
        );
        self.max_slowness = max_slowness;
        self.min_mem.aggregate(self.value, &other.min_mem, other.value);
        self.min_disk.aggregate(self.value, &other.min_disk, other.value);
        self.value += other.value;
    }
}

/// Fair-slowness summary: how the worst per-task slowness of a subtree
/// changes when new tasks are assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlownessSummary {
    summary: ClusteringList<MdlCluster>,
    memory: Option<Interval<u32>>,
    disk: Option<Interval<u32>>,
    min_fn: SlownessFunction,
    max_fn: SlownessFunction,
    length_horizon: f64,
    minimum_slowness: Slowness,
    maximum_slowness: Slowness,
    /// Release-time reference shared by every function in the summary.
    rkref: Time,
}

impl Default for SlownessSummary {
    fn default() -> Self {
        Self {
            summary: ClusteringList::default(),
            memory: None,
            disk: None,
            min_fn: SlownessFunction::default(),
            max_fn: SlownessFunction::default(),
            length_horizon: 0.0,
            minimum_slowness: 0.0,
            maximum_slowness: 0.0,
            rkref: Time::ZERO,
        }
    }
}

impl SlownessSummary {
    pub fn summary(&self) -> &ClusteringList<MdlCluster> {
        &self.summary
    }

    pub fn minimum_slowness(&self) -> Slowness {
        self.minimum_slowness
    }

    pub fn set_minimum_slowness(&mut self, min: Slowness) {
        self.minimum_slowness = min;
    }

    pub fn maximum_slowness(&self) -> Slowness {
        self.maximum_slowness
    }

    pub fn set_maximum_slowness(&mut self, max: Slowness) {
        self.maximum_slowness = max;
    }

    pub fn rk_reference(&self) -> Time {
        self.rkref
    }

    /// The largest reciprocal speed represented in the summary.
    pub fn slowest_machine(&self) -> f64 {
        self.max_fn.slowest_machine()
    }

    /// Initialize the singleton summary of a leaf from its local queue.
    pub fn set_availability(
        &mut self,
        mem: u32,
        disk: u32,
        queue: &TaskQueue,
        power: Power,
        min_slowness: Slowness,
        now: Time,
    ) {
        let switch_values = queue.switch_values(now);
        let function = SlownessFunction::from_queue(queue, &switch_values, power, now);
        self.memory = Some(Interval::at(mem));
        self.disk = Some(Interval::at(disk));
        self.minimum_slowness = min_slowness;
        self.maximum_slowness = min_slowness;
        self.summary.clear();
        self.summary.push(MdlCluster::new(mem, disk, function.clone()));
        self.length_horizon = function.horizon();
        self.min_fn = function.clone();
        self.max_fn = function;
        self.rkref = now;
    }

    /// Fold another summary into this one, normalizing both sides to the
    /// later release-time reference.
    pub fn join(&mut self, other: &Self) {
        if other.summary.is_empty() {
            return;
        }
        log::debug!("{:<32}{} + {} clusters", "joining slowness summaries", self.summary.len(), other.summary.len());
        if self.summary.is_empty() {
            *self = other.clone();
            return;
        }
        self.memory
            .as_mut()
            .expect("nonempty summary has ranges")
            .include(other.memory.as_ref().expect("nonempty summary has ranges"));
        self.disk
            .as_mut()
            .expect("nonempty summary has ranges")
            .include(other.disk.as_ref().expect("nonempty summary has ranges"));
        self.min_fn = SlownessFunction::min(&self.min_fn, &other.min_fn);
        self.max_fn = SlownessFunction::max(&self.max_fn, &other.max_fn);
        if self.length_horizon < other.length_horizon {
            self.length_horizon = other.length_horizon;
        }
        if self.minimum_slowness > other.minimum_slowness {
            self.minimum_slowness = other.minimum_slowness;
        }
        if self.maximum_slowness < other.maximum_slowness {
            self.maximum_slowness = other.maximum_slowness;
        }
        let rstart = self.summary.len();
        self.summary.join(&other.summary);
        if self.rkref > other.rkref {
            for cluster in self.summary.iter_mut().skip(rstart) {
                cluster.max_slowness.modify_reference(other.rkref, self.rkref);
                cluster.accum_max_slowness.modify_reference(other.rkref, self.rkref);
            }
        } else if self.rkref < other.rkref {
            for cluster in self.summary.iter_mut().take(rstart) {
                cluster.max_slowness.modify_reference(self.rkref, other.rkref);
                cluster.accum_max_slowness.modify_reference(self.rkref, other.rkref);
            }
            self.rkref = other.rkref;
        }
    }

    /// Move the release-time reference of the whole summary.
    pub fn update_rk_reference(&mut self, new_ref: Time) {
        for cluster in self.summary.iter_mut() {
            cluster.max_slowness.modify_reference(self.rkref, new_ref);
            cluster.accum_max_slowness.modify_reference(self.rkref, new_ref);
        }
        self.rkref = new_ref;
    }

    /// Re-establish the configured cluster bound after joins.
    pub fn reduce(&mut self) {
        self.reduce_to(config().num_clusters);
    }

    /// Reduce to an explicit cluster bound.
    pub fn reduce_to(&mut self, limit: usize) {
        let (Some(memory), Some(disk)) = (self.memory, self.disk) else { return };
        let cfg = config();
        let ctx = SlownessCtx {
            memory,
            disk,
            slowness_range: self.max_fn.sqdiff(&self.min_fn, self.length_horizon),
            length_horizon: self.length_horizon,
            min_fn: self.min_fn.clone(),
            intervals: cfg.num_intervals(3),
            num_pieces: cfg.num_pieces,
        };
        self.summary.cluster(limit, &ctx);
        for cluster in self.summary.iter_mut() {
            cluster.reduce(&ctx);
        }
    }

    /// Slowness functions of the clusters that satisfy the request, with
    /// the population each one stands for.
    pub fn get_functions(&self, req: &TaskDescription) -> Vec<(usize, &SlownessFunction, u32)> {
        self.summary
            .iter()
            .enumerate()
            .filter(|(_, c)| c.fulfills(req))
            .map(|(i, c)| (i, &c.max_slowness, c.value))
            .collect()
    }

    /// Fold an accepted assignment of `n` tasks of length `length` into
    /// cluster `index`: one node splits off with its queue extended, and the
    /// source population shrinks accordingly.
    pub fn update(&mut self, index: usize, length: u64, n: u32) {
        let cluster = &mut self.summary[index];
        if cluster.value > 1 {
            let mut split = cluster.clone();
            cluster.value -= 1;
            split.value = 1;
            split.max_slowness.update(length, n);
            split.accum_max_slowness.update(length, n);
            self.max_fn = SlownessFunction::max(&self.max_fn, &split.max_slowness);
            self.summary.push(split);
        } else {
            cluster.max_slowness.update(length, n);
            cluster.accum_max_slowness.update(length, n);
            let updated = cluster.max_slowness.clone();
            self.max_fn = SlownessFunction::max(&self.max_fn, &updated);
        }
    }

    /// Drop clusters that a dispatch decision has consumed.
    pub fn remove_clusters(&mut self, indices: &[usize]) {
        let mut keep = 0;
        let mut removed = indices.to_vec();
        removed.sort_unstable();
        self.summary.retain(|_| {
            let drop = removed.binary_search(&keep).is_ok();
            keep += 1;
            !drop
        });
    }
}
