use serde::Deserialize;
use serde::Serialize;
use stars_clustering::Cluster;
use stars_clustering::ClusteringList;
use stars_core::Time;
use stars_core::config;
use stars_function::AvailFunction;
use stars_function::Interval;
use stars_function::MinParam;
use stars_task::TaskDescription;

/// Memory and disk floors plus the conservative lower envelope of
/// availability over time for a population of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdfCluster {
    pub value: u32,
    pub min_mem: MinParam<u32>,
    pub min_disk: MinParam<u32>,
    pub min_avail: AvailFunction,
    pub accum_asq: f64,
    pub accum_max_avail: AvailFunction,
}

impl MdfCluster {
    pub fn new(mem: u32, disk: u32, avail: AvailFunction) -> Self {
        Self {
            value: 1,
            min_mem: MinParam::new(mem),
            min_disk: MinParam::new(disk),
            accum_asq: 0.0,
            accum_max_avail: avail.clone(),
            min_avail: avail,
        }
    }

    pub fn fulfills(&self, req: &TaskDescription) -> bool {
        self.min_mem.value() >= req.max_memory && self.min_disk.value() >= req.max_disk
    }

    /// Charge the piece-count reduction of the envelopes to the accumulated
    /// error.
    fn reduce(&mut self, ctx: &DeadlineCtx) {
        self.accum_asq += self.min_avail.reduce_min(
            self.value,
            &self.accum_max_avail,
            ctx.aggregation_time,
            ctx.horizon,
            ctx.num_pieces,
            10,
        );
        self.accum_max_avail.reduce_max(ctx.aggregation_time, ctx.horizon, ctx.num_pieces, 10);
    }
}

/// Normalization context of the deadline policy.
#[derive(Debug, Clone)]
pub struct DeadlineCtx {
    pub memory: Interval<u32>,
    pub disk: Interval<u32>,
    pub avail_range: f64,
    pub aggregation_time: Time,
    pub horizon: Time,
    pub intervals: usize,
    pub num_pieces: usize,
}

impl Cluster for MdfCluster {
    type Ctx = DeadlineCtx;

    fn weight(&self) -> u32 {
        self.value
    }

    fn invalidate(&mut self) {
        self.value = 0;
    }

    fn far(&self, other: &Self, ctx: &Self::Ctx) -> bool {
        self.min_mem.far(&other.min_mem, &ctx.memory, ctx.intervals)
            || self.min_disk.far(&other.min_disk, &ctx.disk, ctx.intervals)
            || self.min_avail.is_free() != other.min_avail.is_free()
    }

    fn distance(&self, other: &Self, ctx: &Self::Ctx) -> (f64, Self) {
        let mut sum = self.clone();
        sum.merge(other, ctx);
        let mut d = sum.min_mem.norm(&ctx.memory, sum.value) + sum.min_disk.norm(&ctx.disk, sum.value);
        if ctx.avail_range != 0.0 {
            let mut loss = sum.accum_asq / (ctx.avail_range * sum.value as f64);
            if self.min_avail.is_free() != other.min_avail.is_free() {
                loss += 100.0;
            }
            d += loss;
        }
        (d, sum)
    }

    fn merge(&mut self, other: &Self, ctx: &Self::Ctx) {
        let (min_avail, loss) = AvailFunction::min_and_loss(
            &self.min_avail,
            &other.min_avail,
            self.value,
            other.value,
            &self.accum_max_avail,
            &other.accum_max_avail,
            ctx.aggregation_time,
            ctx.horizon,
        );
        self.accum_asq += other.accum_asq + loss;
        self.accum_max_avail =
            AvailFunction::max(&self.accum_max_avail, &other.accum_max_avail, ctx.aggregation_time);
        self.min_avail = min_avail;
        self.min_mem.aggregate(self.value, &other.min_mem, other.value);
        self.min_disk.aggregate(self.value, &other.min_disk, other.value);
        self.value += other.value;
    }
}

/// One feasible cluster for a request: how many tasks fit and what is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentInfo {
    pub cluster: usize,
    pub num_tasks: u64,
    pub remaining_mem: u32,
    pub remaining_disk: u32,
    pub remaining_avail: u64,
}

/// Deadline summary: how much computation a subtree can finish in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlineSummary {
    summary: ClusteringList<MdfCluster>,
    memory: Option<Interval<u32>>,
    disk: Option<Interval<u32>>,
    min_avail: AvailFunction,
    max_avail: AvailFunction,
    horizon: Time,
}

impl DeadlineSummary {
    pub fn new(now: Time) -> Self {
        Self {
            summary: ClusteringList::default(),
            memory: None,
            disk: None,
            min_avail: AvailFunction::default(),
            max_avail: AvailFunction::default(),
            horizon: now,
        }
    }

    pub fn summary(&self) -> &ClusteringList<MdfCluster> {
        &self.summary
    }

    pub fn horizon(&self) -> Time {
        self.horizon
    }

    /// Record one node's state.
    pub fn add_node(&mut self, mem: u32, disk: u32, avail: AvailFunction, now: Time) {
        let cluster = MdfCluster::new(mem, disk, avail);
        if self.summary.is_empty() {
            self.memory = Some(Interval::at(mem));
            self.disk = Some(Interval::at(disk));
            self.min_avail = cluster.min_avail.clone();
            self.max_avail = cluster.min_avail.clone();
            self.horizon = cluster.min_avail.horizon(now);
        } else {
            self.memory.as_mut().expect("ranges set with the first node").extend(mem);
            self.disk.as_mut().expect("ranges set with the first node").extend(disk);
            self.min_avail = AvailFunction::min(&self.min_avail, &cluster.min_avail, now);
            self.max_avail = AvailFunction::max(&self.max_avail, &cluster.min_avail, now);
            if self.horizon < cluster.min_avail.horizon(now) {
                self.horizon = cluster.min_avail.horizon(now);
            }
        }
        self.summary.push(cluster);
    }

    /// Fold another summary into this one without reducing.
    pub fn join(&mut self, other: &Self, now: Time) {
        if other.summary.is_empty() {
            return;
        }
        log::debug!("{:<32}{} + {} clusters", "joining deadline summaries", self.summary.len(), other.summary.len());
        if self.summary.is_empty() {
            self.memory = other.memory;
            self.disk = other.disk;
            self.min_avail = other.min_avail.clone();
            self.max_avail = other.max_avail.clone();
            self.horizon = other.horizon;
        } else {
            self.memory
                .as_mut()
                .expect("nonempty summary has ranges")
                .include(other.memory.as_ref().expect("nonempty summary has ranges"));
            self.disk
                .as_mut()
                .expect("nonempty summary has ranges")
                .include(other.disk.as_ref().expect("nonempty summary has ranges"));
            self.min_avail = AvailFunction::min(&self.min_avail, &other.min_avail, now);
            self.max_avail = AvailFunction::max(&self.max_avail, &other.max_avail, now);
            if self.horizon < other.horizon {
                self.horizon = other.horizon;
            }
        }
        self.summary.join(&other.summary);
    }

    /// Re-establish the configured cluster bound, charging the loss of the
    /// clustering pass and of the per-cluster piece reduction to the error
    /// moments.
    pub fn reduce(&mut self, now: Time) {
        self.reduce_to(config().num_clusters, now);
    }

    /// Reduce to an explicit cluster bound.
    pub fn reduce_to(&mut self, limit: usize, now: Time) {
        let (Some(memory), Some(disk)) = (self.memory, self.disk) else { return };
        let cfg = config();
        let ctx = DeadlineCtx {
            memory,
            disk,
            avail_range: self.max_avail.sqdiff(&self.min_avail, now, self.horizon),
            aggregation_time: now,
            horizon: self.horizon,
            intervals: cfg.num_intervals(3),
            num_pieces: cfg.num_pieces,
        };
        self.summary.cluster(limit, &ctx);
        for cluster in self.summary.iter_mut() {
            cluster.reduce(&ctx);
        }
    }

    /// For each feasible cluster, how many instances of the request fit
    /// before its deadline and with how much slack.
    pub fn get_availability(&self, req: &TaskDescription, now: Time) -> Vec<AssignmentInfo> {
        let mut out = Vec::new();
        if req.deadline <= now {
            return out;
        }
        for (i, cluster) in self.summary.iter().enumerate() {
            let avail = cluster.min_avail.availability_before(req.deadline, now);
            if cluster.value > 0 && avail >= req.length && cluster.fulfills(req) {
                let per_node = avail / req.length;
                out.push(AssignmentInfo {
                    cluster: i,
                    num_tasks: cluster.value as u64 * per_node,
                    remaining_mem: cluster.min_mem.value() - req.max_memory,
                    remaining_disk: cluster.min_disk.value() - req.max_disk,
                    remaining_avail: avail % req.length,
                });
            }
        }
        out
    }

    /// Fold an accepted assignment back into the summary: the affected nodes
    /// split into a new cluster whose availability is carved down by the
    /// assigned work.
    pub fn update(&mut self, assigned: &[AssignmentInfo], req: &TaskDescription, now: Time) {
        for info in assigned {
            let cluster = &mut self.summary[info.cluster];
            let avail = cluster.min_avail.availability_before(req.deadline, now);
            let per_node = avail / req.length;
            if per_node == 0 {
                continue;
            }
            let num_nodes = (info.num_tasks.div_ceil(per_node) as u32).min(cluster.value);
            let mut split = cluster.clone();
            cluster.value -= num_nodes;
            split.value = num_nodes;
            let carved = per_node.min(info.num_tasks);
            let horizon = self.horizon.max(req.deadline);
            split.min_avail.update(req.length * carved, req.deadline, horizon, now);
            self.min_avail = AvailFunction::min(&self.min_avail, &split.min_avail, now);
            self.summary.push(split);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Time {
        Time::from_secs(s)
    }

    fn req(length: u64, deadline: Time) -> TaskDescription {
        TaskDescription { length, num_tasks: 1, deadline, max_memory: 256, max_disk: 500, ..Default::default() }
    }

    #[test]
    fn free_node_fits_tasks_up_to_its_speed() {
        let now = secs(0.0);
        let mut info = DeadlineSummary::new(now);
        info.add_node(1024, 30000, AvailFunction::free(1000.0), now);
        let found = info.get_availability(&req(2000, secs(10.0)), now);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].num_tasks, 5);
        assert_eq!(found[0].remaining_avail, 0);
    }

    #[test]
    fn past_deadlines_fit_nothing() {
        let now = secs(100.0);
        let mut info = DeadlineSummary::new(now);
        info.add_node(1024, 30000, AvailFunction::free(1000.0), now);
        assert!(info.get_availability(&req(2000, secs(90.0)), now).is_empty());
    }

    #[test]
    fn join_keeps_the_conservative_envelope() {
        let now = secs(0.0);
        let mut a = DeadlineSummary::new(now);
        a.add_node(1024, 30000, AvailFunction::from_profile(100.0, &[secs(5.0), secs(50.0)]), now);
        let mut b = DeadlineSummary::new(now);
        b.add_node(2048, 10000, AvailFunction::from_profile(200.0, &[secs(10.0), secs(50.0)]), now);
        a.join(&b, now);
        assert_eq!(a.summary().population(), 2);
        // The summary minimum is below both nodes' availability.
        for i in 1..10 {
            let d = secs(i as f64 * 5.0);
            let lo = a.min_avail.availability_before(d, now);
            for cluster in a.summary().iter() {
                assert!(lo <= cluster.min_avail.availability_before(d, now) + 1);
            }
        }
    }

    #[test]
    fn reduction_is_conservative_per_cluster() {
        let now = secs(0.0);
        let mut info = DeadlineSummary::new(now);
        for i in 0..60 {
            let start = 1.0 + (i % 7) as f64;
            info.add_node(
                512 + (i % 13) * 100,
                1000 + (i % 5) * 500,
                AvailFunction::from_profile(100.0 + (i % 3) as f64 * 50.0, &[secs(start), secs(start + 40.0)]),
                now,
            );
        }
        info.reduce_to(8, now);
        assert!(info.summary().len() <= 8);
        assert_eq!(info.summary().population(), 60);
        assert!(info.summary().iter().all(|c| c.accum_asq >= 0.0));
        assert!(info.summary().iter().all(|c| c.min_mem.value() >= 512));
    }

    #[test]
    fn update_splits_off_the_assigned_nodes() {
        let now = secs(0.0);
        let mut info = DeadlineSummary::new(now);
        info.add_node(1024, 30000, AvailFunction::free(1000.0), now);
        info.add_node(1024, 30000, AvailFunction::free(1000.0), now);
        info.reduce(now);
        let request = req(2000, secs(10.0));
        let found = info.get_availability(&request, now);
        let before: u64 = found.iter().map(|f| f.num_tasks).sum();
        assert!(before > 0);
        // Assign five tasks to the first feasible cluster.
        let assignment = AssignmentInfo { num_tasks: 5, ..found[0] };
        info.update(&[assignment], &request, now);
        assert_eq!(info.summary().population(), 2);
        let after: u64 = info.get_availability(&request, now).iter().map(|f| f.num_tasks).sum();
        assert!(after < before);
    }
}
