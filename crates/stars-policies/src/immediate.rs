use serde::Deserialize;
use serde::Serialize;
use stars_clustering::Cluster;
use stars_clustering::ClusteringList;
use stars_core::config;
use stars_function::Interval;
use stars_function::MinParam;
use stars_task::TaskDescription;

/// Memory and disk floors of a population of immediately-usable nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdCluster {
    pub value: u32,
    pub min_mem: MinParam<u32>,
    pub min_disk: MinParam<u32>,
}

impl MdCluster {
    pub fn new(mem: u32, disk: u32) -> Self {
        Self { value: 1, min_mem: MinParam::new(mem), min_disk: MinParam::new(disk) }
    }

    /// Whether every node in this cluster satisfies the request.
    pub fn fulfills(&self, req: &TaskDescription) -> bool {
        self.min_mem.value() >= req.max_memory && self.min_disk.value() >= req.max_disk
    }
}

/// Normalization context of the immediate policy.
#[derive(Debug, Clone)]
pub struct ImmediateCtx {
    pub memory: Interval<u32>,
    pub disk: Interval<u32>,
    pub intervals: usize,
}

impl Cluster for MdCluster {
    type Ctx = ImmediateCtx;

    fn weight(&self) -> u32 {
        self.value
    }

    fn invalidate(&mut self) {
        self.value = 0;
    }

    fn far(&self, other: &Self, ctx: &Self::Ctx) -> bool {
        self.min_mem.far(&other.min_mem, &ctx.memory, ctx.intervals)
            || self.min_disk.far(&other.min_disk, &ctx.disk, ctx.intervals)
    }

    fn distance(&self, other: &Self, ctx: &Self::Ctx) -> (f64, Self) {
        let mut sum = self.clone();
        sum.merge(other, ctx);
        let d = sum.min_mem.norm(&ctx.memory, sum.value) + sum.min_disk.norm(&ctx.disk, sum.value);
        (d, sum)
    }

    fn merge(&mut self, other: &Self, _: &Self::Ctx) {
        self.min_mem.aggregate(self.value, &other.min_mem, other.value);
        self.min_disk.aggregate(self.value, &other.min_disk, other.value);
        self.value += other.value;
    }
}

/// Immediate-availability summary: which nodes can take a task right now.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImmediateSummary {
    summary: ClusteringList<MdCluster>,
    ranges: Option<(Interval<u32>, Interval<u32>)>,
}

impl ImmediateSummary {
    /// Record one node's free memory and disk.
    pub fn add_node(&mut self, mem: u32, disk: u32) {
        self.summary.push(MdCluster::new(mem, disk));
        match &mut self.ranges {
            Some((memory, disk_range)) => {
                memory.extend(mem);
                disk_range.extend(disk);
            }
            None => self.ranges = Some((Interval::at(mem), Interval::at(disk))),
        }
    }

    pub fn summary(&self) -> &ClusteringList<MdCluster> {
        &self.summary
    }

    /// Fold another summary into this one without reducing.
    pub fn join(&mut self, other: &Self) {
        self.summary.join(&other.summary);
        match (&mut self.ranges, &other.ranges) {
            (Some((m, d)), Some((om, od))) => {
                m.include(om);
                d.include(od);
            }
            (None, Some(r)) => self.ranges = Some(*r),
            _ => {}
        }
    }

    /// Re-establish the configured cluster bound after joins.
    pub fn reduce(&mut self) {
        self.reduce_to(config().num_clusters);
    }

    /// Reduce to an explicit cluster bound.
    pub fn reduce_to(&mut self, limit: usize) {
        let Some((memory, disk)) = self.ranges else { return };
        let ctx = ImmediateCtx { memory, disk, intervals: config().num_intervals(2) };
        self.summary.cluster(limit, &ctx);
    }

    /// Clusters whose every node satisfies the request.
    pub fn get_availability(&self, req: &TaskDescription) -> Vec<&MdCluster> {
        self.summary.iter().filter(|c| c.fulfills(req)).collect()
    }
}
