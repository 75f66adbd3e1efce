use serde::Deserialize;
use serde::Serialize;
use stars_clustering::Cluster;
use stars_clustering::ClusteringList;
use stars_core::Aggregation;
use stars_core::Duration;
use stars_core::Time;
use stars_core::config;
use stars_function::Interval;
use stars_function::MaxParam;
use stars_function::Mean;
use stars_function::MinParam;
use stars_task::TaskDescription;

/// Memory, disk and speed floors plus the queue-end ceiling of a population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdptCluster {
    pub value: u32,
    pub min_mem: MinParam<u32>,
    pub min_disk: MinParam<u32>,
    pub min_power: MinParam<u32>,
    pub max_queue: MaxParam<Time>,
}

impl MdptCluster {
    pub fn new(mem: u32, disk: u32, power: u32, queue_end: Time) -> Self {
        Self {
            value: 1,
            min_mem: MinParam::new(mem),
            min_disk: MinParam::new(disk),
            min_power: MinParam::new(power),
            max_queue: MaxParam::new(queue_end),
        }
    }

    pub fn fulfills(&self, req: &TaskDescription) -> bool {
        self.min_mem.value() >= req.max_memory && self.min_disk.value() >= req.max_disk
    }

    /// Tasks of the request every node of this cluster can finish before the
    /// request deadline, starting when its queue drains.
    fn tasks_before_deadline(&self, req: &TaskDescription, now: Time) -> u64 {
        let start = self.max_queue.value().max(now);
        if start >= req.deadline {
            return 0;
        }
        let time = (req.deadline - start).seconds();
        let length = if req.length > 0 { req.length } else { 1000 };
        (time * self.min_power.value() as f64) as u64 / length
    }
}

/// Normalization context of the makespan policy.
#[derive(Debug, Clone)]
pub struct MakespanCtx {
    pub memory: Interval<u32>,
    pub disk: Interval<u32>,
    pub power: Interval<u32>,
    pub queue: Interval<Time>,
    pub intervals: usize,
}

impl Cluster for MdptCluster {
    type Ctx = MakespanCtx;

    fn weight(&self) -> u32 {
        self.value
    }

    fn invalidate(&mut self) {
        self.value = 0;
    }

    fn far(&self, other: &Self, ctx: &Self::Ctx) -> bool {
        self.min_mem.far(&other.min_mem, &ctx.memory, ctx.intervals)
            || self.min_disk.far(&other.min_disk, &ctx.disk, ctx.intervals)
            || self.min_power.far(&other.min_power, &ctx.power, ctx.intervals)
            || self.max_queue.far(&other.max_queue, &ctx.queue, ctx.intervals)
    }

    fn distance(&self, other: &Self, ctx: &Self::Ctx) -> (f64, Self) {
        let mut sum = self.clone();
        sum.merge(other, ctx);
        let d = sum.min_mem.norm(&ctx.memory, sum.value)
            + sum.min_disk.norm(&ctx.disk, sum.value)
            + sum.min_power.norm(&ctx.power, sum.value)
            + sum.max_queue.norm(&ctx.queue, sum.value);
        (d, sum)
    }

    fn merge(&mut self, other: &Self, _: &Self::Ctx) {
        match config().aggregation {
            Aggregation::Minimum => {
                self.min_mem.aggregate(self.value, &other.min_mem, other.value);
                self.min_disk.aggregate(self.value, &other.min_disk, other.value);
                self.min_power.aggregate(self.value, &other.min_power, other.value);
                self.max_queue.aggregate(self.value, &other.max_queue, other.value);
            }
            Aggregation::MeanFull => {
                self.min_mem.aggregate_as::<Mean>(self.value, &other.min_mem, other.value);
                self.min_disk.aggregate_as::<Mean>(self.value, &other.min_disk, other.value);
                self.min_power.aggregate_as::<Mean>(self.value, &other.min_power, other.value);
                self.max_queue.aggregate_as::<Mean>(self.value, &other.max_queue, other.value);
            }
            Aggregation::MeanQueue => {
                self.min_mem.aggregate(self.value, &other.min_mem, other.value);
                self.min_disk.aggregate(self.value, &other.min_disk, other.value);
                self.min_power.aggregate_as::<Mean>(self.value, &other.min_power, other.value);
                self.max_queue.aggregate_as::<Mean>(self.value, &other.max_queue, other.value);
            }
        }
        self.value += other.value;
    }
}

/// Makespan summary: how soon a bag of tasks can drain through a subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakespanSummary {
    summary: ClusteringList<MdptCluster>,
    max_queue: Time,
    memory: Interval<u32>,
    disk: Interval<u32>,
    power: Interval<u32>,
    queue: Interval<Time>,
}

impl MakespanSummary {
    pub fn new(now: Time) -> Self {
        Self {
            summary: ClusteringList::default(),
            max_queue: now,
            memory: Interval::at(0),
            disk: Interval::at(0),
            power: Interval::at(0),
            queue: Interval::at(now),
        }
    }

    pub fn summary(&self) -> &ClusteringList<MdptCluster> {
        &self.summary
    }

    pub fn max_queue(&self) -> Time {
        self.max_queue
    }

    /// Initialize the singleton summary of a leaf from its local state.
    pub fn set_queue_end(&mut self, mem: u32, disk: u32, power: u32, end: Time) {
        self.summary.clear();
        self.summary.push(MdptCluster::new(mem, disk, power, end));
        self.memory.set_limits(mem);
        self.disk.set_limits(disk);
        self.power.set_limits(power);
        self.queue.set_limits(end);
        self.max_queue = end;
    }

    /// Fold another summary into this one. Queue ends already in the past
    /// collapse to the present.
    pub fn join(&mut self, other: &Self, now: Time) {
        if other.summary.is_empty() {
            return;
        }
        log::debug!("{:<32}{} + {} clusters", "joining makespan summaries", self.summary.len(), other.summary.len());
        if self.summary.is_empty() {
            self.memory = other.memory;
            self.disk = other.disk;
            self.power = other.power;
            self.queue = other.queue;
        } else {
            self.memory.include(&other.memory);
            self.disk.include(&other.disk);
            self.power.include(&other.power);
            self.queue.include(&other.queue);
        }
        if self.max_queue < other.max_queue {
            self.max_queue = other.max_queue;
        }
        self.summary.join(&other.summary);
        for cluster in self.summary.iter_mut() {
            if cluster.max_queue.value() < now {
                cluster.max_queue = MaxParam::new(now);
            }
        }
        self.queue.extend(now);
    }

    /// Re-establish the configured cluster bound after joins.
    pub fn reduce(&mut self) {
        self.reduce_to(config().num_clusters);
    }

    /// Reduce to an explicit cluster bound.
    pub fn reduce_to(&mut self, limit: usize) {
        let ctx = MakespanCtx {
            memory: self.memory,
            disk: self.disk,
            power: self.power,
            queue: self.queue,
            intervals: config().num_intervals(4),
        };
        self.summary.cluster(limit, &ctx);
    }

    /// Clusters able to take at least one task of the request before its
    /// deadline, and the total number of tasks they absorb.
    pub fn get_availability(&self, req: &TaskDescription, now: Time) -> (Vec<usize>, u64) {
        let mut clusters = Vec::new();
        let mut total = 0;
        for (i, cluster) in self.summary.iter().enumerate() {
            if cluster.fulfills(req) {
                let t = cluster.tasks_before_deadline(req, now);
                if t != 0 {
                    clusters.push(i);
                    total += t;
                }
            }
        }
        (clusters, total)
    }

    /// The earliest deadline by which `num_tasks` instances of the request
    /// fit in this summary: exponential probe followed by bisection.
    pub fn earliest_deadline(&self, num_tasks: u64, req: &TaskDescription, now: Time) -> Time {
        let mut max = now;
        let mut min;
        let mut d = Duration::from_micros(300_000_000);
        loop {
            min = max;
            max = max + d;
            d = d * 2.0;
            let t = self.get_availability(&req.with_deadline(max), now).1;
            if t >= num_tasks || d >= Duration::from_micros(1_000_000_000_000_000_000) {
                break;
            }
        }
        let mut last = u64::MAX;
        loop {
            let med = min + (max - min) * 0.5;
            let t = self.get_availability(&req.with_deadline(med), now).1;
            if t < num_tasks {
                min = med;
            } else {
                max = med;
            }
            if t == last {
                break;
            }
            last = t;
        }
        max
    }

    /// Push the queue end of every cluster that would take part of the
    /// request out to its deadline.
    pub fn update_availability(&mut self, req: &TaskDescription, now: Time) {
        let (clusters, _) = self.get_availability(req, now);
        for i in clusters {
            self.summary[i].max_queue = MaxParam::new(req.deadline);
        }
        if self.max_queue < req.deadline {
            self.max_queue = req.deadline;
        }
        self.queue.extend(req.deadline);
    }
}
