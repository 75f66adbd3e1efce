use super::Cluster;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A precomputed candidate join: the distance to a neighbor, the neighbor's
/// weight when the distance was computed (for staleness detection), and the
/// already-aggregated record the join would produce.
struct Neighbor<T> {
    dist: f64,
    seen: u32,
    to: usize,
    sum: T,
}

/// The beam of candidate joins of one source record, nearest first.
struct DistanceList<T> {
    src: usize,
    dsts: Vec<Neighbor<T>>,
    cursor: usize,
    dirty: bool,
}

impl<T> DistanceList<T> {
    fn new(src: usize, beam: usize) -> Self {
        Self { src, dsts: Vec::with_capacity(beam), cursor: 0, dirty: false }
    }

    /// Insert a candidate, keeping the beam sorted and capped.
    fn add(&mut self, dist: f64, to: usize, seen: u32, sum: T, beam: usize) -> bool {
        if self.dsts.len() < beam || dist < self.dsts.last().expect("nonempty beam").dist {
            let at = self
                .dsts
                .binary_search_by(|probe| probe.dist.total_cmp(&dist))
                .unwrap_or_else(|e| e);
            self.dsts.insert(at, Neighbor { dist, seen, to, sum });
            self.dsts.truncate(beam);
            true
        } else {
            false
        }
    }

    fn head(&self) -> Option<&Neighbor<T>> {
        self.dsts.get(self.cursor)
    }

    /// Skip candidates whose target has been consumed.
    fn advance<C: Cluster>(&mut self, records: &[C]) {
        while self
            .dsts
            .get(self.cursor)
            .map(|n| records[n.to].weight() == 0)
            .unwrap_or(false)
        {
            self.cursor += 1;
        }
    }
}

/// Lazy heap entry keyed by a list's best distance at push time; entries
/// with a stale version are dropped on pop.
struct HeapEntry {
    dist: f64,
    list: usize,
    version: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.list == other.list
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on distance.
        other.dist.total_cmp(&self.dist)
    }
}

/// The bounded-cardinality merge engine.
pub struct Engine {
    beam: usize,
    use_far: bool,
}

impl Engine {
    pub fn new(beam: usize) -> Self {
        Self { beam: beam.max(1), use_far: false }
    }

    /// Reduce `records` to at most `limit` live entries, then purge.
    pub fn run<T: Cluster>(&mut self, records: &mut Vec<T>, limit: usize, ctx: &T::Ctx) {
        while records.len() > limit {
            log::debug!("{:<32}{} -> {}", "clusterizing", records.len(), limit);
            let filtered = !self.use_far;
            let mut lists = self.populate(records, ctx);
            let mut versions = vec![0u64; lists.len()];
            let mut heap: BinaryHeap<HeapEntry> = lists
                .iter()
                .enumerate()
                .filter_map(|(i, l)| l.head().map(|n| HeapEntry { dist: n.dist, list: i, version: 0 }))
                .collect();

            let target = records.len() - limit;
            let mut joined = 0;
            while let Some(entry) = heap.pop() {
                if joined >= target || entry.dist.is_infinite() {
                    break;
                }
                if entry.version != versions[entry.list] {
                    continue;
                }
                let src = lists[entry.list].src;
                // The source itself may have been consumed by a prior join.
                if records[src].weight() == 0 {
                    continue;
                }
                let cursor = lists[entry.list].cursor;
                let (to, seen) = {
                    let head = lists[entry.list].head().expect("pushed lists have a head");
                    (head.to, head.seen)
                };
                if records[to].weight() > 0 {
                    if seen != records[to].weight() {
                        // The neighbor grew since this distance was computed.
                        let (dist, sum) = records[src].distance(&records[to], ctx);
                        let nb = &mut lists[entry.list].dsts[cursor];
                        nb.dist = dist;
                        nb.sum = sum;
                        nb.seen = records[to].weight();
                        versions[entry.list] += 1;
                        heap.push(HeapEntry { dist, list: entry.list, version: versions[entry.list] });
                        continue;
                    }
                    lists[entry.list].dirty = true;
                    records[src] = lists[entry.list].dsts[cursor].sum.clone();
                    records[to].invalidate();
                    joined += 1;
                }
                lists[entry.list].advance(records);
                if lists[entry.list].head().is_some() {
                    let cursor = lists[entry.list].cursor;
                    let (to, seen) = {
                        let next = lists[entry.list].head().expect("head just checked");
                        (next.to, next.seen)
                    };
                    if lists[entry.list].dirty || seen != records[to].weight() {
                        let (dist, sum) = records[src].distance(&records[to], ctx);
                        let nb = &mut lists[entry.list].dsts[cursor];
                        nb.dist = dist;
                        nb.sum = sum;
                        nb.seen = records[to].weight();
                    }
                    let dist = lists[entry.list].dsts[cursor].dist;
                    versions[entry.list] += 1;
                    heap.push(HeapEntry { dist, list: entry.list, version: versions[entry.list] });
                }
            }
            if joined == 0 {
                // A starved round under the far filter retries unrestricted.
                if filtered && self.use_far {
                    continue;
                }
                break;
            }
            records.retain(|record| record.weight() > 0);
        }
        log::debug!("{:<32}{} clusters", "clusterizing done", records.len());
    }

    /// Compute every record's beam of nearest joinable neighbors.
    ///
    /// When the far-apart filter leaves most beams underfull, it is disabled
    /// for the following rounds so progress is still possible.
    fn populate<T: Cluster>(&mut self, records: &[T], ctx: &T::Ctx) -> Vec<DistanceList<T>> {
        let n = records.len();
        let beam = self.beam;
        let use_far = self.use_far;
        let lists: Vec<DistanceList<T>> = (0..n.saturating_sub(1))
            .into_par_iter()
            .map(|i| {
                let mut list = DistanceList::new(i, beam);
                for j in i + 1..n {
                    if use_far || !records[i].far(&records[j], ctx) {
                        let (dist, sum) = records[i].distance(&records[j], ctx);
                        list.add(dist, j, records[j].weight(), sum, beam);
                    }
                }
                list
            })
            .collect();
        if !self.use_far {
            let additions: usize = lists.iter().map(|l| l.dsts.len()).sum();
            let missing = (beam + 1) * beam / 2;
            if additions + missing < n.saturating_sub(1) * beam {
                self.use_far = true;
            }
        }
        lists
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClusteringList;
    use rand::Rng;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use serde::Deserialize;
    use serde::Serialize;

    /// Minimal record: a population with a conservative minimum.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Floor {
        weight: u32,
        min: u32,
    }

    /// Normalization range for the far test.
    struct Range {
        lo: u32,
        hi: u32,
    }

    impl Cluster for Floor {
        type Ctx = Range;
        fn weight(&self) -> u32 {
            self.weight
        }
        fn invalidate(&mut self) {
            self.weight = 0;
        }
        fn far(&self, other: &Self, ctx: &Self::Ctx) -> bool {
            let width = (ctx.hi - ctx.lo).max(1);
            let bucket = |v: u32| ((v - ctx.lo) as u64 * 4 / width as u64) as u32;
            bucket(self.min.min(ctx.hi)) != bucket(other.min.min(ctx.hi))
        }
        fn distance(&self, other: &Self, ctx: &Self::Ctx) -> (f64, Self) {
            let mut sum = self.clone();
            sum.merge(other, ctx);
            let d = (self.min as f64 - other.min as f64).abs();
            (d, sum)
        }
        fn merge(&mut self, other: &Self, _: &Self::Ctx) {
            self.min = self.min.min(other.min);
            self.weight += other.weight;
        }
    }

    fn range(records: &[Floor]) -> Range {
        Range {
            lo: records.iter().map(|r| r.min).min().unwrap_or(0),
            hi: records.iter().map(|r| r.min).max().unwrap_or(0),
        }
    }

    #[test]
    fn population_is_preserved_by_clustering() {
        let mut rng = SmallRng::seed_from_u64(42);
        let records = (0..200)
            .map(|_| Floor { weight: 1, min: rng.random_range(256..4096) })
            .collect::<Vec<_>>();
        let ctx = range(&records);
        let mut list = ClusteringList::from(records);
        list.cluster(16, &ctx);
        assert!(list.len() <= 16);
        assert_eq!(list.population(), 200);
    }

    #[test]
    fn joined_records_keep_a_conservative_floor() {
        let mut rng = SmallRng::seed_from_u64(7);
        let records = (0..100)
            .map(|_| Floor { weight: 1, min: rng.random_range(0..10000) })
            .collect::<Vec<_>>();
        let global_floor = records.iter().map(|r| r.min).min().expect("nonempty");
        let ctx = range(&records);
        let mut list = ClusteringList::from(records);
        list.cluster(8, &ctx);
        assert!(list.iter().all(|r| r.min >= global_floor));
        assert!(list.iter().any(|r| r.min == global_floor));
        assert!(list.iter().all(|r| r.weight() >= 1));
    }

    #[test]
    fn lists_already_under_the_bound_are_untouched() {
        let records = vec![Floor { weight: 3, min: 10 }, Floor { weight: 2, min: 90 }];
        let ctx = range(&records);
        let mut list = ClusteringList::from(records.clone());
        list.cluster(5, &ctx);
        assert_eq!(&*list, &records);
    }

    #[test]
    fn far_apart_records_merge_only_as_a_last_resort() {
        // Two tight groups at opposite ends of the range; reducing to two
        // clusters must keep the groups apart.
        let mut records = Vec::new();
        for i in 0..10 {
            records.push(Floor { weight: 1, min: 100 + i });
            records.push(Floor { weight: 1, min: 9900 + i });
        }
        let ctx = range(&records);
        let mut list = ClusteringList::from(records);
        list.cluster(2, &ctx);
        assert_eq!(list.len(), 2);
        let mut mins = list.iter().map(|r| r.min).collect::<Vec<_>>();
        mins.sort();
        assert_eq!(mins, vec![100, 9900]);
        assert!(list.iter().all(|r| r.weight() == 10));
    }

    #[test]
    fn purge_drops_consumed_records() {
        let mut list = ClusteringList::from(vec![
            Floor { weight: 2, min: 5 },
            Floor { weight: 0, min: 9 },
            Floor { weight: 1, min: 3 },
        ]);
        list.purge();
        assert_eq!(list.len(), 2);
        assert_eq!(list.population(), 3);
    }
}
