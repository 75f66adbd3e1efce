//! Bounded-cardinality cluster aggregation.
//!
//! A summary holds one record per population of similar nodes. When the list
//! outgrows its configured bound, [`ClusteringList::cluster`] repeatedly
//! joins the globally-closest pair of records until the bound is met,
//! charging the information destroyed by each join to the records' error
//! moments.
//!
//! Exact pairwise clustering is quadratic; the engine keeps only the K'
//! nearest neighbors of each record (with the merged record precomputed for
//! each pair) and drives the joins from a heap keyed by each record's
//! current best distance. Stale heap entries are revalidated lazily, so the
//! total work stays near `O(N · K' · log N)`.
mod engine;

pub use engine::*;

use serde::Deserialize;
use serde::Serialize;

/// One record of a lossy summary: a population of similar nodes with
/// conservative bounds and accumulated approximation error.
pub trait Cluster: Clone + Send + Sync {
    /// Normalization context shared by a whole summary, passed explicitly to
    /// every comparison so records can be copied and moved freely.
    type Ctx: Sync;

    /// Number of nodes this record stands for.
    fn weight(&self) -> u32;

    /// Mark this record as consumed by a join; purged afterwards.
    fn invalidate(&mut self);

    /// Coarse bucketized inequality: far-apart records are never joined.
    fn far(&self, other: &Self, ctx: &Self::Ctx) -> bool;

    /// Aggregation loss of joining with `other`, together with the joined
    /// record itself so an accepted join costs nothing extra.
    fn distance(&self, other: &Self, ctx: &Self::Ctx) -> (f64, Self);

    /// Fold `other` into this record.
    fn merge(&mut self, other: &Self, ctx: &Self::Ctx);
}

/// A list of cluster records with the aggregation operations summaries need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringList<T>(Vec<T>);

impl<T> Default for ClusteringList<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> std::ops::Deref for ClusteringList<T> {
    type Target = Vec<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> std::ops::DerefMut for ClusteringList<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> From<Vec<T>> for ClusteringList<T> {
    fn from(records: Vec<T>) -> Self {
        Self(records)
    }
}

impl<T: Cluster> ClusteringList<T> {
    /// Append every record of another list.
    pub fn join(&mut self, other: &Self) {
        self.0.extend_from_slice(&other.0);
        if self.0.len() > 1_000_000 {
            log::warn!("cluster list size over 1000000 after join, is it correct??");
        }
    }

    /// Remove records consumed by previous joins.
    pub fn purge(&mut self) {
        self.0.retain(|record| record.weight() > 0);
    }

    /// Total population represented by the list.
    pub fn population(&self) -> u64 {
        self.0.iter().map(|record| record.weight() as u64).sum()
    }

    /// Join closest pairs until at most `limit` records remain.
    pub fn cluster(&mut self, limit: usize, ctx: &T::Ctx) {
        Engine::new(stars_core::config().dist_vector_size).run(&mut self.0, limit, ctx);
    }
}
