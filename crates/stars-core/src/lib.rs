//! Core type aliases, time model, and runtime configuration for stars.
//!
//! This crate provides the foundational types and configuration parameters
//! used throughout the stars workspace.

mod time;

pub use time::*;

// ============================================================================
// TYPE ALIASES
// ============================================================================
/// Per-task slowness `(finish - release) / length`, the fairness metric.
pub type Slowness = f64;
/// Computing power of a node, in task-length units per second.
pub type Power = f64;
/// Aggregation loss accumulated by lossy summarization.
pub type Loss = f64;
/// Monotonic per-link sequence number for child-to-father updates.
pub type Seq = u64;

// ============================================================================
// TRAITS
// ============================================================================
/// Random instance generation for testing and randomized aggregation runs.
pub trait Arbitrary {
    /// Generate a uniformly random instance.
    fn random() -> Self;
}

// ============================================================================
// RUNTIME CONFIGURATION
// Global per-process tuning; every value is runtime-configurable.
// ============================================================================
use std::sync::RwLock;

/// How the makespan policy merges scalar parameters of two clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregation {
    /// Conservative extremum (min of mins, max of queue ends).
    #[default]
    Minimum,
    /// Population-weighted mean of every parameter.
    MeanFull,
    /// Conservative memory/disk, weighted-mean power and queue end.
    MeanQueue,
}

/// Global tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Target bound on cluster-list size after reduction.
    pub num_clusters: usize,
    /// Beam width of the clustering engine (nearest neighbors kept per record).
    pub dist_vector_size: usize,
    /// Target bound on piecewise-function piece count.
    pub num_pieces: usize,
    /// Target minimum children per interior node; split threshold is `2 * fanout`.
    pub fanout: usize,
    /// Makespan cluster merge method.
    pub aggregation: Aggregation,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_clusters: 125,
            dist_vector_size: 10,
            num_pieces: 64,
            fanout: 2,
            aggregation: Aggregation::Minimum,
        }
    }
}

impl Config {
    /// Buckets used by the far-apart test: the n-th root of the cluster bound,
    /// where n is the number of attributes the policy normalizes over. The
    /// nudge keeps exact roots from flooring one below their value.
    pub fn num_intervals(&self, attributes: u32) -> usize {
        ((self.num_clusters as f64).powf(1.0 / attributes as f64) + 1e-9).floor() as usize
    }
}

static CONFIG: RwLock<Config> = RwLock::new(Config {
    num_clusters: 125,
    dist_vector_size: 10,
    num_pieces: 64,
    fanout: 2,
    aggregation: Aggregation::Minimum,
});

/// Snapshot of the current global configuration.
pub fn config() -> Config {
    *CONFIG.read().expect("config lock")
}

/// Replace the global configuration.
pub fn configure(c: Config) {
    *CONFIG.write().expect("config lock") = c;
}

/// Adjust the global configuration in place.
pub fn reconfigure(f: impl FnOnce(&mut Config)) {
    f(&mut CONFIG.write().expect("config lock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn default_intervals_follow_cluster_bound() {
        let c = Config::default();
        assert_eq!(c.num_intervals(3), 5);
        assert_eq!(c.num_intervals(2), 11);
    }
    #[test]
    fn reconfigure_updates_snapshot() {
        reconfigure(|c| c.num_pieces = 8);
        assert_eq!(config().num_pieces, 8);
        reconfigure(|c| c.num_pieces = 64);
    }
}
