//! Scalar parameters and piecewise availability functions.
//!
//! The lossy aggregation pipeline is built from three numeric primitives:
//!
//! - [`Interval`] — value ranges, bucketized for the coarse far-apart test
//! - [`Parameter`] — a single scalar attribute tracking its value together
//!   with the mean-square and linear error moments accumulated by merging
//! - [`SlownessFunction`] / [`AvailFunction`] — piecewise functions of task
//!   length (worst-case slowness) and of time (cumulative availability),
//!   with the pointwise algebra and bounded-piece reduction the clustering
//!   pass relies on
//!
//! All of the n-ary function operations walk the joint piece boundaries of
//! their operands with a shared stepper that also detects the crossing
//! points of the first two operands, emitting one closed-form sub-interval
//! at a time to the consuming closure.
mod avail;
mod interval;
mod scalar;
mod slowness;

pub use avail::*;
pub use interval::*;
pub use scalar::*;
pub use slowness::*;
