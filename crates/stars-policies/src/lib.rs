//! Availability summary policies.
//!
//! An availability summary is a bounded list of cluster records describing a
//! subtree of execution nodes. Leaves initialize a singleton summary from
//! their local state; routers [`join`] child summaries, [`reduce`] them back
//! under the configured cluster bound, answer feasibility queries during
//! task dispatch, and [`update`] themselves after an assignment.
//!
//! Four policies share this surface, in increasing order of information:
//!
//! - [`ImmediateSummary`] — memory and disk floors only
//! - [`MakespanSummary`] — adds speed floors and queue-end ceilings
//! - [`DeadlineSummary`] — availability-over-time envelopes
//! - [`SlownessSummary`] — worst-case slowness-over-task-length envelopes
//!
//! [`join`]: ImmediateSummary::join
//! [`reduce`]: ImmediateSummary::reduce
//! [`update`]: DeadlineSummary::update
mod deadline;
mod immediate;
mod makespan;
mod slowness;

pub use deadline::*;
pub use immediate::*;
pub use makespan::*;
pub use slowness::*;
