//! Task descriptions and min-slowness queue ordering.
//!
//! A task bag is described by an immutable [`TaskDescription`]. On an
//! execution node, queued tasks are viewed through [`TaskProxy`] entries and
//! ordered by [`TaskQueue::sort_min_slowness`], which minimizes the maximum
//! per-task slowness `(finish - release) / length` over the queue.
mod description;
mod proxy;
mod queue;

pub use description::*;
pub use proxy::*;
pub use queue::*;
