use super::*;
use stars_core::Duration;
use stars_core::Slowness;
use stars_core::Time;

/// A task queue with the running task pinned at index 0.
///
/// Every reordering operation leaves the first entry in place: the running
/// task cannot be preempted, only the waiting tail is permuted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQueue(Vec<TaskProxy>);

impl std::ops::Deref for TaskQueue {
    type Target = Vec<TaskProxy>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for TaskQueue {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<TaskProxy>> for TaskQueue {
    fn from(tasks: Vec<TaskProxy>) -> Self {
        Self(tasks)
    }
}

impl TaskQueue {
    /// Sort the waiting tail by the deadline each task must meet to stay at
    /// or under slowness `l`. Ties are broken by task length ascending.
    pub fn sort_by_slowness(&mut self, l: Slowness) {
        if self.len() > 1 {
            for task in self.iter_mut().skip(1) {
                task.set_slowness(l);
            }
            self.0[1..].sort_by(TaskProxy::order);
        }
    }

    /// Whether sequential execution starting at `e` meets every task's
    /// deadline for target slowness `l`, in the current order.
    pub fn meet_deadlines(&self, l: Slowness, mut e: Time) -> bool {
        for task in self.iter() {
            e += Duration::from_secs(task.t);
            if e > task.deadline(l) {
                return false;
            }
        }
        true
    }

    /// Order the queue to minimize the maximum slowness.
    ///
    /// Between two consecutive switch values the optimal order is stable, so
    /// a binary search over `switch_values` finds the smallest interval whose
    /// midpoint order still meets the deadlines implied by its upper bound.
    pub fn sort_min_slowness(&mut self, switch_values: &[Slowness], now: Time) {
        if switch_values.is_empty() {
            return;
        }
        if switch_values.len() == 1 {
            self.sort_by_slowness(switch_values[0] + 1.0);
            return;
        }
        let mut min_li = 0;
        let mut max_li = switch_values.len() - 1;
        while max_li > min_li + 1 {
            let med_li = (min_li + max_li) >> 1;
            self.sort_by_slowness((switch_values[med_li] + switch_values[med_li + 1]) / 2.0);
            if self.meet_deadlines(switch_values[med_li], now) {
                max_li = med_li;
            } else {
                min_li = med_li;
            }
        }
        self.sort_by_slowness((switch_values[min_li] + switch_values[min_li + 1]) / 2.0);
        // The last interval is open above; fall back past the last switch.
        if max_li == switch_values.len() - 1 && !self.meet_deadlines(switch_values[max_li], now) {
            self.sort_by_slowness(switch_values[max_li] + 1.0);
        }
    }

    /// Slowness values at which two queued tasks swap order in the optimal
    /// schedule, sorted ascending and deduplicated. The first entry is the
    /// slowness of the running task, which lower-bounds the feasible range.
    pub fn switch_values(&self, now: Time) -> Vec<Slowness> {
        let mut values = Vec::new();
        if let Some(first) = self.first() {
            let first_end = now + Duration::from_secs(first.t);
            values.push((first_end - first.rabs).seconds() / first.a);
            for (i, it) in self.iter().enumerate().skip(1) {
                for jt in self.iter().skip(i) {
                    if it.a != jt.a {
                        let l = (jt.rabs - it.rabs).seconds() / (it.a - jt.a);
                        if l > values[0] {
                            values.push(l);
                        }
                    }
                }
            }
            values.sort_by(f64::total_cmp);
            values.dedup();
        }
        values
    }

    /// The maximum slowness reached by sequential execution from `now` in
    /// the current order.
    pub fn slowness(&self, now: Time) -> Slowness {
        let mut worst: Slowness = 0.0;
        let mut e = now;
        for task in self.iter() {
            e += Duration::from_secs(task.t);
            let slowness = (e - task.rabs).seconds() / task.a;
            if slowness > worst {
                worst = slowness;
            }
        }
        worst
    }
}
