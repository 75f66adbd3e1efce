use serde::Deserialize;
use serde::Serialize;
use stars_core::Duration;
use stars_core::Power;
use stars_core::Slowness;
use stars_core::Time;

/// Scheduling view of one queued task.
///
/// Carries the values the ordering algorithm needs: absolute release time,
/// task length `a`, estimated remaining duration `t`, and two scratch fields
/// (`tsum`, the accumulated execution time up to this task in the current
/// order, and `d`, the deadline implied by a target slowness).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskProxy {
    /// Queue-local task id; `None` marks the hypothetical new task used by
    /// the slowness-function builder.
    pub id: Option<u32>,
    /// Absolute release time.
    pub rabs: Time,
    /// Release time relative to some reference instant, in seconds.
    pub r: f64,
    /// Task length.
    pub a: f64,
    /// Estimated execution time, in seconds.
    pub t: f64,
    /// Accumulated execution time up to and including this task.
    pub tsum: f64,
    /// Deadline for the current target slowness.
    pub d: Time,
}

impl TaskProxy {
    /// A real queued task of length `a`, released at `rabs`, with `t` seconds
    /// of estimated execution remaining.
    pub fn new(id: u32, a: f64, t: f64, rabs: Time) -> Self {
        Self { id: Some(id), rabs, r: 0.0, a, t, tsum: t, d: Time::ZERO }
    }

    /// The hypothetical task appended by the slowness-function builder.
    pub fn hypothetical(a: f64, power: Power, rabs: Time) -> Self {
        Self { id: None, rabs, r: 0.0, a, t: a / power, tsum: a / power, d: Time::ZERO }
    }

    /// Deadline this task must meet to keep its slowness at or under `l`.
    pub fn deadline(&self, l: Slowness) -> Time {
        self.rabs + Duration::from_secs(l * self.a)
    }

    /// Cache the deadline for a target slowness, used as the sort key.
    pub fn set_slowness(&mut self, l: Slowness) {
        self.d = self.deadline(l);
    }

    /// Sort key: deadline ascending, ties broken by length ascending.
    pub fn order(&self, other: &Self) -> std::cmp::Ordering {
        self.d
            .cmp(&other.d)
            .then(self.a.total_cmp(&other.a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn deadline_grows_with_slowness_and_length() {
        let p = TaskProxy::new(1, 2000.0, 2.0, Time::from_secs(10.0));
        assert_eq!(p.deadline(0.001), Time::from_secs(12.0));
        assert!(p.deadline(0.002) > p.deadline(0.001));
    }
    #[test]
    fn hypothetical_task_has_no_id() {
        let p = TaskProxy::hypothetical(1000.0, 500.0, Time::ZERO);
        assert!(p.id.is_none());
        assert_eq!(p.t, 2.0);
    }
    #[test]
    fn order_breaks_deadline_ties_by_length() {
        let mut a = TaskProxy::new(1, 1000.0, 1.0, Time::ZERO);
        let mut b = TaskProxy::new(2, 2000.0, 2.0, Time::ZERO);
        a.d = Time::from_secs(5.0);
        b.d = Time::from_secs(5.0);
        assert_eq!(a.order(&b), std::cmp::Ordering::Less);
    }
}
