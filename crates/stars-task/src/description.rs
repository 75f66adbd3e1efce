use serde::Deserialize;
use serde::Serialize;
use stars_core::Time;

/// Resource requirements of one bag of tasks. Immutable per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskDescription {
    /// Length of a single task, in computation units.
    pub length: u64,
    /// Number of tasks in the bag.
    pub num_tasks: u32,
    /// Absolute deadline for the whole bag.
    pub deadline: Time,
    /// Maximum memory used by one task, in MB.
    pub max_memory: u32,
    /// Maximum disk used by one task, in MB.
    pub max_disk: u32,
    /// Input data size, in MB.
    pub input_size: u32,
    /// Output data size, in MB.
    pub output_size: u32,
}

impl TaskDescription {
    /// Total length of the whole bag.
    pub fn app_length(&self) -> u64 {
        self.length * self.num_tasks as u64
    }

    /// A copy of this description with another deadline. The makespan query
    /// probes candidate deadlines without touching the original request.
    pub fn with_deadline(&self, deadline: Time) -> Self {
        Self { deadline, ..*self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn app_length_scales_with_bag_size() {
        let req = TaskDescription { length: 5000, num_tasks: 3, ..Default::default() };
        assert_eq!(req.app_length(), 15000);
    }
    #[test]
    fn with_deadline_leaves_the_rest_alone() {
        let req = TaskDescription { length: 5000, num_tasks: 3, ..Default::default() };
        let probed = req.with_deadline(Time::from_secs(10.0));
        assert_eq!(probed.length, req.length);
        assert_eq!(probed.deadline, Time::from_secs(10.0));
    }
}
