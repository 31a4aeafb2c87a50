//! Bounded usage history
//!
//! Keeps the last [`LIMIT`] usage samples with a running average that is
//! updated in O(1) on every push and pop.

use std::collections::{HashMap, VecDeque};

/// Number of samples retained
pub const LIMIT: usize = 10;

/// Utilization of every measured task in one sampling cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSample {
    /// Task id to utilization percentage
    pub tasks: HashMap<String, f64>,
    /// Sum over all tasks
    pub sum: f64,
}

impl UsageSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, task_id: impl Into<String>, percent: f64) {
        self.tasks.insert(task_id.into(), percent);
        self.sum += percent;
    }
}

impl FromIterator<(String, f64)> for UsageSample {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        let mut sample = UsageSample::new();
        for (task_id, percent) in iter {
            sample.record(task_id, percent);
        }
        sample
    }
}

/// FIFO of at most [`LIMIT`] samples with an incrementally maintained average
///
/// Not synchronized; the resource manager keeps both histories inside its
/// node state lock.
#[derive(Debug, Default)]
pub struct UsageHistory {
    samples: VecDeque<UsageSample>,
    average: f64,
}

impl UsageHistory {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LIMIT),
            average: 0.0,
        }
    }

    fn add_contribution(&mut self, sum: f64) {
        let count = self.samples.len() as f64;
        self.average = (self.average * count + sum) / (count + 1.0);
    }

    fn remove_contribution(&mut self, sum: f64) {
        let count = self.samples.len();
        if count <= 1 {
            self.average = 0.0;
            return;
        }
        let count = count as f64;
        self.average = (self.average * count - sum) / (count - 1.0);
    }

    /// Append a sample, evicting the oldest one when full
    pub fn push(&mut self, sample: UsageSample) {
        if self.samples.len() == LIMIT {
            self.pop();
        }
        self.add_contribution(sample.sum);
        self.samples.push_back(sample);
    }

    /// Remove and return the oldest sample
    pub fn pop(&mut self) -> Option<UsageSample> {
        let oldest_sum = self.samples.front()?.sum;
        self.remove_contribution(oldest_sum);
        self.samples.pop_front()
    }

    /// The oldest sample
    pub fn peek(&self) -> Option<&UsageSample> {
        self.samples.front()
    }

    /// Mean of the per-sample sums; 0 when empty
    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Per-task utilization from the newest sample
    pub fn most_recent(&self) -> Option<&HashMap<String, f64>> {
        self.samples.back().map(|s| &s.tasks)
    }
}
