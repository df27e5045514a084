//! Limits and results for one drain pass.

use std::time::Duration;

/// Upper bounds for one drain pass over a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainBudget {
	/// Wall-clock limit for the pass.
	pub duration: Duration,
	/// Maximum number of units to run.
	pub max_completions: usize,
}

impl DrainBudget {
	/// Default wall-clock limit, in milliseconds.
	pub const DEFAULT_TIMEOUT_MS: u64 = 250;
	/// Default unit limit.
	pub const DEFAULT_MAX_COMPLETIONS: usize = 4096;

	/// A budget that only stops once the queue is empty.
	pub const UNBOUNDED: Self = Self {
		duration: Duration::MAX,
		max_completions: usize::MAX,
	};
}

impl Default for DrainBudget {
	fn default() -> Self {
		Self {
			duration: Duration::from_millis(Self::DEFAULT_TIMEOUT_MS),
			max_completions: Self::DEFAULT_MAX_COMPLETIONS,
		}
	}
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
	/// Units run to completion, panicked ones included.
	pub completed: u64,
	/// Units that panicked while running.
	pub panicked: u64,
	/// Units still queued after the pass.
	pub pending: usize,
	/// True when the pass stopped on the budget rather than an empty queue.
	pub budget_exhausted: bool,
}
