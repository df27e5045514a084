//! Deterministic host queue drained by its owner.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::budget::{DrainBudget, DrainReport};
use crate::panic::panic_message;
use crate::queue::{QueueHandle, Task, TaskQueue};

#[derive(Default)]
struct ManualInner {
	queue: Mutex<VecDeque<Task>>,
}

/// Producer side handed out by [`ManualQueue::handle`]. Holds the backlog
/// weakly, since queued units may own handles themselves.
struct ManualSender {
	inner: Weak<ManualInner>,
}

impl TaskQueue for ManualSender {
	fn enqueue(&self, task: Task) {
		let Some(inner) = self.inner.upgrade() else {
			tracing::warn!("queue.enqueue.closed");
			return;
		};
		let mut queue = inner.queue.lock();
		queue.push_back(task);
		tracing::trace!(pending = queue.len(), "queue.enqueue");
	}
}

/// Deterministic FIFO host queue driven by explicit drain calls.
///
/// Nothing runs until the owner calls [`Self::run_next`], [`Self::drain`] or
/// [`Self::drain_with`], which makes every turn boundary visible to tests.
/// Dropping the last clone drops the backlog; units enqueued afterwards are
/// discarded.
#[derive(Clone)]
pub struct ManualQueue {
	inner: Arc<ManualInner>,
	handle: QueueHandle,
}

impl Default for ManualQueue {
	fn default() -> Self {
		let inner = Arc::new(ManualInner::default());
		let handle = QueueHandle::new(ManualSender {
			inner: Arc::downgrade(&inner),
		});
		Self { inner, handle }
	}
}

impl std::fmt::Debug for ManualQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ManualQueue").field("pending", &self.len()).finish()
	}
}

impl ManualQueue {
	/// Creates an empty queue.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns a handle cells can schedule onto.
	pub fn handle(&self) -> QueueHandle {
		self.handle.clone()
	}

	/// Returns the number of queued units.
	pub fn len(&self) -> usize {
		self.inner.queue.lock().len()
	}

	/// Returns `true` if nothing is queued.
	pub fn is_empty(&self) -> bool {
		self.inner.queue.lock().is_empty()
	}

	/// Runs the oldest queued unit, if any.
	///
	/// Returns `Some(true)` when the unit completed, `Some(false)` when it
	/// panicked and `None` when the queue was empty.
	pub fn run_next(&self) -> Option<bool> {
		// The lock is released before running so the unit can enqueue more work.
		let task = self.inner.queue.lock().pop_front()?;
		match catch_unwind(AssertUnwindSafe(task)) {
			Ok(()) => Some(true),
			Err(payload) => {
				tracing::error!(panic = %panic_message(&*payload), "queue.unit.panicked");
				Some(false)
			}
		}
	}

	/// Runs units until the queue is empty, including units enqueued while
	/// draining. Returns the number of units run.
	pub fn drain(&self) -> u64 {
		self.drain_with(DrainBudget::UNBOUNDED).completed
	}

	/// Runs units until the queue is empty or `budget` is exhausted.
	pub fn drain_with(&self, budget: DrainBudget) -> DrainReport {
		if budget.max_completions == 0 {
			return DrainReport {
				pending: self.len(),
				budget_exhausted: !self.is_empty(),
				..DrainReport::default()
			};
		}

		let deadline = Instant::now().checked_add(budget.duration);
		let mut report = DrainReport::default();

		loop {
			if report.completed as usize >= budget.max_completions || deadline.is_some_and(|d| Instant::now() >= d) {
				report.budget_exhausted = true;
				break;
			}
			match self.run_next() {
				Some(ok) => {
					report.completed = report.completed.wrapping_add(1);
					if !ok {
						report.panicked = report.panicked.wrapping_add(1);
					}
				}
				None => break,
			}
		}

		report.pending = self.len();
		report.budget_exhausted &= report.pending > 0;
		tracing::trace!(
			completed = report.completed,
			panicked = report.panicked,
			pending = report.pending,
			"queue.drain"
		);
		report
	}
}
