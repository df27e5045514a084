//! The task queue capability and its shared handle.

use std::fmt;
use std::sync::Arc;

/// One scheduled unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Host capability for deferring work to a later turn.
///
/// Implementations must never run `task` before `enqueue` returns, and must
/// run units enqueued by one producer in the order they were enqueued.
pub trait TaskQueue: Send + Sync + 'static {
	/// Schedules `task` to run after the current call stack unwinds.
	fn enqueue(&self, task: Task);
}

/// Shared handle to a host task queue.
///
/// Cells store one of these and hand it to every cell derived from them.
#[derive(Clone)]
pub struct QueueHandle {
	inner: Arc<dyn TaskQueue>,
}

impl QueueHandle {
	/// Wraps a queue implementation.
	pub fn new(queue: impl TaskQueue) -> Self {
		Self { inner: Arc::new(queue) }
	}

	/// Schedules `task` on the underlying queue.
	pub fn enqueue<F>(&self, task: F)
	where
		F: FnOnce() + Send + 'static,
	{
		self.inner.enqueue(Box::new(task));
	}

	/// Returns true when both handles point at the same queue.
	pub fn same_queue(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl fmt::Debug for QueueHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("QueueHandle").field("queue", &Arc::as_ptr(&self.inner)).finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;

	#[derive(Default)]
	struct Recording {
		tasks: Mutex<Vec<Task>>,
	}

	impl TaskQueue for Arc<Recording> {
		fn enqueue(&self, task: Task) {
			self.tasks.lock().unwrap().push(task);
		}
	}

	#[test]
	fn enqueue_defers_to_the_wrapped_queue() {
		let recording = Arc::new(Recording::default());
		let handle = QueueHandle::new(Arc::clone(&recording));

		let ran = Arc::new(Mutex::new(false));
		let flag = Arc::clone(&ran);
		handle.enqueue(move || *flag.lock().unwrap() = true);

		assert!(!*ran.lock().unwrap(), "enqueue must not run the task inline");
		let tasks = std::mem::take(&mut *recording.tasks.lock().unwrap());
		assert_eq!(tasks.len(), 1);
		for task in tasks {
			task();
		}
		assert!(*ran.lock().unwrap());
	}

	#[test]
	fn clones_share_the_queue() {
		let handle = QueueHandle::new(Arc::new(Recording::default()));
		let other = QueueHandle::new(Arc::new(Recording::default()));
		assert!(handle.same_queue(&handle.clone()));
		assert!(!handle.same_queue(&other));
	}
}
