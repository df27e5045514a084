//! Host queue driven by a tokio task.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::panic::panic_message;
use crate::queue::{QueueHandle, Task, TaskQueue};

/// Counts one unit in `pending` until dropped, whether it ran or was
/// discarded with the channel.
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
	fn new(pending: &Arc<AtomicUsize>) -> Self {
		pending.fetch_add(1, Ordering::AcqRel);
		Self(Arc::clone(pending))
	}
}

impl Drop for PendingGuard {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::AcqRel);
	}
}

struct Unit {
	task: Task,
	pending: PendingGuard,
}

struct DriverSender {
	name: Arc<str>,
	tx: mpsc::UnboundedSender<Unit>,
	pending: Arc<AtomicUsize>,
}

impl TaskQueue for DriverSender {
	fn enqueue(&self, task: Task) {
		let unit = Unit {
			task,
			pending: PendingGuard::new(&self.pending),
		};
		if self.tx.send(unit).is_err() {
			tracing::warn!(queue = %self.name, "queue.enqueue.closed");
		}
	}
}

/// Host queue backed by one driver task on a tokio runtime.
///
/// A single consumer runs units in the order they were enqueued, each on a
/// later turn than the enqueueing code. The driver exits once every
/// [`QueueHandle`] onto it has been dropped.
#[derive(Debug)]
pub struct TokioQueue {
	handle: QueueHandle,
	pending: Arc<AtomicUsize>,
	driver: JoinHandle<()>,
}

impl TokioQueue {
	/// Starts a driver on the runtime the caller is running in.
	pub fn spawn(config: &QueueConfig) -> Result<Self, QueueError> {
		let runtime = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
		Self::spawn_on(&runtime, config)
	}

	/// Starts a driver on an explicit runtime.
	pub fn spawn_on(runtime: &Handle, config: &QueueConfig) -> Result<Self, QueueError> {
		config.validate()?;
		let (tx, rx) = mpsc::unbounded_channel();
		let name: Arc<str> = Arc::from(config.name.as_str());
		let pending = Arc::new(AtomicUsize::new(0));

		tracing::debug!(queue = %name, yield_every = config.yield_every, "queue.driver.spawn");
		let driver = runtime.spawn(drive(Arc::clone(&name), rx, config.yield_every));
		let sender = DriverSender {
			name,
			tx,
			pending: Arc::clone(&pending),
		};

		Ok(Self {
			handle: QueueHandle::new(sender),
			pending,
			driver,
		})
	}

	/// Returns a handle cells can schedule onto.
	pub fn handle(&self) -> QueueHandle {
		self.handle.clone()
	}

	/// Returns the number of units enqueued but not yet finished.
	pub fn pending(&self) -> usize {
		self.pending.load(Ordering::Acquire)
	}

	/// Drops this queue's own handle and waits for the driver to finish.
	///
	/// The driver only finishes after every other handle (including the ones
	/// held by cells and their observers) is gone and the backlog has run.
	pub async fn join(self) {
		let Self { handle, driver, .. } = self;
		drop(handle);
		if let Err(err) = driver.await {
			tracing::error!(error = %err, "queue.driver.join_failed");
		}
	}

	/// Stops the driver, dropping any backlog.
	///
	/// The backlog is released once the runtime cancels the driver task;
	/// [`Self::pending`] drops to zero at that point.
	pub fn abort(&self) {
		self.driver.abort();
	}
}

async fn drive(name: Arc<str>, mut rx: mpsc::UnboundedReceiver<Unit>, yield_every: usize) {
	let mut ran = 0usize;
	while let Some(Unit { task, pending }) = rx.recv().await {
		if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
			tracing::error!(queue = %name, panic = %panic_message(&*payload), "queue.unit.panicked");
		}
		drop(pending);

		ran = ran.wrapping_add(1);
		if ran % yield_every == 0 {
			tokio::task::yield_now().await;
		}
	}
	tracing::debug!(queue = %name, ran, "queue.driver.exit");
}
