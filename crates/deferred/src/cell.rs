//! The settlement cell and its fulfill/reject capabilities.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use vow_worker::{QueueHandle, panic_message};

use crate::error::DeferredError;

/// Values a cell can settle with.
///
/// `Clone` hands every observer the same settled value.
pub trait Payload: Clone + Send + 'static {}

impl<T> Payload for T where T: Clone + Send + 'static {}

/// Rejection reasons. The core rejects with [`DeferredError`] on its own
/// failures, so reasons must be constructible from it.
pub trait Reason: Payload + From<DeferredError> {}

impl<E> Reason for E where E: Payload + From<DeferredError> {}

pub(crate) type Observer<V> = Box<dyn FnOnce(V) + Send + 'static>;

enum State<T, E> {
	Pending {
		on_fulfilled: Vec<Observer<T>>,
		on_rejected: Vec<Observer<E>>,
	},
	Fulfilled(T),
	Rejected(E),
}

/// Result of one settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
	/// This attempt moved the cell out of pending.
	Settled,
	/// The cell was already settled; the attempt had no effect.
	AlreadySettled,
}

struct Inner<T, E> {
	id: u64,
	queue: QueueHandle,
	state: Mutex<State<T, E>>,
	ignored: AtomicUsize,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Single-assignment cell settled once with a value or a reason.
///
/// Observers never run inline: settlement and late registration both hand
/// callbacks to the cell's [`QueueHandle`], in registration order. Clones
/// share the same cell.
pub struct Deferred<T, E> {
	inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T, E> fmt::Debug for Deferred<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = match self.inner.state.try_lock().as_deref() {
			Some(State::Pending { .. }) => "pending",
			Some(State::Fulfilled(_)) => "fulfilled",
			Some(State::Rejected(_)) => "rejected",
			None => "locked",
		};
		f.debug_struct("Deferred").field("id", &self.inner.id).field("state", &state).finish()
	}
}

impl<T, E> Deferred<T, E> {
	/// Process-unique identifier, used in log events and cycle errors.
	pub fn id(&self) -> u64 {
		self.inner.id
	}

	/// Queue this cell schedules its observers on.
	pub fn queue(&self) -> &QueueHandle {
		&self.inner.queue
	}

	/// Number of settlement attempts that lost to an earlier one.
	pub fn ignored_settlements(&self) -> usize {
		self.inner.ignored.load(Ordering::Relaxed)
	}

	/// Returns true when both handles refer to the same cell.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl<T: Payload, E: Payload> Deferred<T, E> {
	pub(crate) fn pending(queue: &QueueHandle) -> Self {
		Self {
			inner: Arc::new(Inner {
				id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
				queue: queue.clone(),
				state: Mutex::new(State::Pending {
					on_fulfilled: Vec::new(),
					on_rejected: Vec::new(),
				}),
				ignored: AtomicUsize::new(0),
			}),
		}
	}

	/// Creates a pending cell together with its two settlement capabilities.
	pub fn with_resolvers(queue: &QueueHandle) -> (Self, Fulfiller<T, E>, Rejecter<T, E>) {
		let cell = Self::pending(queue);
		let fulfiller = Fulfiller { cell: cell.clone() };
		let rejecter = Rejecter { cell: cell.clone() };
		(cell, fulfiller, rejecter)
	}

	/// Creates a cell already fulfilled with `value`.
	pub fn fulfilled(queue: &QueueHandle, value: T) -> Self {
		let cell = Self::pending(queue);
		cell.settle(Ok(value));
		cell
	}

	/// Creates a cell already rejected with `reason`.
	pub fn rejected(queue: &QueueHandle, reason: E) -> Self {
		let cell = Self::pending(queue);
		cell.settle(Err(reason));
		cell
	}

	/// Registers one callback per outcome.
	///
	/// While pending, the callbacks are stored. Once settled, the matching
	/// callback is scheduled right away and the other is dropped. Neither
	/// ever runs before this call returns.
	pub fn register_observers<F, R>(&self, on_fulfilled: F, on_rejected: R)
	where
		F: FnOnce(T) + Send + 'static,
		R: FnOnce(E) + Send + 'static,
	{
		// Late observers are enqueued under the state lock so they queue up
		// behind the observers a concurrent settlement is still scheduling.
		let mut state = self.inner.state.lock();
		match &mut *state {
			State::Pending {
				on_fulfilled: fulfilled,
				on_rejected: rejected,
			} => {
				fulfilled.push(Box::new(on_fulfilled));
				rejected.push(Box::new(on_rejected));
			}
			State::Fulfilled(value) => {
				let value = value.clone();
				tracing::trace!(deferred = self.inner.id, "deferred.observe.late");
				self.inner.queue.enqueue(move || on_fulfilled(value));
			}
			State::Rejected(reason) => {
				let reason = reason.clone();
				tracing::trace!(deferred = self.inner.id, "deferred.observe.late");
				self.inner.queue.enqueue(move || on_rejected(reason));
			}
		}
	}

	/// Moves the cell out of pending, or records a losing attempt.
	pub(crate) fn settle(&self, outcome: Result<T, E>) -> SettleOutcome {
		let mut state = self.inner.state.lock();
		let (on_fulfilled, on_rejected) = match &mut *state {
			State::Pending { on_fulfilled, on_rejected } => (std::mem::take(on_fulfilled), std::mem::take(on_rejected)),
			_ => {
				drop(state);
				let ignored = self.inner.ignored.fetch_add(1, Ordering::Relaxed) + 1;
				tracing::trace!(deferred = self.inner.id, ignored, "deferred.settle.ignored");
				return SettleOutcome::AlreadySettled;
			}
		};

		// Enqueued under the lock so late registrations queue behind these.
		// `enqueue` never runs a unit inline.
		match outcome {
			Ok(value) => {
				*state = State::Fulfilled(value.clone());
				tracing::trace!(deferred = self.inner.id, outcome = "fulfilled", observers = on_fulfilled.len(), "deferred.settle");
				schedule_all(&self.inner.queue, on_fulfilled, value);
			}
			Err(reason) => {
				*state = State::Rejected(reason.clone());
				tracing::trace!(deferred = self.inner.id, outcome = "rejected", observers = on_rejected.len(), "deferred.settle");
				schedule_all(&self.inner.queue, on_rejected, reason);
			}
		}
		drop(state);
		SettleOutcome::Settled
	}

	/// Settled outcome, if any. Internal: adoption of an already settled
	/// cell reads through this, everything public goes through observers.
	pub(crate) fn peek(&self) -> Option<Result<T, E>> {
		match &*self.inner.state.lock() {
			State::Pending { .. } => None,
			State::Fulfilled(value) => Some(Ok(value.clone())),
			State::Rejected(reason) => Some(Err(reason.clone())),
		}
	}
}

impl<T: Payload, E: Reason> Deferred<T, E> {
	/// Creates a cell and runs `setup` synchronously with its capabilities.
	///
	/// An `Err` or a panic from `setup` rejects the cell, unless `setup` had
	/// already settled it.
	pub fn new<S>(queue: &QueueHandle, setup: S) -> Self
	where
		S: FnOnce(Fulfiller<T, E>, Rejecter<T, E>) -> Result<(), E>,
	{
		let (cell, fulfiller, rejecter) = Self::with_resolvers(queue);
		match catch_unwind(AssertUnwindSafe(move || setup(fulfiller, rejecter))) {
			Ok(Ok(())) => {}
			Ok(Err(reason)) => {
				cell.settle(Err(reason));
			}
			Err(payload) => {
				let err = DeferredError::SetupPanicked(panic_message(&*payload));
				tracing::debug!(deferred = cell.id(), error = %err, "deferred.setup.panicked");
				cell.settle(Err(err.into()));
			}
		}
		cell
	}
}

fn schedule_all<V: Payload>(queue: &QueueHandle, observers: Vec<Observer<V>>, payload: V) {
	for observer in observers {
		let payload = payload.clone();
		queue.enqueue(move || observer(payload));
	}
}

/// Capability that fulfills one cell. First settlement wins.
pub struct Fulfiller<T, E> {
	cell: Deferred<T, E>,
}

/// Capability that rejects one cell. First settlement wins.
pub struct Rejecter<T, E> {
	cell: Deferred<T, E>,
}

impl<T: Payload, E: Payload> Fulfiller<T, E> {
	/// Fulfills the cell with `value`; a no-op once the cell is settled.
	pub fn fulfill(&self, value: T) -> SettleOutcome {
		self.cell.settle(Ok(value))
	}
}

impl<T: Payload, E: Payload> Rejecter<T, E> {
	/// Rejects the cell with `reason`; a no-op once the cell is settled.
	pub fn reject(&self, reason: E) -> SettleOutcome {
		self.cell.settle(Err(reason))
	}
}

impl<T, E> Clone for Fulfiller<T, E> {
	fn clone(&self) -> Self {
		Self { cell: self.cell.clone() }
	}
}

impl<T, E> Clone for Rejecter<T, E> {
	fn clone(&self) -> Self {
		Self { cell: self.cell.clone() }
	}
}

impl<T, E> fmt::Debug for Fulfiller<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Fulfiller").field("deferred", &self.cell.id()).finish()
	}
}

impl<T, E> fmt::Debug for Rejecter<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Rejecter").field("deferred", &self.cell.id()).finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicBool;
	use std::time::Duration;

	use pretty_assertions::assert_eq;
	use proptest::prelude::*;
	use vow_worker::{ManualQueue, Task, TaskQueue};

	use super::*;
	use crate::test_support::{Observed, observe};

	#[test]
	fn first_settlement_wins() {
		let queue = ManualQueue::new();
		let (cell, fulfill, reject) = Deferred::<u32, String>::with_resolvers(&queue.handle());

		assert_eq!(fulfill.fulfill(1), SettleOutcome::Settled);
		assert_eq!(reject.reject("late".into()), SettleOutcome::AlreadySettled);
		assert_eq!(fulfill.fulfill(2), SettleOutcome::AlreadySettled);
		assert_eq!(cell.ignored_settlements(), 2);

		let seen = observe(&cell);
		queue.drain();
		assert_eq!(seen.take(), Some(Ok(1)));
	}

	#[test]
	fn observer_on_settled_cell_runs_on_a_later_turn() {
		let queue = ManualQueue::new();
		let cell = Deferred::<u32, String>::fulfilled(&queue.handle(), 5);

		let ran = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&ran);
		cell.register_observers(move |_| flag.store(true, Ordering::SeqCst), |_| {});

		assert!(!ran.load(Ordering::SeqCst), "observer must not run inside register_observers");
		queue.drain();
		assert!(ran.load(Ordering::SeqCst));
	}

	#[test]
	fn settlement_does_not_run_observers_inline() {
		let queue = ManualQueue::new();
		let (cell, fulfill, _) = Deferred::<u32, String>::with_resolvers(&queue.handle());
		let seen = observe(&cell);

		fulfill.fulfill(3);
		assert_eq!(seen.take(), None);
		assert_eq!(queue.len(), 1);
		queue.drain();
		assert_eq!(seen.take(), Some(Ok(3)));
	}

	#[test]
	fn observers_fire_in_registration_order() {
		let queue = ManualQueue::new();
		let (cell, fulfill, _) = Deferred::<u32, String>::with_resolvers(&queue.handle());
		let log = Arc::new(Mutex::new(Vec::new()));

		for i in 1..=5 {
			let log = Arc::clone(&log);
			cell.register_observers(move |_| log.lock().push(i), |_| {});
		}
		fulfill.fulfill(0);
		queue.drain();

		assert_eq!(*log.lock(), vec![1, 2, 3, 4, 5]);
	}

	#[test]
	fn only_the_matching_observer_list_fires() {
		let queue = ManualQueue::new();
		let (cell, _, reject) = Deferred::<u32, String>::with_resolvers(&queue.handle());
		let log = Arc::new(Mutex::new(Vec::new()));

		let on_ok = Arc::clone(&log);
		let on_err = Arc::clone(&log);
		cell.register_observers(move |v: u32| on_ok.lock().push(format!("ok {v}")), move |r: String| on_err.lock().push(format!("err {r}")));
		reject.reject("nope".into());
		queue.drain();

		assert_eq!(*log.lock(), vec!["err nope".to_string()]);
	}

	#[test]
	fn late_observers_see_the_same_payload() {
		let queue = ManualQueue::new();
		let cell = Deferred::<String, String>::rejected(&queue.handle(), "boom".into());
		let first = observe(&cell);
		queue.drain();
		let second = observe(&cell);
		queue.drain();

		assert_eq!(first.take(), Some(Err("boom".to_string())));
		assert_eq!(second.take(), Some(Err("boom".to_string())));
	}

	#[test]
	fn setup_runs_synchronously() {
		let queue = ManualQueue::new();
		let ran = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&ran);
		let cell = Deferred::<u32, String>::new(&queue.handle(), move |fulfill, _| {
			flag.store(true, Ordering::SeqCst);
			fulfill.fulfill(9);
			Ok(())
		});

		assert!(ran.load(Ordering::SeqCst));
		let seen = observe(&cell);
		queue.drain();
		assert_eq!(seen.take(), Some(Ok(9)));
	}

	#[test]
	fn setup_error_rejects() {
		let queue = ManualQueue::new();
		let cell = Deferred::<u32, String>::new(&queue.handle(), |_, _| Err("setup failed".into()));
		let seen = observe(&cell);
		queue.drain();
		assert_eq!(seen.take(), Some(Err("setup failed".to_string())));
	}

	#[test]
	fn setup_panic_rejects_with_message() {
		let queue = ManualQueue::new();
		let cell = Deferred::<u32, DeferredError>::new(&queue.handle(), |_, _| panic!("exploded"));
		let seen = observe(&cell);
		queue.drain();
		assert_eq!(seen.take(), Some(Err(DeferredError::SetupPanicked("exploded".into()))));
	}

	#[test]
	fn setup_error_after_settling_is_ignored() {
		let queue = ManualQueue::new();
		let cell = Deferred::<u32, String>::new(&queue.handle(), |fulfill, _| {
			fulfill.fulfill(4);
			Err("too late".into())
		});
		let seen = observe(&cell);
		queue.drain();
		assert_eq!(seen.take(), Some(Ok(4)));
		assert_eq!(cell.ignored_settlements(), 1);
	}

	#[test]
	fn capabilities_can_settle_later() {
		let queue = ManualQueue::new();
		let stash: Arc<Mutex<Option<Fulfiller<u32, String>>>> = Arc::default();
		let slot = Arc::clone(&stash);
		let cell = Deferred::<u32, String>::new(&queue.handle(), move |fulfill, _| {
			*slot.lock() = Some(fulfill);
			Ok(())
		});
		let seen = observe(&cell);
		queue.drain();
		assert_eq!(seen.take(), None);

		stash.lock().take().unwrap().fulfill(11);
		queue.drain();
		assert_eq!(seen.take(), Some(Ok(11)));
	}

	#[test]
	fn concurrent_settlers_settle_exactly_once() {
		let queue = ManualQueue::new();
		let (cell, fulfill, reject) = Deferred::<usize, String>::with_resolvers(&queue.handle());
		let wins = Arc::new(AtomicUsize::new(0));

		std::thread::scope(|scope| {
			for i in 0..8 {
				let fulfill = fulfill.clone();
				let reject = reject.clone();
				let wins = Arc::clone(&wins);
				scope.spawn(move || {
					let outcome = if i % 2 == 0 { fulfill.fulfill(i) } else { reject.reject(i.to_string()) };
					if outcome == SettleOutcome::Settled {
						wins.fetch_add(1, Ordering::SeqCst);
					}
				});
			}
		});

		assert_eq!(wins.load(Ordering::SeqCst), 1);
		assert_eq!(cell.ignored_settlements(), 7);
	}

	/// Forwards to another queue, stalling on the first unit it receives.
	struct StallFirst {
		inner: QueueHandle,
		stalled: AtomicBool,
	}

	impl TaskQueue for StallFirst {
		fn enqueue(&self, task: Task) {
			if !self.stalled.swap(true, Ordering::SeqCst) {
				std::thread::sleep(Duration::from_millis(100));
			}
			self.inner.enqueue(task);
		}
	}

	#[test]
	fn late_observer_queues_behind_a_settlement_in_progress() {
		let manual = ManualQueue::new();
		let queue = QueueHandle::new(StallFirst {
			inner: manual.handle(),
			stalled: AtomicBool::new(false),
		});
		let (cell, fulfill, _) = Deferred::<u32, String>::with_resolvers(&queue);
		let log = Arc::new(Mutex::new(Vec::new()));
		let push = |label: &'static str| {
			let log = Arc::clone(&log);
			move |_: u32| log.lock().push(label)
		};

		cell.register_observers(push("early"), |_| {});
		std::thread::scope(|scope| {
			scope.spawn(move || fulfill.fulfill(1));
			std::thread::sleep(Duration::from_millis(20));
			cell.register_observers(push("late"), |_| {});
		});
		manual.drain();

		assert_eq!(*log.lock(), vec!["early", "late"]);
	}

	#[derive(Debug, Clone)]
	enum Attempt {
		Fulfill(u8),
		Reject(u8),
	}

	fn attempt() -> impl Strategy<Value = Attempt> {
		prop_oneof![any::<u8>().prop_map(Attempt::Fulfill), any::<u8>().prop_map(Attempt::Reject)]
	}

	proptest! {
		#[test]
		fn only_the_first_attempt_is_observed(attempts in prop::collection::vec(attempt(), 1..16), observers in 1usize..6) {
			let queue = ManualQueue::new();
			let (cell, fulfill, reject) = Deferred::<u8, String>::with_resolvers(&queue.handle());
			let early: Vec<Observed<u8, String>> = (0..observers).map(|_| observe(&cell)).collect();

			for attempt in &attempts {
				match attempt {
					Attempt::Fulfill(v) => { fulfill.fulfill(*v); }
					Attempt::Reject(v) => { reject.reject(v.to_string()); }
				}
			}
			let late = observe(&cell);
			queue.drain();

			let expected = match &attempts[0] {
				Attempt::Fulfill(v) => Ok(*v),
				Attempt::Reject(v) => Err(v.to_string()),
			};
			for seen in early.iter().chain(std::iter::once(&late)) {
				prop_assert_eq!(seen.take(), Some(expected.clone()));
			}
			prop_assert_eq!(cell.ignored_settlements(), attempts.len() - 1);
		}
	}
}
