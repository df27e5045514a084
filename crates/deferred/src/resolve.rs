//! Normalizing handler results into the settlement of a derived cell.
//!
//! A handler may hand back a plain value, another [`Deferred`] of the same
//! kind, or any foreign object implementing [`Thenable`]. [`resolve`] adopts
//! each of these onto the target cell. Nested adoption never recurses on the
//! stack: anything that is not a plain value is picked up again on a later
//! turn of the target's queue.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use vow_worker::panic_message;

use crate::cell::{Deferred, Payload, Reason};
use crate::error::DeferredError;

/// Result a handler produces for the cell it derives.
pub enum Resolution<T, E> {
	/// Fulfill with this value.
	Value(T),
	/// Adopt the eventual outcome of another cell.
	Deferred(Deferred<T, E>),
	/// Adopt the eventual outcome of a foreign continuation protocol.
	Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
	/// Wraps a closure as a thenable whose `then` member is always callable.
	pub fn thenable<F>(then: F) -> Self
	where
		F: FnOnce(ThenValue<T, E>, ThenReason<T, E>) -> Result<(), E> + Send + 'static,
		T: 'static,
		E: 'static,
	{
		Self::Thenable(Box::new(FnThenable(then)))
	}
}

impl<T, E> From<Deferred<T, E>> for Resolution<T, E> {
	fn from(cell: Deferred<T, E>) -> Self {
		Self::Deferred(cell)
	}
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
			Self::Deferred(cell) => f.debug_tuple("Deferred").field(cell).finish(),
			Self::Thenable(_) => f.write_str("Thenable(..)"),
		}
	}
}

/// A foreign `then` implementation.
///
/// Receives the value callback and the reason callback. Returning `Err`
/// rejects the adopting cell unless one of the callbacks already won.
pub type ThenFn<T, E> = Box<dyn FnOnce(ThenValue<T, E>, ThenReason<T, E>) -> Result<(), E> + Send + 'static>;

/// What a foreign object exposes under its continuation member.
pub enum ThenMember<T, E> {
	/// A callable `then`; the object is adopted through it.
	Callable(ThenFn<T, E>),
	/// No callable member; the object itself is the fulfillment value.
	Plain(T),
}

/// Capability check for foreign deferred-value implementations.
///
/// Anything that can produce a continuation member is adoptable, whatever
/// its origin. Reading the member may fail, which rejects the adopting cell.
pub trait Thenable<T, E>: Send + 'static {
	/// Reads the continuation member, consuming the object.
	fn then_member(self: Box<Self>) -> Result<ThenMember<T, E>, E>;
}

struct FnThenable<F>(F);

impl<T, E, F> Thenable<T, E> for FnThenable<F>
where
	F: FnOnce(ThenValue<T, E>, ThenReason<T, E>) -> Result<(), E> + Send + 'static,
	T: 'static,
	E: 'static,
{
	fn then_member(self: Box<Self>) -> Result<ThenMember<T, E>, E> {
		Ok(ThenMember::Callable(Box::new(self.0)))
	}
}

/// One-shot guard shared by the callbacks handed to a single `then` call.
#[derive(Clone, Default)]
struct Latch(Arc<AtomicBool>);

impl Latch {
	/// Returns true for the first caller only.
	fn trip(&self) -> bool {
		!self.0.swap(true, Ordering::AcqRel)
	}
}

/// Value callback handed to a foreign `then`.
///
/// May be cloned, stored and called from anywhere; only the first call to
/// this or its paired [`ThenReason`] has any effect.
pub struct ThenValue<T, E> {
	target: Deferred<T, E>,
	latch: Latch,
}

/// Reason callback handed to a foreign `then`. Shares a latch with its
/// [`ThenValue`].
pub struct ThenReason<T, E> {
	target: Deferred<T, E>,
	latch: Latch,
}

impl<T: Payload, E: Reason> ThenValue<T, E> {
	/// Resolves the adopting cell with `value`.
	///
	/// Plain values settle right away; cells and thenables are resolved on a
	/// later turn.
	pub fn call(&self, value: Resolution<T, E>) {
		if !self.latch.trip() {
			tracing::trace!(deferred = self.target.id(), "deferred.thenable.latched");
			return;
		}
		match value {
			Resolution::Value(value) => {
				self.target.settle(Ok(value));
			}
			next => {
				let target = self.target.clone();
				self.target.queue().enqueue(move || resolve(&target, next));
			}
		}
	}
}

impl<T: Payload, E: Payload> ThenReason<T, E> {
	/// Rejects the adopting cell with `reason`.
	pub fn call(&self, reason: E) {
		if !self.latch.trip() {
			tracing::trace!(deferred = self.target.id(), "deferred.thenable.latched");
			return;
		}
		self.target.settle(Err(reason));
	}
}

impl<T, E> Clone for ThenValue<T, E> {
	fn clone(&self) -> Self {
		Self {
			target: self.target.clone(),
			latch: self.latch.clone(),
		}
	}
}

impl<T, E> Clone for ThenReason<T, E> {
	fn clone(&self) -> Self {
		Self {
			target: self.target.clone(),
			latch: self.latch.clone(),
		}
	}
}

impl<T, E> fmt::Debug for ThenValue<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ThenValue").field("deferred", &self.target.id()).finish()
	}
}

impl<T, E> fmt::Debug for ThenReason<T, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ThenReason").field("deferred", &self.target.id()).finish()
	}
}

/// Settles `target` from `resolution`.
pub(crate) fn resolve<T: Payload, E: Reason>(target: &Deferred<T, E>, resolution: Resolution<T, E>) {
	let mut current = resolution;
	loop {
		match current {
			Resolution::Value(value) => {
				target.settle(Ok(value));
				return;
			}
			Resolution::Deferred(source) => {
				adopt_cell(target, source);
				return;
			}
			Resolution::Thenable(object) => match read_member(target, object) {
				Some(ThenMember::Plain(value)) => current = Resolution::Value(value),
				Some(ThenMember::Callable(then)) => {
					invoke_then(target, then);
					return;
				}
				None => return,
			},
		}
	}
}

fn adopt_cell<T: Payload, E: Reason>(target: &Deferred<T, E>, source: Deferred<T, E>) {
	if source.ptr_eq(target) {
		tracing::debug!(deferred = target.id(), "deferred.resolve.cycle");
		target.settle(Err(DeferredError::CyclicReference(target.id()).into()));
		return;
	}

	match source.peek() {
		Some(outcome) => {
			target.settle(outcome);
		}
		None => {
			tracing::trace!(deferred = target.id(), source = source.id(), "deferred.resolve.adopt");
			let on_value = target.clone();
			let on_reason = target.clone();
			source.register_observers(
				move |value| resolve(&on_value, Resolution::Value(value)),
				move |reason| {
					on_reason.settle(Err(reason));
				},
			);
		}
	}
}

fn read_member<T: Payload, E: Reason>(target: &Deferred<T, E>, object: Box<dyn Thenable<T, E>>) -> Option<ThenMember<T, E>> {
	match catch_unwind(AssertUnwindSafe(move || object.then_member())) {
		Ok(Ok(member)) => Some(member),
		Ok(Err(reason)) => {
			tracing::trace!(deferred = target.id(), "deferred.thenable.member_failed");
			target.settle(Err(reason));
			None
		}
		Err(payload) => {
			let err = DeferredError::ThenablePanicked(panic_message(&*payload));
			tracing::debug!(deferred = target.id(), error = %err, "deferred.thenable.panicked");
			target.settle(Err(err.into()));
			None
		}
	}
}

fn invoke_then<T: Payload, E: Reason>(target: &Deferred<T, E>, then: ThenFn<T, E>) {
	let latch = Latch::default();
	let on_value = ThenValue {
		target: target.clone(),
		latch: latch.clone(),
	};
	let on_reason = ThenReason {
		target: target.clone(),
		latch: latch.clone(),
	};

	let failure: E = match catch_unwind(AssertUnwindSafe(move || then(on_value, on_reason))) {
		Ok(Ok(())) => return,
		Ok(Err(reason)) => reason,
		Err(payload) => DeferredError::ThenablePanicked(panic_message(&*payload)).into(),
	};

	if latch.trip() {
		target.settle(Err(failure));
	} else {
		tracing::trace!(deferred = target.id(), "deferred.thenable.latched");
	}
}
