//! Deriving cells from handler pairs.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use vow_worker::panic_message;

use crate::cell::{Deferred, Payload, Reason};
use crate::error::DeferredError;
use crate::resolve::{Resolution, resolve};

/// A chained success or failure handler.
pub type Handler<V, U, E> = Box<dyn FnOnce(V) -> Result<Resolution<U, E>, E> + Send + 'static>;

/// Handler pair for [`derive`].
///
/// The success handler is always present: [`Handlers::identity`] and
/// [`Handlers::recover`] substitute a pass-through one. A missing failure
/// handler re-raises the reason unchanged.
pub struct Handlers<T, U, E> {
	on_fulfilled: Handler<T, U, E>,
	on_rejected: Option<Handler<E, U, E>>,
}

impl<T, U, E> Handlers<T, U, E> {
	/// Handlers with a success handler and no failure handler.
	pub fn new<F>(on_fulfilled: F) -> Self
	where
		F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
	{
		Self {
			on_fulfilled: Box::new(on_fulfilled),
			on_rejected: None,
		}
	}

	/// Sets the failure handler.
	#[must_use]
	pub fn on_rejected<R>(mut self, on_rejected: R) -> Self
	where
		R: FnOnce(E) -> Result<Resolution<U, E>, E> + Send + 'static,
	{
		self.on_rejected = Some(Box::new(on_rejected));
		self
	}
}

impl<T: Payload, E: Payload> Handlers<T, T, E> {
	/// Pass-through handlers: values and reasons propagate unchanged.
	pub fn identity() -> Self {
		Self {
			on_fulfilled: Box::new(|value: T| -> Result<Resolution<T, E>, E> { Ok(Resolution::Value(value)) }),
			on_rejected: None,
		}
	}

	/// Pass-through success handler plus a failure handler.
	pub fn recover<R>(on_rejected: R) -> Self
	where
		R: FnOnce(E) -> Result<Resolution<T, E>, E> + Send + 'static,
	{
		Self::identity().on_rejected(on_rejected)
	}
}

impl<T, U, E> fmt::Debug for Handlers<T, U, E> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Handlers").field("on_rejected", &self.on_rejected.is_some()).finish_non_exhaustive()
	}
}

/// Derives a new cell from `cell` through `handlers`.
///
/// The derived cell is returned before either handler runs. Whichever
/// handler matches the source's outcome runs on a later turn; its result
/// goes through the resolution procedure, and an `Err` or a panic rejects
/// the derived cell.
pub fn derive<T, U, E>(cell: &Deferred<T, E>, handlers: Handlers<T, U, E>) -> Deferred<U, E>
where
	T: Payload,
	U: Payload,
	E: Reason,
{
	let Handlers { on_fulfilled, on_rejected } = handlers;
	let on_rejected = on_rejected.unwrap_or_else(reraise);

	let derived = Deferred::pending(cell.queue());
	tracing::trace!(source = cell.id(), deferred = derived.id(), "deferred.derive");

	let on_value = derived.clone();
	let on_reason = derived.clone();
	cell.register_observers(
		move |value| run_handler(&on_value, move || on_fulfilled(value)),
		move |reason| run_handler(&on_reason, move || on_rejected(reason)),
	);
	derived
}

fn reraise<U, E>() -> Handler<E, U, E>
where
	U: 'static,
	E: 'static,
{
	Box::new(|reason: E| -> Result<Resolution<U, E>, E> { Err(reason) })
}

fn run_handler<U, E>(derived: &Deferred<U, E>, handler: impl FnOnce() -> Result<Resolution<U, E>, E>)
where
	U: Payload,
	E: Reason,
{
	match catch_unwind(AssertUnwindSafe(handler)) {
		Ok(Ok(resolution)) => resolve(derived, resolution),
		Ok(Err(reason)) => {
			derived.settle(Err(reason));
		}
		Err(payload) => {
			let err = DeferredError::HandlerPanicked(panic_message(&*payload));
			tracing::debug!(deferred = derived.id(), error = %err, "deferred.handler.panicked");
			derived.settle(Err(err.into()));
		}
	}
}

impl<T: Payload, E: Reason> Deferred<T, E> {
	/// Derives a cell with both a success and a failure handler.
	pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
	where
		U: Payload,
		F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
		R: FnOnce(E) -> Result<Resolution<U, E>, E> + Send + 'static,
	{
		derive(self, Handlers::new(on_fulfilled).on_rejected(on_rejected))
	}

	/// Derives a cell from the success path; failures propagate unchanged.
	pub fn and_then<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
	where
		U: Payload,
		F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
	{
		derive(self, Handlers::new(on_fulfilled))
	}

	/// Derives a cell holding `f` applied to the value.
	pub fn map<U, F>(&self, f: F) -> Deferred<U, E>
	where
		U: Payload,
		F: FnOnce(T) -> U + Send + 'static,
	{
		self.and_then(move |value| Ok(Resolution::Value(f(value))))
	}

	/// Derives a cell from the failure path; values propagate unchanged.
	pub fn or_else<R>(&self, on_rejected: R) -> Deferred<T, E>
	where
		R: FnOnce(E) -> Result<Resolution<T, E>, E> + Send + 'static,
	{
		derive(self, Handlers::recover(on_rejected))
	}
}
