use std::sync::Arc;

use parking_lot::Mutex;

use crate::cell::{Deferred, Payload};

/// Outcome slot filled by observers registered through [`observe`].
pub(crate) struct Observed<T, E>(Arc<Mutex<Option<Result<T, E>>>>);

impl<T, E> Observed<T, E> {
	pub(crate) fn take(&self) -> Option<Result<T, E>> {
		self.0.lock().take()
	}
}

/// Registers observers on `cell` that record its outcome.
pub(crate) fn observe<T: Payload, E: Payload>(cell: &Deferred<T, E>) -> Observed<T, E> {
	let slot = Arc::new(Mutex::new(None));
	let on_value = Arc::clone(&slot);
	let on_reason = Arc::clone(&slot);
	cell.register_observers(move |value| *on_value.lock() = Some(Ok(value)), move |reason| *on_reason.lock() = Some(Err(reason)));
	Observed(slot)
}
