//! Awaiting a cell's outcome from async code.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cell::{Deferred, Payload, Reason};
use crate::error::DeferredError;

/// Future resolving to a cell's outcome.
///
/// Created by [`Deferred::outcome`]. Resolves only once the cell's queue has
/// run the observer, so it needs a queue that is being driven. If the queue
/// drops the observer without running it, or the cell is dropped while still
/// pending, the future yields [`DeferredError::Abandoned`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Outcome<T, E> {
	rx: oneshot::Receiver<Result<T, E>>,
}

impl<T: Payload, E: Reason> Deferred<T, E> {
	/// Returns a future for this cell's eventual outcome.
	pub fn outcome(&self) -> Outcome<T, E> {
		let (tx, rx) = oneshot::channel();
		let on_value = Arc::new(Mutex::new(Some(tx)));
		let on_reason = Arc::clone(&on_value);

		self.register_observers(
			move |value| {
				if let Some(tx) = on_value.lock().take() {
					let _ = tx.send(Ok(value));
				}
			},
			move |reason| {
				if let Some(tx) = on_reason.lock().take() {
					let _ = tx.send(Err(reason));
				}
			},
		);
		Outcome { rx }
	}
}

impl<T, E: From<DeferredError>> Future for Outcome<T, E> {
	type Output = Result<T, E>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
			Poll::Ready(Err(_)) => Poll::Ready(Err(DeferredError::Abandoned.into())),
			Poll::Pending => Poll::Pending,
		}
	}
}
