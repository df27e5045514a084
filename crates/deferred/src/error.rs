//! Rejection reasons produced by the cell machinery itself.

use thiserror::Error;

/// Failures the core converts into rejected settlements.
///
/// Application reasons stay in the caller's own reason type; that type only
/// needs `From<DeferredError>` so the core can reject with these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DeferredError {
	/// A handler returned the very cell it was deriving.
	#[error("cyclic reference: deferred #{0} cannot adopt itself")]
	CyclicReference(u64),

	/// The setup procedure panicked before settling the cell.
	#[error("setup panicked: {0}")]
	SetupPanicked(String),

	/// A chained handler panicked.
	#[error("handler panicked: {0}")]
	HandlerPanicked(String),

	/// Reading or invoking a foreign `then` member panicked.
	#[error("thenable panicked: {0}")]
	ThenablePanicked(String),

	/// The observer was dropped by its queue without ever running.
	#[error("deferred abandoned before its outcome was delivered")]
	Abandoned,
}

impl From<DeferredError> for String {
	fn from(err: DeferredError) -> Self {
		err.to_string()
	}
}
