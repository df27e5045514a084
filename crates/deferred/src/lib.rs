//! Deferred single-assignment cells with chained, queue-scheduled observers.
//!
//! A [`Deferred`] starts pending and settles once, with a value or a reason.
//! Observers are never run inline: every notification is a separate unit on
//! the host queue the cell was created with (see [`vow_worker`]), so a caller
//! that registers right after settling is never bypassed.
//!
//! Composition goes through [`derive`] and its shorthands ([`Deferred::then`],
//! [`Deferred::and_then`], [`Deferred::map`], [`Deferred::or_else`]). Handler
//! results are normalized by the resolution procedure, which adopts other
//! cells and any foreign [`Thenable`].

mod cell;
mod chain;
mod error;
mod future;
mod resolve;
#[cfg(test)]
mod test_support;

pub use cell::{Deferred, Fulfiller, Payload, Reason, Rejecter, SettleOutcome};
pub use chain::{Handler, Handlers, derive};
pub use error::DeferredError;
pub use future::Outcome;
pub use resolve::{Resolution, ThenFn, ThenMember, ThenReason, ThenValue, Thenable};
pub use vow_worker::QueueHandle;
