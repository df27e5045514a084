//! Panic payload helpers.

use std::any::Any;

/// Extracts a readable message from a panic payload.
///
/// `panic!` with a literal carries a `&'static str`, formatted panics carry a
/// `String`; anything else is reported generically.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(msg) = payload.downcast_ref::<&'static str>() {
		(*msg).to_string()
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
