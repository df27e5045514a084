//! Error types for queue construction and configuration.

use thiserror::Error;

/// Errors raised while starting a host queue.
#[derive(Debug, Error)]
pub enum QueueError {
	/// No tokio runtime is active on the calling thread.
	#[error("no tokio runtime is active; use TokioQueue::spawn_on with an explicit handle")]
	NoRuntime,

	/// The supplied configuration failed validation.
	#[error(transparent)]
	Config(#[from] ConfigError),
}

/// Errors that can occur when loading queue configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error parsing TOML syntax or shape.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// A field holds a value outside its accepted range.
	#[error("invalid value for '{field}': {reason}")]
	Invalid {
		/// The offending field name.
		field: &'static str,
		/// Why the value was refused.
		reason: &'static str,
	},
}
