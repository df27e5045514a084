//! TOML-backed host queue configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::budget::DrainBudget;
use crate::error::ConfigError;

/// Host queue configuration.
///
/// Every field is optional in TOML; missing fields take the defaults below.
///
/// ```toml
/// name = "ui-continuations"
/// yield_every = 64
/// drain_max_completions = 1024
/// drain_timeout_ms = 50
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
	/// Name attached to driver log events.
	pub name: String,
	/// Units the tokio driver runs before yielding back to the runtime.
	pub yield_every: usize,
	/// Unit limit for one budgeted drain of a manual queue.
	pub drain_max_completions: usize,
	/// Wall-clock limit in milliseconds for one budgeted drain.
	pub drain_timeout_ms: u64,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			name: "vow-queue".to_string(),
			yield_every: 128,
			drain_max_completions: DrainBudget::DEFAULT_MAX_COMPLETIONS,
			drain_timeout_ms: DrainBudget::DEFAULT_TIMEOUT_MS,
		}
	}
}

impl QueueConfig {
	/// Parses and validates a TOML document.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Checks field ranges.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.yield_every == 0 {
			return Err(ConfigError::Invalid {
				field: "yield_every",
				reason: "must be > 0",
			});
		}
		if self.drain_max_completions == 0 {
			return Err(ConfigError::Invalid {
				field: "drain_max_completions",
				reason: "must be > 0",
			});
		}
		if self.drain_timeout_ms == 0 {
			return Err(ConfigError::Invalid {
				field: "drain_timeout_ms",
				reason: "must be > 0",
			});
		}
		if self.name.is_empty() {
			return Err(ConfigError::Invalid {
				field: "name",
				reason: "must not be empty",
			});
		}
		Ok(())
	}

	/// Budget for [`crate::ManualQueue::drain_with`].
	pub fn drain_budget(&self) -> DrainBudget {
		DrainBudget {
			duration: Duration::from_millis(self.drain_timeout_ms),
			max_completions: self.drain_max_completions,
		}
	}
}
