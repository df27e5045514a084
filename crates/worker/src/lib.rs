//! Host task queues that run deferred-cell callbacks on later turns.
//!
//! The deferred core never invokes an observer inline. It hands every unit of
//! work to a [`TaskQueue`] reached through a [`QueueHandle`], and this crate
//! provides the two hosts used in practice: [`ManualQueue`] for deterministic
//! drains and [`TokioQueue`] for a runtime-driven FIFO driver.

mod budget;
mod config;
mod driver;
mod error;
mod manual;
mod panic;
mod queue;

pub use budget::{DrainBudget, DrainReport};
pub use config::QueueConfig;
pub use driver::TokioQueue;
pub use error::{ConfigError, QueueError};
pub use manual::ManualQueue;
pub use panic::panic_message;
pub use queue::{QueueHandle, Task, TaskQueue};
