//! Scheduler and command line front end for episodic model-based RL
//!
//! Several learning tasks share one plant. [`Scheduler`] interleaves their
//! episodes in FIFO order and runs each task's optimization jobs in the
//! background, at most one per task. [`Config`] turns a TOML experiment
//! description into task specs and backends.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod job;
pub mod output;
pub mod scheduler;

pub use config::{Config, RejectedTask};
pub use job::Dispatch;
pub use output::prepare_output_dir;
pub use scheduler::{RunSummary, Scheduler, SchedulerConfig};
