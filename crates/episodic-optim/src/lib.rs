//! Optimization backends for episodic model-based RL
//!
//! Two interchangeable strategies implement [`OptimizationBackend`]:
//! [`LocalBackend`] trains the dynamics model and optimizes the policy
//! in-process, [`RemoteBackend`] delegates both to an HTTP service.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod local;
pub mod remote;
pub mod retry;

pub use backend::{Backends, OptimizationBackend, OptimizationOutcome, OptimizationReport};
pub use local::LocalBackend;
pub use remote::{RemoteBackend, RemoteConfig};
pub use retry::{AttemptError, RetryPolicy};
