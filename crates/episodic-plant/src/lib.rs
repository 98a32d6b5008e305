//! Simulated plants for episodic model-based RL experiments
//!
//! [`SimulatedPlant`] implements the plant contract on top of the classic
//! control systems in [`classic`], selected per task through a
//! [`PlantRegistry`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod classic;
pub mod registry;
pub mod simulated;

pub use classic::{CartPole, DoubleIntegrator, Pendulum, System};
pub use registry::PlantRegistry;
pub use simulated::SimulatedPlant;
