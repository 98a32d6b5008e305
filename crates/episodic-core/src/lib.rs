//! Core types for episodic model-based reinforcement learning experiments
//!
//! This crate holds the data model shared by the optimization backends and
//! the scheduler: tasks and their lifecycle, experience storage, policies,
//! cost functions, the plant contract, and the in-process dynamics model and
//! optimization objective.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod cost;
pub mod dynamics;
pub mod error;
pub mod experience;
pub mod objective;
pub mod plant;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod state_machine;
pub mod task;

// Re-export core traits and types
pub use cost::{wrap_angle, CostFunction, CostKind, TargetEntry};
pub use dynamics::{DynamicsModel, LinearDynamics};
pub use error::{MbrlError, Result};
pub use experience::{Episode, ExperienceStore, PolicySnapshot, Transition};
pub use objective::{Objective, ObjectiveInputs, ObjectiveSettings};
pub use plant::{Plant, PlantParams, PlantStep, StateDistribution, StepInfo};
pub use policy::{preprocess_angles, Capabilities, ExplorationPolicy, LearnedPolicy, Policy};
pub use registry::{TaskRegistry, TaskStatus};
pub use runner::EpisodeRunner;
pub use state_machine::{ActingPolicy, AfterEpisode, CyclePlan, Mode, TaskStateMachine};
pub use task::{OptimizerSettings, PolicySpec, Strategy, Task, TaskSpec, TaskState};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ActingPolicy, AfterEpisode, EpisodeRunner, ExperienceStore, MbrlError, Plant, PlantParams,
        Policy, Result, Strategy, Task, TaskRegistry, TaskSpec, TaskState, TaskStateMachine,
    };
}
