//! Tasks: one independent learning problem each

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cost::CostFunction;
use crate::dynamics::{DynamicsModel, LinearDynamics};
use crate::error::{MbrlError, Result};
use crate::experience::ExperienceStore;
use crate::objective::{Objective, ObjectiveSettings};
use crate::plant::PlantParams;
use crate::policy::{ExplorationPolicy, LearnedPolicy, Policy};
use crate::state_machine::ActingPolicy;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Registered, nothing collected yet
    Init,
    /// Collecting the initial random trials
    CollectingRandom,
    /// Next cycle uses the learned policy
    Ready,
    /// Dynamics model update in progress
    Training,
    /// Building the optimization objective (first pass only)
    CompilingOptimizer,
    /// Policy optimization in progress
    Optimizing,
    /// Iteration budget exhausted
    Done,
}

impl TaskState {
    /// Returns `true` if no further transitions are allowed
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns `true` while an optimization job owns the task
    #[must_use]
    pub fn is_optimizing(&self) -> bool {
        matches!(self, Self::Training | Self::CompilingOptimizer | Self::Optimizing)
    }

    /// Returns `true` if moving to `next` is a legal transition.
    ///
    /// Self-transitions are rejected.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }
        match self {
            Self::Init => matches!(next, Self::CollectingRandom | Self::Ready | Self::Done),
            Self::CollectingRandom => matches!(next, Self::Ready | Self::Done),
            Self::Ready => matches!(next, Self::Training | Self::Done),
            Self::Training => matches!(next, Self::CompilingOptimizer | Self::Optimizing),
            Self::CompilingOptimizer => matches!(next, Self::Optimizing),
            Self::Optimizing => matches!(next, Self::Ready),
            Self::Done => false,
        }
    }

    /// Validate a transition of task `task` to `next`
    pub fn validate_transition(&self, task: &str, next: &Self) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(MbrlError::InvalidTransition {
                task: task.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::CollectingRandom => "collecting_random",
            Self::Ready => "ready",
            Self::Training => "training",
            Self::CompilingOptimizer => "compiling_optimizer",
            Self::Optimizing => "optimizing",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Where optimization runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// In-process model training and policy optimization
    Local,
    /// Delegated to the remote optimization service
    Remote,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Optimizer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Gradient descent step size
    pub learning_rate: f64,
    /// Maximum gradient norm
    pub gradient_clip: f64,
    /// Steps after which gradients are truncated, `<= 0` for the full horizon
    pub truncate_gradient: i64,
    /// Gradient steps per optimization pass
    pub max_iterations: usize,
    /// Central finite difference step
    pub finite_difference_step: f64,
    /// Feed noisy states to the policy during rollouts
    pub noisy_policy_input: bool,
    /// Evaluate the cost on noisy states during rollouts
    pub noisy_cost_input: bool,
    /// Keep the best parameters seen instead of the last ones
    pub return_best: bool,
    /// Ridge penalty of the dynamics fit
    pub ridge: f64,
    /// Seed of the common random numbers
    pub seed: u64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            gradient_clip: 1.0,
            truncate_gradient: -1,
            max_iterations: 100,
            finite_difference_step: 1e-4,
            noisy_policy_input: false,
            noisy_cost_input: false,
            return_best: true,
            ridge: 1e-6,
            seed: 0,
        }
    }
}

impl OptimizerSettings {
    /// Rollout length used for gradient estimates
    #[must_use]
    pub fn gradient_steps(&self, horizon: usize) -> usize {
        match usize::try_from(self.truncate_gradient) {
            Ok(n) if n > 0 => n.min(horizon),
            _ => horizon,
        }
    }
}

/// Learned policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Symmetric action bounds, one per action dimension
    pub max_u: Vec<f64>,
    /// State dimensions fed to the policy as `sin`/`cos`
    #[serde(default)]
    pub angle_dims: Vec<usize>,
    /// Seed of the initial parameters
    #[serde(default)]
    pub seed: u64,
}

fn default_discount() -> f64 {
    1.0
}

fn default_n_samples() -> usize {
    100
}

/// Immutable description of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique task name
    pub name: String,
    /// Plant configuration for this task
    pub plant: PlantParams,
    /// Learned policy configuration
    pub policy: PolicySpec,
    /// Immediate cost
    pub cost: CostFunction,
    /// Episode duration in seconds
    pub horizon_secs: f64,
    /// Discount factor
    #[serde(default = "default_discount")]
    pub discount: f64,
    /// Monte-Carlo particles for the objective
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,
    /// Target number of optimization iterations
    pub n_opt: usize,
    /// Exploration episodes collected before learning
    pub initial_random_trials: usize,
    /// Strategy override
    #[serde(default)]
    pub optimizer: Option<Strategy>,
    /// Exploration as a random walk
    #[serde(default)]
    pub random_walk: bool,
    /// Feed angle dimensions to the dynamics model as `sin`/`cos`
    #[serde(default)]
    pub wrap_angles: bool,
    /// Optimizer hyperparameters
    #[serde(default)]
    pub optimizer_params: OptimizerSettings,
}

impl TaskSpec {
    /// State dimension of the plant
    #[must_use]
    pub fn state_dim(&self) -> usize {
        self.plant.state0.dim()
    }

    /// Episode length in control steps
    #[must_use]
    pub fn horizon_steps(&self) -> usize {
        let steps = (self.horizon_secs / self.plant.dt).ceil();
        if steps.is_finite() && steps >= 1.0 {
            steps as usize
        } else {
            1
        }
    }

    /// Strategy for this task given a process-wide default
    #[must_use]
    pub fn strategy(&self, default: Strategy) -> Strategy {
        self.optimizer.unwrap_or(default)
    }

    /// Settings of the optimization objective
    #[must_use]
    pub fn objective_settings(&self) -> ObjectiveSettings {
        ObjectiveSettings {
            horizon: self.horizon_steps(),
            discount: self.discount,
            n_samples: self.n_samples,
            seed: self.optimizer_params.seed,
            noisy_policy_input: self.optimizer_params.noisy_policy_input,
            noisy_cost_input: self.optimizer_params.noisy_cost_input,
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        self.plant.validate()?;
        let dim = self.state_dim();
        if !(self.horizon_secs > 0.0) {
            return Err(MbrlError::Config(format!(
                "task `{}`: horizon_secs must be positive",
                self.name
            )));
        }
        if !(self.discount > 0.0 && self.discount <= 1.0) {
            return Err(MbrlError::Config(format!(
                "task `{}`: discount must be in (0, 1]",
                self.name
            )));
        }
        if self.n_samples == 0 {
            return Err(MbrlError::Config(format!(
                "task `{}`: n_samples must be positive",
                self.name
            )));
        }
        if let Some(&d) = self.policy.angle_dims.iter().find(|&&d| d >= dim) {
            return Err(MbrlError::Config(format!(
                "task `{}`: policy angle dimension {d} out of range for state of size {dim}",
                self.name
            )));
        }
        self.cost.validate(dim).map_err(|e| match e {
            MbrlError::DimensionMismatch { expected, actual } => MbrlError::Config(format!(
                "task `{}`: cost expects {actual} state dimensions, plant has {expected}",
                self.name
            )),
            other => other,
        })
    }
}

/// A task and everything it owns.
///
/// Holding a `Task` by value is what grants write access to it: the
/// scheduler hands it to at most one optimization job, which hands it back
/// when done.
#[derive(Debug)]
pub struct Task {
    /// Immutable description
    pub spec: TaskSpec,
    /// Episodes and policy history
    pub experience: ExperienceStore,
    /// Learned policy
    pub policy: LearnedPolicy,
    /// Current dynamics model
    pub dynamics: Box<dyn DynamicsModel>,
    /// Cached optimization objective, built at most once
    pub objective: Option<Objective>,
    state: TaskState,
    remaining_random_trials: usize,
    exploration: ExplorationPolicy,
    episodes_this_run: usize,
}

impl Task {
    /// Create a task with empty experience
    pub fn new(spec: TaskSpec) -> Result<Self> {
        spec.validate()?;
        let policy = LearnedPolicy::new(
            spec.state_dim(),
            spec.policy.max_u.clone(),
            spec.policy.angle_dims.clone(),
            spec.policy.seed,
        )?;
        let exploration = ExplorationPolicy::new(spec.policy.max_u.clone(), spec.random_walk);

        Ok(Self {
            experience: ExperienceStore::new(spec.name.clone()),
            dynamics: Box::new(LinearDynamics::new(spec.optimizer_params.ridge)),
            objective: None,
            state: TaskState::Init,
            remaining_random_trials: spec.initial_random_trials,
            exploration,
            episodes_this_run: 0,
            policy,
            spec,
        })
    }

    /// Adopt previously saved experience.
    ///
    /// The policy takes the most recent snapshot and the random-trial budget
    /// is reduced by the exploration episodes already collected.
    pub fn with_experience(mut self, experience: ExperienceStore) -> Result<Self> {
        if experience.task_name() != self.spec.name {
            return Err(MbrlError::Persistence(format!(
                "experience of task `{}` cannot be used for `{}`",
                experience.task_name(),
                self.spec.name
            )));
        }
        if let Some(params) = experience.latest_policy_params() {
            self.policy.set_params(params)?;
        }
        let explored = experience
            .episodes()
            .iter()
            .filter(|ep| ep.policy_params.is_none())
            .count();
        self.remaining_random_trials = self.spec.initial_random_trials.saturating_sub(explored);
        self.experience = experience;
        Ok(self)
    }

    /// Fix the exploration seed
    #[must_use]
    pub fn with_exploration_seed(mut self, seed: u64) -> Self {
        self.exploration = ExplorationPolicy::with_seed(self.spec.policy.max_u.clone(), self.spec.random_walk, seed);
        self
    }

    /// Task name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Exploration episodes still to collect
    #[must_use]
    pub fn remaining_random_trials(&self) -> usize {
        self.remaining_random_trials
    }

    /// Episodes collected since the process started
    #[must_use]
    pub fn episodes_this_run(&self) -> usize {
        self.episodes_this_run
    }

    /// Whether the iteration budget has been reached
    #[must_use]
    pub fn budget_reached(&self) -> bool {
        self.experience.completed_iterations() >= self.spec.n_opt
    }

    /// Move to `to` if the transition is legal
    pub fn transition(&mut self, to: TaskState) -> Result<()> {
        self.state.validate_transition(&self.spec.name, &to)?;
        tracing::debug!(task = %self.spec.name, from = %self.state, to = %to, "state transition");
        self.state = to;
        Ok(())
    }

    /// Policy used to act in the next episode
    pub fn acting_policy(&mut self, acting: ActingPolicy) -> Policy {
        match acting {
            ActingPolicy::Exploration => Policy::Exploration(self.exploration.fork()),
            ActingPolicy::Learned => Policy::Learned(self.policy.clone()),
        }
    }

    pub(crate) fn restore_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub(crate) fn consume_random_trial(&mut self) -> usize {
        self.remaining_random_trials = self.remaining_random_trials.saturating_sub(1);
        self.remaining_random_trials
    }

    pub(crate) fn count_episode(&mut self) {
        self.episodes_this_run += 1;
    }

    pub(crate) fn set_remaining_random_trials(&mut self, n: usize) {
        self.remaining_random_trials = n;
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::cost::{CostKind, TargetEntry};
    use crate::plant::StateDistribution;
    use std::collections::BTreeMap;

    /// One-dimensional reach task used across the crate's tests
    pub fn reach_spec(name: &str, trials: usize, n_opt: usize) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            plant: PlantParams {
                kind: "integrator".into(),
                dt: 0.1,
                state0: StateDistribution {
                    mean: vec![0.0],
                    std: vec![0.05],
                },
                max_steps: None,
                settings: BTreeMap::new(),
            },
            policy: PolicySpec {
                max_u: vec![1.0],
                angle_dims: vec![],
                seed: 1,
            },
            cost: CostFunction {
                kind: CostKind::Quadratic,
                target: vec![TargetEntry::Value(1.0)],
                weights: vec![1.0],
                width: 1.0,
                action_weight: 0.0,
                angle_dims: vec![],
                params: BTreeMap::new(),
            },
            horizon_secs: 1.0,
            discount: 1.0,
            n_samples: 4,
            n_opt,
            initial_random_trials: trials,
            optimizer: Some(Strategy::Local),
            random_walk: false,
            wrap_angles: false,
            optimizer_params: OptimizerSettings {
                max_iterations: 5,
                ..OptimizerSettings::default()
            },
        }
    }
}
