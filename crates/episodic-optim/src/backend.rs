//! Optimization backend contract and strategy selection

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use episodic_core::{DynamicsModel, MbrlError, Result, Strategy, Task, TaskSpec};

/// Summary of one optimization pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    /// Strategy that ran
    pub strategy: Strategy,
    /// Loss of the parameters before the pass, if known
    pub initial_loss: Option<f64>,
    /// Loss of the returned parameters, if known
    pub final_loss: Option<f64>,
    /// Optimizer steps taken
    pub iterations: usize,
    /// Completed optimization iterations once this pass is applied
    pub completed_iterations: usize,
    /// Whether applying this pass exhausts the task's budget
    pub budget_reached: bool,
}

impl OptimizationReport {
    /// Report for a pass on `task`, before losses are known
    #[must_use]
    pub fn for_task(task: &Task, strategy: Strategy) -> Self {
        let completed_iterations = task.experience.completed_iterations() + 1;
        Self {
            strategy,
            initial_loss: None,
            final_loss: None,
            iterations: 0,
            completed_iterations,
            budget_reached: completed_iterations >= task.spec.n_opt,
        }
    }
}

/// Result of a successful pass, applied to the task by the scheduler
#[derive(Debug)]
pub struct OptimizationOutcome {
    /// New policy parameters
    pub params: Vec<f64>,
    /// Retrained dynamics model, if the strategy trains one in-process
    pub model: Option<Box<dyn DynamicsModel>>,
    /// Summary
    pub report: OptimizationReport,
}

/// Model training plus policy optimization for one task.
///
/// Implementations receive the task in `training` and leave it in
/// `optimizing` on success. They must not touch the policy parameters,
/// the dynamics model, or the experience: results travel back in the
/// returned [`OptimizationOutcome`]. The only task field they may fill is
/// the cached objective.
#[async_trait]
pub trait OptimizationBackend: Send + Sync {
    /// Strategy implemented by this backend
    fn strategy(&self) -> Strategy;

    /// Run one pass
    async fn optimize(&self, task: &mut Task) -> Result<OptimizationOutcome>;
}

/// Available backends and the process-wide default strategy
#[derive(Clone)]
pub struct Backends {
    default: Strategy,
    local: Option<Arc<dyn OptimizationBackend>>,
    remote: Option<Arc<dyn OptimizationBackend>>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("default", &self.default)
            .field("local", &self.local.is_some())
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

impl Backends {
    /// No backends yet, `default` used when a task has no override
    #[must_use]
    pub fn new(default: Strategy) -> Self {
        Self {
            default,
            local: None,
            remote: None,
        }
    }

    /// Register a backend under its own strategy
    #[must_use]
    pub fn with(mut self, backend: Arc<dyn OptimizationBackend>) -> Self {
        match backend.strategy() {
            Strategy::Local => self.local = Some(backend),
            Strategy::Remote => self.remote = Some(backend),
        }
        self
    }

    /// Process-wide default strategy
    #[must_use]
    pub fn default_strategy(&self) -> Strategy {
        self.default
    }

    /// Whether a backend is available for `strategy`
    #[must_use]
    pub fn has(&self, strategy: Strategy) -> bool {
        match strategy {
            Strategy::Local => self.local.is_some(),
            Strategy::Remote => self.remote.is_some(),
        }
    }

    /// Backend for `strategy`
    pub fn select(&self, strategy: Strategy) -> Result<Arc<dyn OptimizationBackend>> {
        let backend = match strategy {
            Strategy::Local => self.local.clone(),
            Strategy::Remote => self.remote.clone(),
        };
        backend.ok_or_else(|| MbrlError::Config(format!("no {strategy} optimization backend configured")))
    }

    /// Backend a task uses for its regular cycles
    pub fn for_task(&self, spec: &TaskSpec) -> Result<Arc<dyn OptimizationBackend>> {
        self.select(spec.strategy(self.default))
    }

    /// Backend used to resume a task with saved policy history: the remote
    /// service when available, otherwise the task's own strategy
    pub fn for_resume(&self, spec: &TaskSpec) -> Result<Arc<dyn OptimizationBackend>> {
        if self.has(Strategy::Remote) {
            self.select(Strategy::Remote)
        } else {
            self.for_task(spec)
        }
    }
}
