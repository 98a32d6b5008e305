//! In-process model training and policy optimization

use std::time::Instant;

use async_trait::async_trait;

use episodic_core::{
    DynamicsModel, LearnedPolicy, MbrlError, Objective, ObjectiveInputs, OptimizerSettings, Result,
    Strategy, Task, TaskState,
};

use crate::backend::{OptimizationBackend, OptimizationOutcome, OptimizationReport};

/// Trains the task's dynamics model on its full history, then runs
/// finite-difference gradient descent on the cached objective
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// Create a new local backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OptimizationBackend for LocalBackend {
    fn strategy(&self) -> Strategy {
        Strategy::Local
    }

    async fn optimize(&self, task: &mut Task) -> Result<OptimizationOutcome> {
        let started = Instant::now();
        let mut report = OptimizationReport::for_task(task, Strategy::Local);

        let mut model = task.dynamics.train(
            &task.experience,
            &task.spec.policy.angle_dims,
            task.spec.wrap_angles,
        )?;
        tracing::info!(
            episodes = task.experience.n_episodes(),
            steps = task.experience.total_steps(),
            "dynamics model trained"
        );

        if task.objective.is_none() {
            task.transition(TaskState::CompilingOptimizer)?;
            task.objective = Some(Objective::compile(
                &task.policy,
                &task.spec.cost,
                &task.spec.plant.state0,
                task.spec.objective_settings(),
            )?);
        }
        task.transition(TaskState::Optimizing)?;

        if model.capabilities().incremental_update {
            model.resample(task.spec.n_samples);
        }

        let objective = task
            .objective
            .clone()
            .ok_or_else(|| MbrlError::Optimization("objective missing after compilation".into()))?;
        let inputs = objective.inputs(&task.spec.cost)?;
        let descent = GradientDescent {
            objective,
            model,
            policy: task.policy.clone(),
            inputs,
            settings: task.spec.optimizer_params.clone(),
            horizon: task.spec.horizon_steps(),
        };
        let start = task.policy.params().to_vec();
        let span = tracing::Span::current();
        let (model, result) = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let result = descent.minimize(start);
            (descent.model, result)
        })
        .await
        .map_err(|e| MbrlError::Optimization(format!("optimizer worker failed: {e}")))?;
        let result = result?;

        report.initial_loss = Some(result.initial_loss);
        report.final_loss = Some(result.final_loss);
        report.iterations = result.iterations;
        tracing::info!(
            initial_loss = result.initial_loss,
            final_loss = result.final_loss,
            iterations = result.iterations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "policy optimized"
        );

        Ok(OptimizationOutcome {
            params: result.params,
            model: Some(model),
            report,
        })
    }
}

struct Minimum {
    params: Vec<f64>,
    initial_loss: f64,
    final_loss: f64,
    iterations: usize,
}

/// Owned copy of everything the descent reads, so it can run on the
/// blocking pool
struct GradientDescent {
    objective: Objective,
    model: Box<dyn DynamicsModel>,
    policy: LearnedPolicy,
    inputs: ObjectiveInputs,
    settings: OptimizerSettings,
    horizon: usize,
}

impl GradientDescent {
    fn loss(&self, params: &[f64], steps: usize) -> Result<f64> {
        self.objective
            .evaluate(self.model.as_ref(), &self.policy, params, &self.inputs, steps)
    }

    /// Central differences on rollouts of `steps` steps, clipped in norm
    fn gradient(&self, params: &[f64], steps: usize) -> Result<Vec<f64>> {
        let h = self.settings.finite_difference_step;
        let mut probe = params.to_vec();
        let mut grad = Vec::with_capacity(params.len());
        for i in 0..params.len() {
            probe[i] = params[i] + h;
            let up = self.loss(&probe, steps)?;
            probe[i] = params[i] - h;
            let down = self.loss(&probe, steps)?;
            probe[i] = params[i];
            grad.push((up - down) / (2.0 * h));
        }

        let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        let clip = self.settings.gradient_clip;
        if clip > 0.0 && norm > clip {
            grad.iter_mut().for_each(|g| *g *= clip / norm);
        }
        Ok(grad)
    }

    fn minimize(&self, mut params: Vec<f64>) -> Result<Minimum> {
        if !(self.settings.finite_difference_step > 0.0) {
            return Err(MbrlError::Optimization("finite_difference_step must be positive".into()));
        }
        let gradient_steps = self.settings.gradient_steps(self.horizon);
        let initial_loss = self.loss(&params, self.horizon)?;
        let mut best = (initial_loss, params.clone());
        let mut loss = initial_loss;
        let mut iterations = 0;

        for it in 0..self.settings.max_iterations {
            let grad = self.gradient(&params, gradient_steps)?;
            for (p, g) in params.iter_mut().zip(&grad) {
                *p -= self.settings.learning_rate * g;
            }
            loss = self.loss(&params, self.horizon)?;
            iterations = it + 1;
            if loss < best.0 {
                best = (loss, params.clone());
            }
            tracing::trace!(iteration = iterations, loss, "gradient step");
        }

        let (final_loss, params) = if self.settings.return_best {
            best
        } else {
            (loss, params)
        };
        Ok(Minimum {
            params,
            initial_loss,
            final_loss,
            iterations,
        })
    }
}
