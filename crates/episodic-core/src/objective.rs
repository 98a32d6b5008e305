//! Policy optimization objective
//!
//! The objective is built once per task and cached. It estimates the
//! expected discounted cost of a parameter vector by rolling the policy
//! through a dynamics model with Monte-Carlo particles. Every evaluation
//! reseeds its generator, so two evaluations with different parameters see
//! the same initial states and noise draws.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use uuid::Uuid;

use crate::cost::CostFunction;
use crate::dynamics::DynamicsModel;
use crate::error::{MbrlError, Result};
use crate::plant::StateDistribution;
use crate::policy::{preprocess_angles, LearnedPolicy};

/// Fixed settings of a compiled objective
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveSettings {
    /// Rollout length in steps
    pub horizon: usize,
    /// Discount factor
    pub discount: f64,
    /// Number of particles
    pub n_samples: usize,
    /// Seed of the common random numbers
    pub seed: u64,
    /// Feed noisy states to the policy
    pub noisy_policy_input: bool,
    /// Evaluate the cost on noisy states
    pub noisy_cost_input: bool,
}

/// Values supplied to the objective at evaluation time
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveInputs {
    /// Cost free variables, in `CostFunction::free_variables` order
    pub free_values: Vec<f64>,
}

/// Compiled Monte-Carlo objective
#[derive(Debug, Clone)]
pub struct Objective {
    id: Uuid,
    settings: ObjectiveSettings,
    cost: CostFunction,
    free_variables: Vec<String>,
    state0: StateDistribution,
    param_count: usize,
}

impl Objective {
    /// Validate dimensions and build the objective
    pub fn compile(
        policy: &LearnedPolicy,
        cost: &CostFunction,
        state0: &StateDistribution,
        settings: ObjectiveSettings,
    ) -> Result<Self> {
        if state0.dim() != policy.state_dim() {
            return Err(MbrlError::DimensionMismatch {
                expected: policy.state_dim(),
                actual: state0.dim(),
            });
        }
        cost.validate(policy.state_dim())?;
        if settings.horizon == 0 || settings.n_samples == 0 {
            return Err(MbrlError::Optimization(
                "objective needs a positive horizon and sample count".into(),
            ));
        }
        if !(settings.discount > 0.0 && settings.discount <= 1.0) {
            return Err(MbrlError::Optimization(format!(
                "discount must be in (0, 1], got {}",
                settings.discount
            )));
        }

        let objective = Self {
            id: Uuid::new_v4(),
            free_variables: cost.free_variables(),
            cost: cost.clone(),
            state0: state0.clone(),
            param_count: policy.param_count(),
            settings,
        };
        tracing::debug!(
            objective = %objective.id,
            horizon = objective.settings.horizon,
            samples = objective.settings.n_samples,
            free_variables = ?objective.free_variables,
            "objective compiled"
        );
        Ok(objective)
    }

    /// Identity of this compilation
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fixed settings
    #[must_use]
    pub fn settings(&self) -> &ObjectiveSettings {
        &self.settings
    }

    /// Free variable names the objective expects values for
    #[must_use]
    pub fn free_variables(&self) -> &[String] {
        &self.free_variables
    }

    /// Collect runtime inputs from the task's current cost parameters
    pub fn inputs(&self, cost: &CostFunction) -> Result<ObjectiveInputs> {
        let free_values = self
            .free_variables
            .iter()
            .map(|name| {
                cost.params.get(name).copied().ok_or_else(|| {
                    MbrlError::Config(format!("cost free variable `{name}` has no value"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ObjectiveInputs { free_values })
    }

    /// Expected discounted cost over `steps` (capped at the horizon)
    pub fn evaluate(
        &self,
        model: &dyn DynamicsModel,
        policy: &LearnedPolicy,
        params: &[f64],
        inputs: &ObjectiveInputs,
        steps: usize,
    ) -> Result<f64> {
        if params.len() != self.param_count {
            return Err(MbrlError::DimensionMismatch {
                expected: self.param_count,
                actual: params.len(),
            });
        }
        let target = self.cost.bind(&inputs.free_values)?;
        let steps = steps.clamp(1, self.settings.horizon);
        let noise_std = model.noise_std().to_vec();
        let mut rng = StdRng::seed_from_u64(self.settings.seed);

        let mut total = 0.0;
        for _ in 0..self.settings.n_samples {
            let mut x = self.state0.sample(&mut rng);
            let mut weight = 1.0;
            for _ in 0..steps {
                let observed = self.perturb(&x, &noise_std, self.settings.noisy_policy_input, &mut rng);
                let input = preprocess_angles(&observed, policy.angle_dims());
                let u = policy.forward(params, &input);

                let mean = model.predict(&x, &u)?;
                x = self.perturb(&mean, &noise_std, true, &mut rng);

                let scored = self.perturb(&x, &noise_std, self.settings.noisy_cost_input, &mut rng);
                total += weight * self.cost.evaluate(&scored, &u, &target);
                weight *= self.settings.discount;
            }
        }

        let loss = total / self.settings.n_samples as f64;
        if loss.is_finite() {
            Ok(loss)
        } else {
            Err(MbrlError::Optimization("objective evaluated to a non-finite loss".into()))
        }
    }

    /// Add scaled Gaussian noise. Draws are consumed whether or not
    /// `enabled` is set so the random stream stays aligned across calls.
    fn perturb(&self, x: &[f64], std: &[f64], enabled: bool, rng: &mut StdRng) -> Vec<f64> {
        x.iter()
            .enumerate()
            .map(|(i, &v)| {
                let z: f64 = rng.sample(StandardNormal);
                if enabled {
                    v + z * std.get(i).copied().unwrap_or(0.0)
                } else {
                    v
                }
            })
            .collect()
    }
}
