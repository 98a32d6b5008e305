//! Policy abstractions for action selection
//!
//! Two variants exist: an exploration policy without learned parameters,
//! used for the initial random trials, and a learned policy whose parameter
//! vector is updated by optimization. Each variant declares its
//! capabilities explicitly instead of being probed at runtime.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{MbrlError, Result};

/// What a policy variant supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Has a parameter vector that optimization updates
    pub learned_parameters: bool,
    /// Supports incremental (resampling) updates between optimizer steps
    pub incremental_update: bool,
    /// Expects angle-preprocessed inputs
    pub angle_preprocessing: bool,
}

/// Replace angle dimensions by their sine and cosine.
///
/// Non-angle dimensions are kept in order, followed by `sin` then `cos`
/// of each angle dimension.
#[must_use]
pub fn preprocess_angles(state: &[f64], angle_dims: &[usize]) -> Vec<f64> {
    if angle_dims.is_empty() {
        return state.to_vec();
    }
    let mut out: Vec<f64> = state
        .iter()
        .enumerate()
        .filter(|(i, _)| !angle_dims.contains(i))
        .map(|(_, &x)| x)
        .collect();
    for &d in angle_dims {
        out.push(state[d].sin());
    }
    for &d in angle_dims {
        out.push(state[d].cos());
    }
    out
}

/// Width of a state after angle preprocessing
#[must_use]
pub fn preprocessed_dim(state_dim: usize, angle_dims: &[usize]) -> usize {
    state_dim + angle_dims.len()
}

/// Random exploration policy
#[derive(Debug, Clone)]
pub struct ExplorationPolicy {
    /// Action bounds (symmetric)
    pub max_u: Vec<f64>,
    /// Produce a random walk instead of independent samples
    pub random_walk: bool,
    last: Option<Vec<f64>>,
    rng: StdRng,
}

impl ExplorationPolicy {
    /// Create a new exploration policy
    #[must_use]
    pub fn new(max_u: Vec<f64>, random_walk: bool) -> Self {
        Self {
            max_u,
            random_walk,
            last: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a new exploration policy with a fixed seed
    #[must_use]
    pub fn with_seed(max_u: Vec<f64>, random_walk: bool, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(max_u, random_walk)
        }
    }

    /// Independent copy for one episode, seeded from this policy's generator
    pub fn fork(&mut self) -> Self {
        let seed = self.rng.gen();
        Self::with_seed(self.max_u.clone(), self.random_walk, seed)
    }

    fn uniform(&mut self) -> Vec<f64> {
        let rng = &mut self.rng;
        self.max_u
            .iter()
            .map(|&m| if m > 0.0 { rng.gen_range(-m..=m) } else { 0.0 })
            .collect()
    }

    /// Sample the next action
    pub fn act(&mut self) -> Vec<f64> {
        let action = match self.last.take() {
            Some(prev) if self.random_walk => {
                let rng = &mut self.rng;
                prev.iter()
                    .zip(&self.max_u)
                    .map(|(&u, &m)| {
                        let step = Normal::new(0.0, 0.1 * m.max(f64::EPSILON))
                            .map_or(0.0, |n| n.sample(rng));
                        (u + step).clamp(-m, m)
                    })
                    .collect()
            }
            _ => self.uniform(),
        };
        self.last = Some(action.clone());
        action
    }

    /// Forget the random walk position
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Saturated linear controller `u = max_u * tanh(W x + b)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPolicy {
    state_dim: usize,
    max_u: Vec<f64>,
    angle_dims: Vec<usize>,
    params: Vec<f64>,
}

impl LearnedPolicy {
    /// Create a policy with small random initial parameters
    pub fn new(state_dim: usize, max_u: Vec<f64>, angle_dims: Vec<usize>, seed: u64) -> Result<Self> {
        if max_u.is_empty() {
            return Err(MbrlError::Config("policy needs at least one action dimension".into()));
        }
        if let Some(&d) = angle_dims.iter().find(|&&d| d >= state_dim) {
            return Err(MbrlError::Config(format!(
                "policy angle dimension {d} out of range for state of size {state_dim}"
            )));
        }

        let mut policy = Self {
            state_dim,
            max_u,
            angle_dims,
            params: Vec::new(),
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (policy.input_dim() as f64).sqrt();
        policy.params = (0..policy.param_count())
            .map(|_| rng.gen_range(-scale..=scale) * 0.1)
            .collect();
        Ok(policy)
    }

    /// Declared capabilities
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            learned_parameters: true,
            incremental_update: false,
            angle_preprocessing: !self.angle_dims.is_empty(),
        }
    }

    /// Raw state dimension
    #[must_use]
    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    /// Input dimension after preprocessing
    #[must_use]
    pub fn input_dim(&self) -> usize {
        preprocessed_dim(self.state_dim, &self.angle_dims)
    }

    /// Action dimension
    #[must_use]
    pub fn action_dim(&self) -> usize {
        self.max_u.len()
    }

    /// Action bounds
    #[must_use]
    pub fn max_u(&self) -> &[f64] {
        &self.max_u
    }

    /// Angle dimensions of the raw state
    #[must_use]
    pub fn angle_dims(&self) -> &[usize] {
        &self.angle_dims
    }

    /// Number of parameters (`W` then `b`)
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.action_dim() * (self.input_dim() + 1)
    }

    /// Current parameters
    #[must_use]
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Replace the parameters
    pub fn set_params(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.param_count() {
            return Err(MbrlError::DimensionMismatch {
                expected: self.param_count(),
                actual: params.len(),
            });
        }
        self.params = params.to_vec();
        Ok(())
    }

    /// Evaluate the controller with explicit parameters on a preprocessed input
    #[must_use]
    pub fn forward(&self, params: &[f64], input: &[f64]) -> Vec<f64> {
        let n_in = self.input_dim();
        let bias = &params[self.action_dim() * n_in..];
        self.max_u
            .iter()
            .enumerate()
            .map(|(a, &m)| {
                let row = &params[a * n_in..(a + 1) * n_in];
                let z: f64 = row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + bias[a];
                m * z.tanh()
            })
            .collect()
    }

    /// Action for a preprocessed input with the current parameters
    #[must_use]
    pub fn act(&self, input: &[f64]) -> Vec<f64> {
        self.forward(&self.params, input)
    }
}

/// Acting policy for one episode
#[derive(Debug, Clone)]
pub enum Policy {
    /// Random exploration
    Exploration(ExplorationPolicy),
    /// Learned controller
    Learned(LearnedPolicy),
}

impl Policy {
    /// Declared capabilities of the variant
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Exploration(_) => Capabilities {
                learned_parameters: false,
                incremental_update: false,
                angle_preprocessing: false,
            },
            Self::Learned(p) => p.capabilities(),
        }
    }

    /// Angle dimensions used for preprocessing
    #[must_use]
    pub fn angle_dims(&self) -> &[usize] {
        match self {
            Self::Exploration(_) => &[],
            Self::Learned(p) => p.angle_dims(),
        }
    }

    /// Parameters in effect, if the variant has any
    #[must_use]
    pub fn params(&self) -> Option<Vec<f64>> {
        match self {
            Self::Exploration(_) => None,
            Self::Learned(p) => Some(p.params().to_vec()),
        }
    }

    /// Prepare for a new episode
    pub fn begin_episode(&mut self) {
        if let Self::Exploration(p) = self {
            p.reset();
        }
    }

    /// Select an action for a (preprocessed) input
    pub fn act(&mut self, input: &[f64]) -> Vec<f64> {
        match self {
            Self::Exploration(p) => p.act(),
            Self::Learned(p) => p.act(input),
        }
    }
}
