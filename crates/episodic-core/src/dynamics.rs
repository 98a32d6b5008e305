//! Learned dynamics models
//!
//! A model predicts the next plant state from the current state and action.
//! Training never mutates the model in place: it returns a fresh model, so a
//! task keeps its previous model until an optimization cycle fully succeeds.

use std::fmt::Debug;

use nalgebra::{DMatrix, DVector};

use crate::cost::wrap_angle;
use crate::error::{MbrlError, Result};
use crate::experience::ExperienceStore;
use crate::policy::{preprocess_angles, preprocessed_dim, Capabilities};

/// Model of the plant's transition function
pub trait DynamicsModel: Debug + Send + Sync {
    /// Fit a new model on the full experience history
    fn train(
        &self,
        experience: &ExperienceStore,
        angle_dims: &[usize],
        wrap_angles: bool,
    ) -> Result<Box<dyn DynamicsModel>>;

    /// Mean prediction of the next state
    fn predict(&self, state: &[f64], action: &[f64]) -> Result<Vec<f64>>;

    /// Per-dimension process noise standard deviation
    fn noise_std(&self) -> &[f64];

    /// Whether the model has been fitted at least once
    fn is_trained(&self) -> bool;

    /// Declared capabilities
    fn capabilities(&self) -> Capabilities;

    /// Redraw internal samples (models with incremental updates only)
    fn resample(&mut self, _n_samples: usize) {}
}

/// Ridge regression of state deltas on `[phi(x), u, 1]`
#[derive(Debug, Clone)]
pub struct LinearDynamics {
    ridge: f64,
    state_dim: usize,
    action_dim: usize,
    angle_dims: Vec<usize>,
    wrap_angles: bool,
    /// `n_features x state_dim`, `None` until trained
    coefficients: Option<DMatrix<f64>>,
    noise_std: Vec<f64>,
}

impl LinearDynamics {
    /// Untrained model with the given ridge penalty
    #[must_use]
    pub fn new(ridge: f64) -> Self {
        Self {
            ridge: ridge.max(0.0),
            state_dim: 0,
            action_dim: 0,
            angle_dims: Vec::new(),
            wrap_angles: false,
            coefficients: None,
            noise_std: Vec::new(),
        }
    }

    fn features(&self, state: &[f64], action: &[f64]) -> Vec<f64> {
        let mut phi = if self.wrap_angles {
            preprocess_angles(state, &self.angle_dims)
        } else {
            state.to_vec()
        };
        phi.extend_from_slice(action);
        phi.push(1.0);
        phi
    }

    fn delta(&self, state: &[f64], next: &[f64]) -> Vec<f64> {
        state
            .iter()
            .zip(next)
            .enumerate()
            .map(|(i, (x, y))| {
                let d = y - x;
                if self.wrap_angles && self.angle_dims.contains(&i) {
                    wrap_angle(d)
                } else {
                    d
                }
            })
            .collect()
    }
}

impl DynamicsModel for LinearDynamics {
    fn train(
        &self,
        experience: &ExperienceStore,
        angle_dims: &[usize],
        wrap_angles: bool,
    ) -> Result<Box<dyn DynamicsModel>> {
        let first = experience
            .episodes()
            .iter()
            .find_map(|ep| ep.transitions.first())
            .ok_or_else(|| MbrlError::Optimization("no transitions to train the dynamics model on".into()))?;

        let mut model = Self {
            ridge: self.ridge,
            state_dim: first.state.len(),
            action_dim: first.action.len(),
            angle_dims: angle_dims.to_vec(),
            wrap_angles,
            coefficients: None,
            noise_std: Vec::new(),
        };
        if let Some(&d) = angle_dims.iter().find(|&&d| d >= model.state_dim) {
            return Err(MbrlError::Optimization(format!(
                "angle dimension {d} out of range for state of size {}",
                model.state_dim
            )));
        }

        let state_features = if wrap_angles {
            preprocessed_dim(model.state_dim, angle_dims)
        } else {
            model.state_dim
        };
        let n_features = state_features + model.action_dim + 1;

        let mut rows_x: Vec<f64> = Vec::new();
        let mut rows_y: Vec<f64> = Vec::new();
        let mut n = 0;
        for episode in experience.episodes() {
            for (state, action, next) in episode.state_transitions() {
                if state.len() != model.state_dim || next.len() != model.state_dim {
                    return Err(MbrlError::DimensionMismatch {
                        expected: model.state_dim,
                        actual: state.len().max(next.len()),
                    });
                }
                if action.len() != model.action_dim {
                    return Err(MbrlError::DimensionMismatch {
                        expected: model.action_dim,
                        actual: action.len(),
                    });
                }
                rows_x.extend(model.features(state, action));
                rows_y.extend(model.delta(state, next));
                n += 1;
            }
        }

        let x = DMatrix::from_row_slice(n, n_features, &rows_x);
        let y = DMatrix::from_row_slice(n, model.state_dim, &rows_y);

        let mut gram = x.transpose() * &x;
        for i in 0..n_features {
            gram[(i, i)] += self.ridge.max(1e-12);
        }
        let rhs = x.transpose() * &y;
        let coefficients = gram
            .cholesky()
            .ok_or_else(|| MbrlError::Optimization("dynamics normal equations are not positive definite".into()))?
            .solve(&rhs);

        let residuals = &y - &x * &coefficients;
        model.noise_std = (0..model.state_dim)
            .map(|j| {
                let col = residuals.column(j);
                (col.dot(&col) / n.max(1) as f64).sqrt()
            })
            .collect();
        model.coefficients = Some(coefficients);

        tracing::debug!(samples = n, features = n_features, "dynamics model trained");
        Ok(Box::new(model))
    }

    fn predict(&self, state: &[f64], action: &[f64]) -> Result<Vec<f64>> {
        let coefficients = self
            .coefficients
            .as_ref()
            .ok_or_else(|| MbrlError::Optimization("dynamics model is not trained".into()))?;
        if state.len() != self.state_dim {
            return Err(MbrlError::DimensionMismatch {
                expected: self.state_dim,
                actual: state.len(),
            });
        }
        if action.len() != self.action_dim {
            return Err(MbrlError::DimensionMismatch {
                expected: self.action_dim,
                actual: action.len(),
            });
        }

        let phi = DVector::from_vec(self.features(state, action));
        let delta = coefficients.transpose() * phi;
        Ok(state.iter().zip(delta.iter()).map(|(x, d)| x + d).collect())
    }

    fn noise_std(&self) -> &[f64] {
        &self.noise_std
    }

    fn is_trained(&self) -> bool {
        self.coefficients.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            learned_parameters: true,
            incremental_update: false,
            angle_preprocessing: self.wrap_angles && !self.angle_dims.is_empty(),
        }
    }
}
