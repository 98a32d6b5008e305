//! Immediate cost functions
//!
//! A cost compares the plant state against a target. Target entries are
//! either literal numbers or free variables whose values are bound at
//! evaluation time, so a compiled objective can be reused while the
//! goal changes between optimization passes.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{MbrlError, Result};

/// Shape of the immediate cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostKind {
    /// Weighted squared distance to the target
    Quadratic,
    /// `1 - exp(-d^2 / (2 width^2))`, bounded in `[0, 1]`
    Saturating,
}

/// One entry of a cost target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetEntry {
    /// Literal value
    Value(f64),
    /// Free variable bound at evaluation time
    Variable(String),
}

/// Immediate cost over plant states and actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostFunction {
    /// Cost shape
    pub kind: CostKind,
    /// Target state
    pub target: Vec<TargetEntry>,
    /// Per-dimension weights on the state error
    pub weights: Vec<f64>,
    /// Width of the saturating cost
    #[serde(default = "default_width")]
    pub width: f64,
    /// Quadratic penalty on the action
    #[serde(default)]
    pub action_weight: f64,
    /// State dimensions whose error is wrapped to `[-pi, pi]`
    #[serde(default)]
    pub angle_dims: Vec<usize>,
    /// Runtime values of the free variables
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

fn default_width() -> f64 {
    1.0
}

impl CostFunction {
    /// Names of the free variables in first-use order
    #[must_use]
    pub fn free_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in &self.target {
            if let TargetEntry::Variable(name) = entry {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Current values of the free variables, in `free_variables` order
    pub fn free_values(&self) -> Result<Vec<f64>> {
        self.free_variables()
            .iter()
            .map(|name| {
                self.params.get(name).copied().ok_or_else(|| {
                    MbrlError::Config(format!("cost free variable `{name}` has no value"))
                })
            })
            .collect()
    }

    /// Resolve the target given values for the free variables
    pub fn bind(&self, free_values: &[f64]) -> Result<Vec<f64>> {
        let names = self.free_variables();
        if names.len() != free_values.len() {
            return Err(MbrlError::DimensionMismatch {
                expected: names.len(),
                actual: free_values.len(),
            });
        }
        Ok(self
            .target
            .iter()
            .map(|entry| match entry {
                TargetEntry::Value(v) => *v,
                TargetEntry::Variable(name) => {
                    let idx = names.iter().position(|n| n == name).unwrap_or_default();
                    free_values[idx]
                }
            })
            .collect())
    }

    /// Resolve the target from the stored parameter table
    pub fn resolved_target(&self) -> Result<Vec<f64>> {
        self.bind(&self.free_values()?)
    }

    /// Check the cost against the plant state dimension
    pub fn validate(&self, state_dim: usize) -> Result<()> {
        if self.target.len() != state_dim {
            return Err(MbrlError::DimensionMismatch {
                expected: state_dim,
                actual: self.target.len(),
            });
        }
        if self.weights.len() != state_dim {
            return Err(MbrlError::DimensionMismatch {
                expected: state_dim,
                actual: self.weights.len(),
            });
        }
        if let Some(&dim) = self.angle_dims.iter().find(|&&d| d >= state_dim) {
            return Err(MbrlError::Config(format!(
                "cost angle dimension {dim} out of range for state of size {state_dim}"
            )));
        }
        if self.kind == CostKind::Saturating && self.width <= 0.0 {
            return Err(MbrlError::Config("saturating cost width must be positive".into()));
        }
        self.free_values().map(|_| ())
    }

    /// Evaluate against an already resolved target
    #[must_use]
    pub fn evaluate(&self, state: &[f64], action: &[f64], target: &[f64]) -> f64 {
        let mut dist = 0.0;
        for (i, ((x, t), w)) in state.iter().zip(target).zip(&self.weights).enumerate() {
            let mut err = x - t;
            if self.angle_dims.contains(&i) {
                err = wrap_angle(err);
            }
            dist += w * err * err;
        }

        let state_cost = match self.kind {
            CostKind::Quadratic => dist,
            CostKind::Saturating => 1.0 - (-0.5 * dist / (self.width * self.width)).exp(),
        };
        let action_cost: f64 = action.iter().map(|u| u * u).sum::<f64>() * self.action_weight;

        state_cost + action_cost
    }

    /// Evaluate using the stored parameter table
    pub fn evaluate_now(&self, state: &[f64], action: &[f64]) -> Result<f64> {
        let target = self.resolved_target()?;
        Ok(self.evaluate(state, action, &target))
    }
}

/// Wrap an angle to `[-pi, pi)`
#[must_use]
pub fn wrap_angle(angle: f64) -> f64 {
    (angle + PI).rem_euclid(2.0 * PI) - PI
}
