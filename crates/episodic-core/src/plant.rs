//! Plant (robot) contract
//!
//! The plant is the single shared physical or simulated resource. Only the
//! scheduler's episode-collection step talks to it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{MbrlError, Result};

/// Additional numeric information returned by a plant step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Custom fields
    pub fields: BTreeMap<String, f64>,
}

impl StepInfo {
    /// Step timestamp (`t` field), if the plant reports one
    #[must_use]
    pub fn timestamp(&self) -> Option<f64> {
        self.fields.get("t").copied()
    }

    /// Info carrying only a timestamp
    #[must_use]
    pub fn at(t: f64) -> Self {
        Self {
            fields: BTreeMap::from([("t".to_string(), t)]),
        }
    }
}

/// Result of a single plant step
#[derive(Debug, Clone)]
pub struct PlantStep {
    /// State after applying the action
    pub state: Vec<f64>,
    /// Cost reported by the plant, if it computes one
    pub cost: Option<f64>,
    /// Early termination signal
    pub done: bool,
    /// Additional info
    pub info: StepInfo,
}

/// Gaussian distribution over initial states (diagonal covariance)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDistribution {
    /// Mean initial state
    pub mean: Vec<f64>,
    /// Per-dimension standard deviation
    pub std: Vec<f64>,
}

impl StateDistribution {
    /// State dimension
    #[must_use]
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Draw one initial state
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.mean
            .iter()
            .zip(&self.std)
            .map(|(&m, &s)| {
                if s > 0.0 {
                    Normal::new(m, s).map_or(m, |n| n.sample(rng))
                } else {
                    m
                }
            })
            .collect()
    }
}

/// Parameters used to (re)configure the plant for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantParams {
    /// Plant kind, e.g. `cartpole`
    pub kind: String,
    /// Control period in seconds
    pub dt: f64,
    /// Initial state distribution
    pub state0: StateDistribution,
    /// Hard cap on steps per episode enforced by the plant
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Plant specific settings (masses, lengths, ...)
    #[serde(default)]
    pub settings: BTreeMap<String, f64>,
}

impl PlantParams {
    /// Validate the parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0) {
            return Err(MbrlError::Config(format!(
                "plant `{}` needs a positive dt, got {}",
                self.kind, self.dt
            )));
        }
        if self.state0.mean.len() != self.state0.std.len() {
            return Err(MbrlError::DimensionMismatch {
                expected: self.state0.mean.len(),
                actual: self.state0.std.len(),
            });
        }
        Ok(())
    }

    /// Look up a setting with a default
    #[must_use]
    pub fn setting(&self, key: &str, default: f64) -> f64 {
        self.settings.get(key).copied().unwrap_or(default)
    }
}

/// Core plant trait
#[async_trait]
pub trait Plant: Send {
    /// Control period in seconds
    fn dt(&self) -> f64;

    /// Reconfigure the plant for the next task
    async fn init(&mut self, params: &PlantParams) -> Result<()>;

    /// Bring the plant to an initial state and return it
    async fn reset(&mut self) -> Result<Vec<f64>>;

    /// Apply one action
    async fn step(&mut self, action: &[f64]) -> Result<PlantStep>;

    /// Stop actuation (called after every episode)
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
