//! Simulated plant
//!
//! Stands in for the robot: reconfigured per task by `init`, integrates the
//! selected system with fixed Euler sub-steps, and reports a timestamp with
//! every step.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use episodic_core::{MbrlError, Plant, PlantParams, PlantStep, Result, StepInfo};

use crate::classic::System;
use crate::registry::PlantRegistry;

const DEFAULT_DT: f64 = 0.1;

/// Simulated plant backed by a [`PlantRegistry`]
#[derive(Debug)]
pub struct SimulatedPlant {
    registry: PlantRegistry,
    system: Option<Box<dyn System>>,
    params: Option<PlantParams>,
    state: Vec<f64>,
    t: f64,
    steps: usize,
    rng: StdRng,
}

impl Default for SimulatedPlant {
    fn default() -> Self {
        Self::new(PlantRegistry::with_builtin())
    }
}

impl SimulatedPlant {
    /// Plant using the given registry
    #[must_use]
    pub fn new(registry: PlantRegistry) -> Self {
        Self {
            registry,
            system: None,
            params: None,
            state: Vec::new(),
            t: 0.0,
            steps: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Fix the random seed (initial states and measurement noise)
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Kind of the currently configured system
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.params.as_ref().map(|p| p.kind.as_str())
    }

    /// True (noise-free) state
    #[must_use]
    pub fn true_state(&self) -> &[f64] {
        &self.state
    }

    fn configured(&self) -> Result<(&dyn System, &PlantParams)> {
        match (&self.system, &self.params) {
            (Some(system), Some(params)) => Ok((system.as_ref(), params)),
            _ => Err(MbrlError::RobotIo("plant used before init".into())),
        }
    }

    fn measure(&mut self, noise_std: f64) -> Vec<f64> {
        match Normal::new(0.0, noise_std) {
            Ok(noise) if noise_std > 0.0 => {
                let rng = &mut self.rng;
                self.state.iter().map(|x| x + noise.sample(rng)).collect()
            }
            _ => self.state.clone(),
        }
    }
}

#[async_trait]
impl Plant for SimulatedPlant {
    fn dt(&self) -> f64 {
        self.params.as_ref().map_or(DEFAULT_DT, |p| p.dt)
    }

    async fn init(&mut self, params: &PlantParams) -> Result<()> {
        let system = self.registry.build(params)?;
        tracing::debug!(kind = %params.kind, dt = params.dt, "plant configured");
        self.system = Some(system);
        self.params = Some(params.clone());
        self.state.clear();
        Ok(())
    }

    async fn reset(&mut self) -> Result<Vec<f64>> {
        let state0 = self.configured()?.1.state0.clone();
        self.state = state0.sample(&mut self.rng);
        self.t = 0.0;
        self.steps = 0;
        Ok(self.state.clone())
    }

    async fn step(&mut self, action: &[f64]) -> Result<PlantStep> {
        let (system, params) = self.configured()?;
        if self.state.len() != system.state_dim() {
            return Err(MbrlError::RobotIo("plant stepped before reset".into()));
        }
        if action.len() != system.action_dim() {
            return Err(MbrlError::RobotIo(format!(
                "expected {} action dimensions, got {}",
                system.action_dim(),
                action.len()
            )));
        }
        if action.iter().any(|u| !u.is_finite()) {
            return Err(MbrlError::RobotIo("non-finite action".into()));
        }

        let u = system.saturate(action);
        let substeps = params.setting("integration_steps", 10.0).max(1.0) as usize;
        let h = params.dt / substeps as f64;
        let mut x = self.state.clone();
        for _ in 0..substeps {
            let dx = system.derivatives(&x, &u);
            for (xi, di) in x.iter_mut().zip(dx) {
                *xi += h * di;
            }
        }
        let noise_std = params.setting("measurement_noise", 0.0);
        let max_steps = params.max_steps;
        let dt = params.dt;

        self.state = x;
        self.steps += 1;
        self.t += dt;
        let done = max_steps.is_some_and(|m| self.steps >= m);

        Ok(PlantStep {
            state: self.measure(noise_std),
            cost: None,
            done,
            info: StepInfo::at(self.t),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use episodic_core::StateDistribution;
    use std::collections::BTreeMap;

    fn integrator(max_steps: Option<usize>) -> PlantParams {
        PlantParams {
            kind: "double_integrator".into(),
            dt: 0.1,
            state0: StateDistribution {
                mean: vec![1.0, 0.0],
                std: vec![0.0, 0.0],
            },
            max_steps,
            settings: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn integrates_and_timestamps() {
        let mut plant = SimulatedPlant::default().with_seed(0);
        plant.init(&integrator(None)).await.unwrap();
        assert_eq!(plant.reset().await.unwrap(), vec![1.0, 0.0]);

        let step = plant.step(&[1.0]).await.unwrap();
        assert_relative_eq!(step.state[1], 0.1, epsilon = 1e-12);
        assert!(step.state[0] > 1.0);
        assert_relative_eq!(step.info.timestamp().unwrap(), 0.1);
        assert!(step.cost.is_none());
    }

    #[tokio::test]
    async fn max_steps_ends_the_episode() {
        let mut plant = SimulatedPlant::default();
        plant.init(&integrator(Some(2))).await.unwrap();
        plant.reset().await.unwrap();
        assert!(!plant.step(&[0.0]).await.unwrap().done);
        assert!(plant.step(&[0.0]).await.unwrap().done);
    }

    #[tokio::test]
    async fn misuse_is_reported_as_robot_io() {
        let mut plant = SimulatedPlant::default();
        assert!(matches!(plant.reset().await, Err(MbrlError::RobotIo(_))));

        plant.init(&integrator(None)).await.unwrap();
        plant.reset().await.unwrap();
        assert!(matches!(plant.step(&[0.0, 1.0]).await, Err(MbrlError::RobotIo(_))));
    }

    #[tokio::test]
    async fn init_rejects_mismatched_state_distribution() {
        let mut plant = SimulatedPlant::default();
        let mut params = integrator(None);
        params.kind = "cartpole".into();
        assert!(matches!(plant.init(&params).await, Err(MbrlError::Config(_))));
        assert!(plant.kind().is_none());
    }
}
