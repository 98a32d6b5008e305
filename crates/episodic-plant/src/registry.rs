//! Plant kind registry

use std::collections::BTreeMap;
use std::fmt;

use episodic_core::{MbrlError, PlantParams, Result};

use crate::classic::{CartPole, DoubleIntegrator, Pendulum, System};

type SystemConstructor = Box<dyn Fn(&PlantParams) -> Result<Box<dyn System>> + Send + Sync>;

/// Maps plant kinds to system constructors
pub struct PlantRegistry {
    systems: BTreeMap<String, SystemConstructor>,
}

impl fmt::Debug for PlantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlantRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl Default for PlantRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl PlantRegistry {
    /// Registry without any kinds
    #[must_use]
    pub fn empty() -> Self {
        Self {
            systems: BTreeMap::new(),
        }
    }

    /// Registry with `cartpole`, `pendulum` and `double_integrator`
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("cartpole", |p| Ok(Box::new(CartPole::from_params(p)?)));
        registry.register("pendulum", |p| Ok(Box::new(Pendulum::from_params(p)?)));
        registry.register("double_integrator", |p| Ok(Box::new(DoubleIntegrator::from_params(p)?)));
        registry
    }

    /// Register a system constructor under `kind`
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&PlantParams) -> Result<Box<dyn System>> + Send + Sync + 'static,
    {
        self.systems.insert(kind.into(), Box::new(constructor));
    }

    /// Whether `kind` is known
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.systems.contains_key(kind)
    }

    /// Build the system for `params.kind`
    pub fn make(&self, params: &PlantParams) -> Result<Box<dyn System>> {
        let constructor = self.systems.get(&params.kind).ok_or_else(|| {
            MbrlError::Config(format!(
                "unknown plant kind `{}` (known: {})",
                params.kind,
                self.kinds().join(", ")
            ))
        })?;
        constructor(params)
    }

    /// Build the system for `params` and check the initial state
    /// distribution against it
    pub fn build(&self, params: &PlantParams) -> Result<Box<dyn System>> {
        params.validate()?;
        let system = self.make(params)?;
        if system.state_dim() != params.state0.dim() {
            return Err(MbrlError::Config(format!(
                "plant `{}` has {} state dimensions, initial state has {}",
                params.kind,
                system.state_dim(),
                params.state0.dim()
            )));
        }
        Ok(system)
    }

    /// Check that `params` describe a plant this registry can build and
    /// that it takes `action_dim` actions
    pub fn validate(&self, params: &PlantParams, action_dim: usize) -> Result<()> {
        let system = self.build(params)?;
        if system.action_dim() != action_dim {
            return Err(MbrlError::Config(format!(
                "plant `{}` takes {} actions, policy produces {}",
                params.kind,
                system.action_dim(),
                action_dim
            )));
        }
        Ok(())
    }

    /// Registered kinds, sorted
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.systems.keys().cloned().collect()
    }
}
