//! Classic control systems
//!
//! Continuous-action versions of the usual benchmarks. Each system only
//! provides its equations of motion; integration, timing and noise are the
//! simulated plant's job.

use std::f64::consts::PI;
use std::fmt::Debug;

use episodic_core::{MbrlError, PlantParams, Result};

/// Equations of motion `dx/dt = f(x, u)`
pub trait System: Debug + Send {
    /// State dimension
    fn state_dim(&self) -> usize;

    /// Action dimension
    fn action_dim(&self) -> usize;

    /// State derivative
    fn derivatives(&self, state: &[f64], action: &[f64]) -> Vec<f64>;

    /// Clamp an action to what the actuator can apply
    fn saturate(&self, action: &[f64]) -> Vec<f64> {
        action.to_vec()
    }

    /// Dimensions holding angles
    fn angle_dims(&self) -> Vec<usize> {
        Vec::new()
    }
}

fn positive(params: &PlantParams, key: &str, default: f64) -> Result<f64> {
    let value = params.setting(key, default);
    if value > 0.0 {
        Ok(value)
    } else {
        Err(MbrlError::Config(format!(
            "plant `{}`: setting `{key}` must be positive, got {value}",
            params.kind
        )))
    }
}

/// Cart with a freely swinging pole, pushed by a horizontal force.
///
/// State `[x, x_dot, theta, theta_dot]` with `theta = 0` upright.
#[derive(Debug, Clone, PartialEq)]
pub struct CartPole {
    gravity: f64,
    mass_cart: f64,
    mass_pole: f64,
    /// Half the pole length
    length: f64,
    friction: f64,
    max_force: f64,
}

impl Default for CartPole {
    fn default() -> Self {
        Self {
            gravity: 9.82,
            mass_cart: 0.5,
            mass_pole: 0.5,
            length: 0.5,
            friction: 0.1,
            max_force: 10.0,
        }
    }
}

impl CartPole {
    /// Build from plant settings, falling back to defaults
    pub fn from_params(params: &PlantParams) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            gravity: positive(params, "gravity", d.gravity)?,
            mass_cart: positive(params, "mass_cart", d.mass_cart)?,
            mass_pole: positive(params, "mass_pole", d.mass_pole)?,
            length: positive(params, "length", d.length)?,
            friction: params.setting("friction", d.friction).max(0.0),
            max_force: positive(params, "max_force", d.max_force)?,
        })
    }
}

impl System for CartPole {
    fn state_dim(&self) -> usize {
        4
    }

    fn action_dim(&self) -> usize {
        1
    }

    fn derivatives(&self, state: &[f64], action: &[f64]) -> Vec<f64> {
        let (x_dot, theta, theta_dot) = (state[1], state[2], state[3]);
        let force = action[0] - self.friction * x_dot;

        let (sin_theta, cos_theta) = theta.sin_cos();
        let total_mass = self.mass_cart + self.mass_pole;
        let pole_mass_length = self.mass_pole * self.length;

        let temp = (force + pole_mass_length * theta_dot.powi(2) * sin_theta) / total_mass;
        let theta_acc = (self.gravity * sin_theta - cos_theta * temp)
            / (self.length * (4.0 / 3.0 - self.mass_pole * cos_theta.powi(2) / total_mass));
        let x_acc = temp - pole_mass_length * theta_acc * cos_theta / total_mass;

        vec![x_dot, x_acc, theta_dot, theta_acc]
    }

    fn saturate(&self, action: &[f64]) -> Vec<f64> {
        vec![action[0].clamp(-self.max_force, self.max_force)]
    }

    fn angle_dims(&self) -> Vec<usize> {
        vec![2]
    }
}

/// Torque-driven pendulum.
///
/// State `[theta, theta_dot]` with `theta = 0` hanging down and `pi` upright.
#[derive(Debug, Clone, PartialEq)]
pub struct Pendulum {
    gravity: f64,
    mass: f64,
    length: f64,
    friction: f64,
    max_torque: f64,
}

impl Default for Pendulum {
    fn default() -> Self {
        Self {
            gravity: 9.82,
            mass: 1.0,
            length: 1.0,
            friction: 0.01,
            max_torque: 2.5,
        }
    }
}

impl Pendulum {
    /// Build from plant settings, falling back to defaults
    pub fn from_params(params: &PlantParams) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            gravity: positive(params, "gravity", d.gravity)?,
            mass: positive(params, "mass", d.mass)?,
            length: positive(params, "length", d.length)?,
            friction: params.setting("friction", d.friction).max(0.0),
            max_torque: positive(params, "max_torque", d.max_torque)?,
        })
    }

    /// Angle of the upright equilibrium
    #[must_use]
    pub fn upright() -> f64 {
        PI
    }
}

impl System for Pendulum {
    fn state_dim(&self) -> usize {
        2
    }

    fn action_dim(&self) -> usize {
        1
    }

    fn derivatives(&self, state: &[f64], action: &[f64]) -> Vec<f64> {
        let (theta, theta_dot) = (state[0], state[1]);
        let inertia = self.mass * self.length * self.length;
        let theta_acc = (action[0]
            - self.friction * theta_dot
            - self.mass * self.gravity * self.length * theta.sin())
            / inertia;
        vec![theta_dot, theta_acc]
    }

    fn saturate(&self, action: &[f64]) -> Vec<f64> {
        vec![action[0].clamp(-self.max_torque, self.max_torque)]
    }

    fn angle_dims(&self) -> Vec<usize> {
        vec![0]
    }
}

/// Point mass on a line: `[x, x_dot]`, acceleration `u / mass`
#[derive(Debug, Clone, PartialEq)]
pub struct DoubleIntegrator {
    mass: f64,
}

impl DoubleIntegrator {
    /// Build from plant settings
    pub fn from_params(params: &PlantParams) -> Result<Self> {
        Ok(Self {
            mass: positive(params, "mass", 1.0)?,
        })
    }
}

impl System for DoubleIntegrator {
    fn state_dim(&self) -> usize {
        2
    }

    fn action_dim(&self) -> usize {
        1
    }

    fn derivatives(&self, state: &[f64], action: &[f64]) -> Vec<f64> {
        vec![state[1], action[0] / self.mass]
    }
}
