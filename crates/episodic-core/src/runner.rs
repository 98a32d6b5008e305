//! Episode collection on the shared plant

use chrono::Utc;
use uuid::Uuid;

use crate::cost::CostFunction;
use crate::error::{MbrlError, Result};
use crate::experience::{Episode, Transition};
use crate::plant::Plant;
use crate::policy::{preprocess_angles, Policy};

/// Drives one bounded-horizon episode.
///
/// The runner never persists anything; the caller appends the returned
/// episode to the task's experience.
#[derive(Debug, Clone)]
pub struct EpisodeRunner {
    horizon: usize,
    preprocess: bool,
    cost: Option<CostFunction>,
}

impl EpisodeRunner {
    /// Runner for `horizon` control steps
    #[must_use]
    pub fn new(horizon: usize) -> Self {
        Self {
            horizon,
            preprocess: true,
            cost: None,
        }
    }

    /// Enable or disable angle preprocessing for policies that declare it
    #[must_use]
    pub fn with_preprocess(mut self, preprocess: bool) -> Self {
        self.preprocess = preprocess;
        self
    }

    /// Cost used when the plant does not report one
    #[must_use]
    pub fn with_cost(mut self, cost: CostFunction) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Configured horizon
    #[must_use]
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Run one episode. The plant is stopped afterwards even on failure.
    pub async fn run(&self, plant: &mut dyn Plant, policy: &mut Policy) -> Result<Episode> {
        let result = self.collect(plant, policy).await;
        let stopped = plant.stop().await.map_err(robot_io);
        let episode = result?;
        stopped?;
        Ok(episode)
    }

    async fn collect(&self, plant: &mut dyn Plant, policy: &mut Policy) -> Result<Episode> {
        let target = self.cost.as_ref().map(CostFunction::resolved_target).transpose()?;
        let angle_dims = if self.preprocess && policy.capabilities().angle_preprocessing {
            policy.angle_dims().to_vec()
        } else {
            Vec::new()
        };

        policy.begin_episode();
        let mut state = plant.reset().await.map_err(robot_io)?;
        let mut transitions = Vec::with_capacity(self.horizon);
        let mut timestamps = Vec::with_capacity(self.horizon);
        let mut terminated_early = false;

        for _ in 0..self.horizon {
            let input = preprocess_angles(&state, &angle_dims);
            let action = policy.act(&input);
            let step = plant.step(&action).await.map_err(robot_io)?;

            let cost = match (step.cost, &self.cost, &target) {
                (Some(c), _, _) => c,
                (None, Some(cost), Some(target)) => cost.evaluate(&step.state, &action, target),
                _ => {
                    return Err(MbrlError::Config(
                        "plant reports no cost and no cost function is configured".into(),
                    ))
                }
            };

            timestamps.push(step.info.timestamp());
            transitions.push(Transition {
                state: std::mem::replace(&mut state, step.state),
                action,
                cost,
                info: step.info,
            });

            if step.done {
                terminated_early = transitions.len() < self.horizon;
                break;
            }
        }

        tracing::debug!(
            steps = transitions.len(),
            horizon = self.horizon,
            terminated_early,
            "episode collected"
        );

        Ok(Episode {
            id: Uuid::new_v4(),
            transitions,
            final_state: state,
            policy_params: policy.params(),
            timestamps,
            terminated_early,
            recorded_at: Utc::now(),
        })
    }
}

fn robot_io(err: MbrlError) -> MbrlError {
    match err {
        MbrlError::RobotIo(_) => err,
        other => MbrlError::RobotIo(other.to_string()),
    }
}
