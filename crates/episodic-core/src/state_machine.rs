//! Per-task lifecycle decisions
//!
//! On every dequeue the scheduler asks the state machine which policy to act
//! with, runs the episode, and then commits the result. Planning has no side
//! effects, so a failed episode leaves the task exactly as it was.
//!
//! ```text
//! init ─► collecting_random ─► ready ─► training ─► compiling_optimizer ─► optimizing ─┐
//!   │                            ▲          │                                ▲         │
//!   └────────────────────────────┤          └────────────────────────────────┘         │
//!                                └─────────────────────────────────────────────────────┘
//! any of init / collecting_random / ready ─► done
//! ```

use crate::dynamics::DynamicsModel;
use crate::error::{MbrlError, Result};
use crate::experience::Episode;
use crate::task::{Strategy, Task, TaskState};

/// Policy a cycle acts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActingPolicy {
    /// Random exploration
    Exploration,
    /// The task's learned policy
    Learned,
}

/// Decision taken at dequeue time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePlan {
    /// Policy to act with
    pub acting: ActingPolicy,
    /// Episode length in steps
    pub horizon: usize,
    /// Task state the plan was made in
    pub state: TaskState,
}

/// What the scheduler does after a committed episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterEpisode {
    /// Put the task straight back on the queue
    Reenqueue,
    /// Launch an optimization job
    Optimize,
    /// The task finished
    Done,
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Collect, train, optimize
    #[default]
    Training,
    /// Act with the learned policy only, for a fixed number of episodes
    Playback {
        /// Episodes per task
        episodes: usize,
    },
}

/// Lifecycle rules shared by all tasks
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskStateMachine {
    mode: Mode,
}

impl TaskStateMachine {
    /// State machine for the given mode
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }

    /// Operating mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether optimization jobs are launched at all
    #[must_use]
    pub fn trains(&self) -> bool {
        matches!(self.mode, Mode::Training)
    }

    /// Mark a freshly registered task done if it has nothing left to do.
    ///
    /// Returns `true` if the task is done.
    pub fn settle(&self, task: &mut Task) -> Result<bool> {
        let finished = match self.mode {
            Mode::Training => task.budget_reached(),
            Mode::Playback { episodes } => episodes == 0,
        };
        if finished && !task.state().is_terminal() {
            task.transition(TaskState::Done)?;
        }
        Ok(task.state().is_terminal())
    }

    /// Pick the acting policy for the next episode
    pub fn plan(&self, task: &Task) -> Result<CyclePlan> {
        let state = task.state();
        if state.is_terminal() || state.is_optimizing() {
            return Err(MbrlError::InvalidTransition {
                task: task.name().to_string(),
                from: state,
                to: TaskState::Ready,
            });
        }

        let exploring = self.trains()
            && matches!(state, TaskState::Init | TaskState::CollectingRandom)
            && task.remaining_random_trials() > 0;

        Ok(CyclePlan {
            acting: if exploring {
                ActingPolicy::Exploration
            } else {
                ActingPolicy::Learned
            },
            horizon: task.spec.horizon_steps(),
            state,
        })
    }

    /// Record a successfully collected episode and advance the lifecycle
    pub fn commit(&self, task: &mut Task, plan: &CyclePlan, episode: Episode) -> Result<AfterEpisode> {
        if task.state() != plan.state {
            return Err(MbrlError::InvalidTransition {
                task: task.name().to_string(),
                from: task.state(),
                to: plan.state,
            });
        }

        task.experience.append_episode(episode);
        task.count_episode();

        match plan.acting {
            ActingPolicy::Exploration => {
                let remaining = task.consume_random_trial();
                if remaining == 0 {
                    task.transition(TaskState::Ready)?;
                } else if task.state() == TaskState::Init {
                    task.transition(TaskState::CollectingRandom)?;
                }
                Ok(AfterEpisode::Reenqueue)
            }
            ActingPolicy::Learned => {
                if task.state() != TaskState::Ready {
                    task.set_remaining_random_trials(0);
                    task.transition(TaskState::Ready)?;
                }
                match self.mode {
                    Mode::Training => Ok(AfterEpisode::Optimize),
                    Mode::Playback { episodes } if task.episodes_this_run() >= episodes => {
                        task.transition(TaskState::Done)?;
                        Ok(AfterEpisode::Done)
                    }
                    Mode::Playback { .. } => Ok(AfterEpisode::Reenqueue),
                }
            }
        }
    }

    /// Enter `training` for an optimization job and return the checkpoint
    /// state to roll back to if the job fails.
    ///
    /// A task resumed with a policy history may still be in `init`; it is
    /// promoted to `ready` first.
    pub fn begin_optimization(&self, task: &mut Task) -> Result<TaskState> {
        if matches!(task.state(), TaskState::Init | TaskState::CollectingRandom) {
            task.set_remaining_random_trials(0);
            task.transition(TaskState::Ready)?;
        }
        let checkpoint = task.state();
        task.transition(TaskState::Training)?;
        Ok(checkpoint)
    }

    /// Apply the result of a successful optimization job.
    ///
    /// Nothing is modified if the parameters do not fit the policy.
    pub fn complete_optimization(
        &self,
        task: &mut Task,
        params: &[f64],
        model: Option<Box<dyn DynamicsModel>>,
        strategy: Strategy,
    ) -> Result<TaskState> {
        task.state().validate_transition(task.name(), &TaskState::Ready)?;
        task.policy.set_params(params)?;
        if let Some(model) = model {
            task.dynamics = model;
        }
        task.experience.append_policy_params(params.to_vec(), strategy);
        task.transition(TaskState::Ready)?;

        if task.budget_reached() {
            task.transition(TaskState::Done)?;
        }
        Ok(task.state())
    }

    /// Return a task to the state recorded when its job started
    pub fn rollback(&self, task: &mut Task, checkpoint: TaskState) {
        if task.state() != checkpoint {
            tracing::debug!(task = %task.name(), from = %task.state(), to = %checkpoint, "rolling back");
            task.restore_state(checkpoint);
        }
    }
}
