//! Task scheduler
//!
//! One loop owns the plant and a FIFO queue of tasks. Each dequeued task
//! runs one episode on the plant; in training mode a learned-policy
//! episode is followed by an optimization job that runs concurrently with
//! the other tasks' episodes and hands the task back through the same
//! queue when it finishes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::Instrument;

use episodic_core::{
    AfterEpisode, CyclePlan, Episode, EpisodeRunner, ExperienceStore, MbrlError, Mode, Plant, Result,
    Strategy, Task, TaskRegistry, TaskSpec, TaskState, TaskStateMachine, TaskStatus,
};
use episodic_optim::{Backends, OptimizationBackend, OptimizationOutcome};

use crate::job::{spawn_optimization, Dispatch};

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// How long to wait on an empty queue before logging and waiting again
    pub dequeue_timeout_secs: u64,
    /// Episodes per task in playback mode
    pub playback_episodes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout_secs: 5,
            playback_episodes: 1,
        }
    }
}

impl SchedulerConfig {
    /// Dequeue timeout, at least one second
    #[must_use]
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs.max(1))
    }
}

/// Final state of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Per-task status in registration order
    pub tasks: Vec<TaskStatus>,
    /// Optimization jobs started
    pub jobs_started: usize,
    /// Most optimization jobs running at once
    pub peak_jobs_in_flight: usize,
}

impl RunSummary {
    /// Status of one task
    #[must_use]
    pub fn task(&self, name: &str) -> Option<&TaskStatus> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// Runs tasks on the shared plant until every task is done
pub struct Scheduler {
    plant: Box<dyn Plant>,
    backends: Backends,
    machine: TaskStateMachine,
    registry: Arc<TaskRegistry>,
    config: SchedulerConfig,
    output_dir: PathBuf,
    queue: UnboundedSender<Dispatch>,
    inbox: UnboundedReceiver<Dispatch>,
    order: Vec<String>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("backends", &self.backends)
            .field("mode", &self.machine.mode())
            .field("output_dir", &self.output_dir)
            .field("tasks", &self.order)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Training-mode scheduler driving `plant`
    pub fn new(
        plant: Box<dyn Plant>,
        backends: Backends,
        config: SchedulerConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        Self {
            plant,
            backends,
            machine: TaskStateMachine::default(),
            registry: Arc::new(TaskRegistry::new()),
            config,
            output_dir: output_dir.into(),
            queue,
            inbox,
            order: Vec::new(),
        }
    }

    /// Switch to playback: learned policy only, no optimization
    #[must_use]
    pub fn playback(mut self) -> Self {
        self.machine = TaskStateMachine::new(Mode::Playback {
            episodes: self.config.playback_episodes,
        });
        self
    }

    /// Shared view of task progress
    #[must_use]
    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }

    /// Operating mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.machine.mode()
    }

    /// Build a task, restoring saved experience from `output_dir` when
    /// resuming. Unreadable experience, or experience whose policy does not
    /// fit the current task, only costs a warning.
    pub async fn load_task(spec: TaskSpec, output_dir: &Path, resume: bool) -> Result<Task> {
        if !resume {
            return Task::new(spec);
        }
        let store = ExperienceStore::load_or_empty(output_dir, &spec.name).await;
        match Task::new(spec.clone())?.with_experience(store) {
            Ok(task) => Ok(task),
            Err(e) => {
                tracing::warn!(
                    task = %spec.name,
                    error = %e,
                    "saved experience does not fit the task, starting from scratch"
                );
                Task::new(spec)
            }
        }
    }

    /// Register a task and schedule its first step.
    ///
    /// A task with a policy history is optimized right away in training
    /// mode, before it collects any episode. A task with nothing left to
    /// do is registered as done.
    pub fn add_task(&mut self, mut task: Task) -> Result<()> {
        let name = task.name().to_string();
        if self.registry.get(&name).is_some() {
            return Err(MbrlError::Config(format!("task `{name}` registered twice")));
        }
        if self.machine.trains() {
            self.backends.for_task(&task.spec)?;
        }

        self.registry.register(&task);
        self.order.push(name.clone());

        if self.machine.settle(&mut task)? {
            self.registry.sync(&task);
            tracing::info!(task = %name, "nothing left to do");
            return Ok(());
        }

        if self.machine.trains() && !task.experience.policy_history().is_empty() {
            let backend = self.backends.for_resume(&task.spec)?;
            tracing::info!(
                task = %name,
                strategy = %backend.strategy(),
                iterations = task.experience.completed_iterations(),
                "resuming with an optimization pass"
            );
            return self.launch(task, backend);
        }

        self.enqueue(task)
    }

    /// Run until every registered task is done
    pub async fn run(mut self) -> Result<RunSummary> {
        let timeout = self.config.dequeue_timeout();
        tracing::info!(tasks = self.order.len(), mode = ?self.machine.mode(), "scheduler started");

        while !self.registry.all_done() {
            let dispatch = match tokio::time::timeout(timeout, self.inbox.recv()).await {
                Ok(Some(dispatch)) => dispatch,
                Ok(None) => return Err(queue_closed()),
                Err(_) => {
                    tracing::info!(
                        jobs_in_flight = self.registry.jobs_in_flight(),
                        "queue empty, waiting"
                    );
                    continue;
                }
            };

            let span = tracing::info_span!("task", name = %dispatch.task_name());
            match dispatch {
                Dispatch::Cycle(task) => self.cycle(task).instrument(span).await?,
                Dispatch::Completed {
                    task,
                    checkpoint,
                    strategy,
                    outcome,
                } => {
                    self.complete(task, checkpoint, strategy, outcome)
                        .instrument(span)
                        .await?;
                }
                Dispatch::Failed { name, strategy, error } => {
                    span.in_scope(|| self.job_lost(&name, strategy, &error));
                }
            }
        }

        tracing::info!(jobs = self.registry.jobs_started(), "all tasks done");
        Ok(self.summary())
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            tasks: self.order.iter().filter_map(|name| self.registry.get(name)).collect(),
            jobs_started: self.registry.jobs_started(),
            peak_jobs_in_flight: self.registry.peak_jobs_in_flight(),
        }
    }

    fn enqueue(&self, task: Task) -> Result<()> {
        self.queue.send(Dispatch::Cycle(task)).map_err(|_| queue_closed())
    }

    fn launch(&self, mut task: Task, backend: Arc<dyn OptimizationBackend>) -> Result<()> {
        let checkpoint = self.machine.begin_optimization(&mut task)?;
        spawn_optimization(task, checkpoint, backend, &self.registry, self.queue.clone())
    }

    async fn cycle(&mut self, mut task: Task) -> Result<()> {
        if task.state().is_terminal() {
            tracing::debug!("skipping finished task");
            return Ok(());
        }

        let plan = self.machine.plan(&task)?;
        match self.plant.init(&task.spec.plant).await {
            Ok(()) => {}
            Err(e) if e.is_cycle_local() => return self.retry_later(task, &e),
            Err(e) => {
                self.retire(task.name(), &e);
                return Ok(());
            }
        }
        let episode = match self.collect(&mut task, &plan).await {
            Ok(episode) => episode,
            Err(e) if e.is_cycle_local() => return self.retry_later(task, &e),
            Err(e) => return Err(e),
        };

        let steps = episode.len();
        let cost = episode.total_cost();
        let after = self.machine.commit(&mut task, &plan, episode)?;
        task.experience.save(&self.output_dir).await?;
        self.registry.sync(&task);
        metrics::increment_counter!("episodic_episodes_total", "task" => task.name().to_string());
        tracing::info!(
            policy = ?plan.acting,
            steps,
            cost,
            episodes = task.experience.n_episodes(),
            state = %task.state(),
            "episode recorded"
        );

        match after {
            AfterEpisode::Reenqueue => self.enqueue(task),
            AfterEpisode::Optimize => {
                let backend = self.backends.for_task(&task.spec)?;
                self.launch(task, backend)
            }
            AfterEpisode::Done => {
                tracing::info!("task done");
                Ok(())
            }
        }
    }

    /// A job ended without handing its task back, so the task is gone
    fn job_lost(&self, name: &str, strategy: Strategy, error: &MbrlError) {
        self.registry.end_job(name);
        metrics::gauge!("episodic_jobs_in_flight", self.registry.jobs_in_flight() as f64);
        metrics::increment_counter!(
            "episodic_optimization_failures_total",
            "task" => name.to_string(),
            "strategy" => strategy.to_string()
        );
        self.retire(name, error);
    }

    /// Record a failed episode and put the task back in line
    fn retry_later(&self, task: Task, error: &MbrlError) -> Result<()> {
        tracing::warn!(error = %error, state = %task.state(), "episode failed, will retry");
        metrics::increment_counter!("episodic_episode_failures_total", "task" => task.name().to_string());
        self.registry.record_failure(task.name(), error);
        self.registry.sync(&task);
        self.enqueue(task)
    }

    /// Stop scheduling a task that cannot make progress. The other tasks
    /// keep running.
    fn retire(&self, name: &str, error: &MbrlError) {
        tracing::error!(error = %error, "giving up on task");
        metrics::increment_counter!("episodic_tasks_abandoned_total", "task" => name.to_string());
        self.registry.abandon(name, error);
    }

    async fn collect(&mut self, task: &mut Task, plan: &CyclePlan) -> Result<Episode> {
        let mut policy = task.acting_policy(plan.acting);
        EpisodeRunner::new(plan.horizon)
            .with_cost(task.spec.cost.clone())
            .run(self.plant.as_mut(), &mut policy)
            .await
    }

    async fn complete(
        &mut self,
        mut task: Task,
        checkpoint: TaskState,
        strategy: Strategy,
        outcome: Result<OptimizationOutcome>,
    ) -> Result<()> {
        self.registry.end_job(task.name());
        metrics::gauge!("episodic_jobs_in_flight", self.registry.jobs_in_flight() as f64);

        let machine = self.machine;
        let applied = outcome.and_then(|outcome| {
            machine
                .complete_optimization(&mut task, &outcome.params, outcome.model, strategy)
                .map(|state| (state, outcome.report))
        });

        match applied {
            Ok((state, report)) => {
                task.experience.save(&self.output_dir).await?;
                self.registry.sync(&task);
                metrics::increment_counter!(
                    "episodic_optimizations_total",
                    "task" => task.name().to_string(),
                    "strategy" => strategy.to_string()
                );
                tracing::info!(
                    iteration = task.experience.completed_iterations(),
                    n_opt = task.spec.n_opt,
                    final_loss = ?report.final_loss,
                    state = %state,
                    "policy updated"
                );
                if state.is_terminal() {
                    tracing::info!("task done");
                    Ok(())
                } else {
                    self.enqueue(task)
                }
            }
            Err(e) => {
                machine.rollback(&mut task, checkpoint);
                self.registry.record_failure(task.name(), &e);
                self.registry.sync(&task);
                metrics::increment_counter!(
                    "episodic_optimization_failures_total",
                    "task" => task.name().to_string(),
                    "strategy" => strategy.to_string()
                );
                tracing::warn!(error = %e, state = %task.state(), "optimization failed, keeping the previous policy");
                self.enqueue(task)
            }
        }
    }
}

fn queue_closed() -> MbrlError {
    MbrlError::Other(anyhow::anyhow!("scheduler queue closed"))
}
