//! Shared view of task progress
//!
//! The scheduler owns the tasks themselves; the registry only mirrors their
//! status so it can be read from anywhere (jobs, status reporting, tests)
//! without touching a task that may be in flight.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::{MbrlError, Result};
use crate::task::{Task, TaskState};

/// Status of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    /// Task name
    pub name: String,
    /// Lifecycle state
    pub state: TaskState,
    /// Episodes in the experience store
    pub episodes: usize,
    /// Completed optimization iterations
    pub iterations: usize,
    /// Target optimization iterations
    pub n_opt: usize,
    /// Exploration episodes still to collect
    pub remaining_random_trials: usize,
    /// Whether an optimization job currently owns the task
    pub job_in_flight: bool,
    /// Failed cycles (episodes or optimizations)
    pub failures: usize,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Given up on after a failure it cannot recover from
    pub abandoned: bool,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    fn from_task(task: &Task) -> Self {
        Self {
            name: task.name().to_string(),
            state: task.state(),
            episodes: task.experience.n_episodes(),
            iterations: task.experience.completed_iterations(),
            n_opt: task.spec.n_opt,
            remaining_random_trials: task.remaining_random_trials(),
            job_in_flight: false,
            failures: 0,
            last_error: None,
            abandoned: false,
            updated_at: Utc::now(),
        }
    }

    /// Whether the scheduler is finished with the task
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.abandoned || self.state.is_terminal()
    }
}

/// Concurrent name to status map
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, TaskStatus>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    jobs_started: AtomicUsize,
}

impl TaskRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, replacing any previous entry of the same name
    pub fn register(&self, task: &Task) {
        self.tasks.insert(task.name().to_string(), TaskStatus::from_task(task));
    }

    /// Refresh the mirrored fields from the task
    pub fn sync(&self, task: &Task) {
        match self.tasks.get_mut(task.name()) {
            Some(mut status) => {
                status.state = task.state();
                status.episodes = task.experience.n_episodes();
                status.iterations = task.experience.completed_iterations();
                status.remaining_random_trials = task.remaining_random_trials();
                status.updated_at = Utc::now();
            }
            None => self.register(task),
        }
    }

    /// Mark a job as started. Fails if the task already has one in flight.
    pub fn begin_job(&self, task: &Task) -> Result<()> {
        let mut status = self
            .tasks
            .get_mut(task.name())
            .ok_or_else(|| MbrlError::Config(format!("task `{}` is not registered", task.name())))?;
        if status.job_in_flight {
            return Err(MbrlError::InvalidTransition {
                task: task.name().to_string(),
                from: status.state,
                to: TaskState::Training,
            });
        }
        status.job_in_flight = true;
        status.state = task.state();
        status.updated_at = Utc::now();
        drop(status);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.jobs_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Mark a job as finished
    pub fn end_job(&self, name: &str) {
        if let Some(mut status) = self.tasks.get_mut(name) {
            if status.job_in_flight {
                status.job_in_flight = false;
                status.updated_at = Utc::now();
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Record a failed cycle against a task
    pub fn record_failure(&self, name: &str, error: &MbrlError) {
        if let Some(mut status) = self.tasks.get_mut(name) {
            status.failures += 1;
            status.last_error = Some(error.to_string());
            status.updated_at = Utc::now();
        }
    }

    /// Give up on a task: record `error`, release any job it held and
    /// stop waiting for it
    pub fn abandon(&self, name: &str, error: &MbrlError) {
        self.end_job(name);
        if let Some(mut status) = self.tasks.get_mut(name) {
            status.failures += 1;
            status.last_error = Some(error.to_string());
            status.abandoned = true;
            status.updated_at = Utc::now();
        }
    }

    /// Status of one task
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TaskStatus> {
        self.tasks.get(name).map(|s| s.clone())
    }

    /// State of one task
    #[must_use]
    pub fn state(&self, name: &str) -> Option<TaskState> {
        self.tasks.get(name).map(|s| s.state)
    }

    /// Whether every registered task is done or abandoned
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.tasks.iter().all(|s| s.is_finished())
    }

    /// Number of registered tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if no task is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Jobs currently running
    #[must_use]
    pub fn jobs_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running jobs observed
    #[must_use]
    pub fn peak_jobs_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Jobs started since creation
    #[must_use]
    pub fn jobs_started(&self) -> usize {
        self.jobs_started.load(Ordering::SeqCst)
    }

    /// Snapshot of all statuses, sorted by name
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let mut all: Vec<TaskStatus> = self.tasks.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
