//! Optimization jobs
//!
//! A job takes a task by value, runs one optimization pass on it and sends
//! it back to the scheduler together with the outcome. While the job runs
//! nobody else can reach the task.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::Instrument;

use episodic_core::{MbrlError, Result, Strategy, Task, TaskRegistry, TaskState};
use episodic_optim::{OptimizationBackend, OptimizationOutcome};

/// Work item on the scheduler queue
#[derive(Debug)]
pub enum Dispatch {
    /// Task ready for its next cycle
    Cycle(Task),
    /// Task handed back by a finished optimization job
    Completed {
        /// The task
        task: Task,
        /// State to roll back to on failure
        checkpoint: TaskState,
        /// Strategy that ran
        strategy: Strategy,
        /// What the backend returned
        outcome: Result<OptimizationOutcome>,
    },
    /// Optimization job that ended without handing its task back
    Failed {
        /// Name of the lost task
        name: String,
        /// Strategy that ran
        strategy: Strategy,
        /// Why the job ended
        error: MbrlError,
    },
}

impl Dispatch {
    /// Name of the carried task
    #[must_use]
    pub fn task_name(&self) -> &str {
        match self {
            Self::Cycle(task) | Self::Completed { task, .. } => task.name(),
            Self::Failed { name, .. } => name,
        }
    }
}

/// Start an optimization job for `task`, which must already be in
/// `training`.
///
/// Fails without spawning anything if the registry already has a job in
/// flight for the task. A job that panics loses its task; a supervisor
/// reports that as [`Dispatch::Failed`] so the scheduler stops waiting.
pub fn spawn_optimization(
    task: Task,
    checkpoint: TaskState,
    backend: Arc<dyn OptimizationBackend>,
    registry: &TaskRegistry,
    queue: UnboundedSender<Dispatch>,
) -> Result<()> {
    registry.begin_job(&task)?;
    registry.sync(&task);
    metrics::gauge!("episodic_jobs_in_flight", registry.jobs_in_flight() as f64);

    let strategy = backend.strategy();
    let name = task.name().to_string();
    let span = tracing::info_span!("task", name = %name, %strategy);
    let results = queue.clone();
    let job = tokio::spawn(
        async move {
            let mut task = task;
            tracing::info!(iteration = task.experience.completed_iterations() + 1, "optimization started");
            let outcome = backend.optimize(&mut task).await;
            match &outcome {
                Ok(o) => tracing::info!(
                    initial_loss = ?o.report.initial_loss,
                    final_loss = ?o.report.final_loss,
                    steps = o.report.iterations,
                    "optimization finished"
                ),
                Err(e) => tracing::warn!(error = %e, "optimization failed"),
            }
            let completed = Dispatch::Completed {
                task,
                checkpoint,
                strategy,
                outcome,
            };
            if results.send(completed).is_err() {
                tracing::error!("scheduler gone, dropping optimization result");
            }
        }
        .instrument(span.clone()),
    );

    tokio::spawn(
        async move {
            let Err(e) = job.await else { return };
            tracing::error!(error = %e, "optimization job aborted, task lost");
            let failed = Dispatch::Failed {
                name,
                strategy,
                error: MbrlError::Optimization(format!("optimization job aborted: {e}")),
            };
            if queue.send(failed).is_err() {
                tracing::error!("scheduler gone, dropping job failure");
            }
        }
        .instrument(span),
    );
    Ok(())
}
