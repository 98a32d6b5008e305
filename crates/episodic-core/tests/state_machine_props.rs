//! Property tests for the task lifecycle.
//!
//! Arbitrary interleavings of successful and failed episodes and
//! optimization jobs are driven through the state machine; every observed
//! state change must be a legal transition or a rollback to the job's
//! checkpoint, and the experience must account for every successful step.

use std::collections::BTreeMap;

use chrono::Utc;
use proptest::prelude::*;
use uuid::Uuid;

use episodic_core::{
    ActingPolicy, AfterEpisode, CostFunction, CostKind, Episode, Objective, OptimizerSettings,
    PlantParams, PolicySpec, StateDistribution, Strategy as OptStrategy, TargetEntry, Task,
    TaskSpec, TaskState, TaskStateMachine,
};

#[derive(Debug, Clone, Copy)]
enum Event {
    EpisodeOk,
    EpisodeFailed,
    JobOk,
    JobFailed,
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop::sample::select(vec![
        Event::EpisodeOk,
        Event::EpisodeFailed,
        Event::JobOk,
        Event::JobFailed,
    ])
}

fn spec(trials: usize, n_opt: usize) -> TaskSpec {
    TaskSpec {
        name: "prop".into(),
        plant: PlantParams {
            kind: "integrator".into(),
            dt: 0.1,
            state0: StateDistribution {
                mean: vec![0.0, 0.0],
                std: vec![0.0, 0.0],
            },
            max_steps: None,
            settings: BTreeMap::new(),
        },
        policy: PolicySpec {
            max_u: vec![1.0],
            angle_dims: vec![1],
            seed: 0,
        },
        cost: CostFunction {
            kind: CostKind::Saturating,
            target: vec![TargetEntry::Value(0.0), TargetEntry::Value(0.0)],
            weights: vec![1.0, 1.0],
            width: 1.0,
            action_weight: 0.0,
            angle_dims: vec![1],
            params: BTreeMap::new(),
        },
        horizon_secs: 0.5,
        discount: 1.0,
        n_samples: 2,
        n_opt,
        initial_random_trials: trials,
        optimizer: None,
        random_walk: true,
        wrap_angles: true,
        optimizer_params: OptimizerSettings::default(),
    }
}

fn episode(acting: ActingPolicy, task: &Task) -> Episode {
    Episode {
        id: Uuid::new_v4(),
        transitions: vec![],
        final_state: vec![0.0, 0.0],
        policy_params: match acting {
            ActingPolicy::Exploration => None,
            ActingPolicy::Learned => Some(task.policy.params().to_vec()),
        },
        timestamps: vec![],
        terminated_early: false,
        recorded_at: Utc::now(),
    }
}

fn legal(from: TaskState, to: TaskState, checkpoint: Option<TaskState>) -> bool {
    from.can_transition_to(&to) || (from.is_optimizing() && Some(to) == checkpoint)
}

proptest! {
    #[test]
    fn lifecycle_follows_legal_path(
        trials in 0usize..5,
        n_opt in 1usize..4,
        events in prop::collection::vec(arb_event(), 1..60),
    ) {
        let sm = TaskStateMachine::default();
        let mut task = Task::new(spec(trials, n_opt)).unwrap();
        prop_assert!(!sm.settle(&mut task).unwrap());

        let mut episodes = 0;
        let mut iterations = 0;
        let mut compilations = 0;
        let mut explored = 0;
        let mut events = events.into_iter();

        while let Some(event) = events.next() {
            if task.state().is_terminal() {
                break;
            }
            let plan = sm.plan(&task).unwrap();
            let before = task.state();

            if matches!(event, Event::EpisodeFailed) {
                prop_assert_eq!(task.state(), before);
                continue;
            }

            let ep = episode(plan.acting, &task);
            let after = sm.commit(&mut task, &plan, ep).unwrap();
            episodes += 1;
            if plan.acting == ActingPolicy::Exploration {
                explored += 1;
                prop_assert!(explored <= trials);
            }
            prop_assert!(legal(before, task.state(), None) || before == task.state());

            if after != AfterEpisode::Optimize {
                prop_assert_eq!(after, AfterEpisode::Reenqueue);
                continue;
            }

            let checkpoint = sm.begin_optimization(&mut task).unwrap();
            prop_assert_eq!(checkpoint, TaskState::Ready);
            prop_assert_eq!(task.state(), TaskState::Training);

            if task.objective.is_none() {
                task.transition(TaskState::CompilingOptimizer).unwrap();
                task.objective = Some(Objective::compile(
                    &task.policy,
                    &task.spec.cost,
                    &task.spec.plant.state0,
                    task.spec.objective_settings(),
                ).unwrap());
                compilations += 1;
            }
            task.transition(TaskState::Optimizing).unwrap();

            // the job outcome arrives with the next event
            let job_ok = matches!(events.next(), Some(Event::JobOk | Event::EpisodeOk));
            let from = task.state();
            if job_ok {
                let params = vec![0.01 * (iterations + 1) as f64; task.policy.param_count()];
                sm.complete_optimization(&mut task, &params, None, OptStrategy::Local).unwrap();
                iterations += 1;
                prop_assert_eq!(task.policy.params(), &params[..]);
            } else {
                let params = task.policy.params().to_vec();
                sm.rollback(&mut task, checkpoint);
                prop_assert_eq!(task.policy.params(), &params[..]);
            }
            prop_assert!(legal(from, task.state(), Some(checkpoint)) || legal(TaskState::Ready, task.state(), None));
        }

        prop_assert!(compilations <= 1);
        prop_assert_eq!(task.experience.n_episodes(), episodes);
        prop_assert_eq!(task.experience.completed_iterations(), iterations);
        prop_assert_eq!(task.state().is_terminal(), iterations >= n_opt);
        if task.state().is_terminal() {
            prop_assert!(sm.plan(&task).is_err());
        }
    }

    #[test]
    fn done_rejects_every_transition(to in prop::sample::select(vec![
        TaskState::Init,
        TaskState::CollectingRandom,
        TaskState::Ready,
        TaskState::Training,
        TaskState::CompilingOptimizer,
        TaskState::Optimizing,
        TaskState::Done,
    ])) {
        prop_assert!(!TaskState::Done.can_transition_to(&to));
    }
}
