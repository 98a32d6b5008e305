//! Remote backend against a mock optimization service

use std::collections::BTreeMap;

use mockito::{Matcher, Server};
use pretty_assertions::assert_eq;

use episodic_core::{
    CostFunction, CostKind, MbrlError, OptimizerSettings, PlantParams, PolicySpec,
    StateDistribution, Strategy, TargetEntry, Task, TaskSpec, TaskState,
};
use episodic_optim::{OptimizationBackend, RemoteBackend, RemoteConfig};

fn spec() -> TaskSpec {
    TaskSpec {
        name: "swingup".into(),
        plant: PlantParams {
            kind: "pendulum".into(),
            dt: 0.1,
            state0: StateDistribution {
                mean: vec![0.0, 0.0],
                std: vec![0.1, 0.1],
            },
            max_steps: None,
            settings: BTreeMap::new(),
        },
        policy: PolicySpec {
            max_u: vec![2.0],
            angle_dims: vec![1],
            seed: 0,
        },
        cost: CostFunction {
            kind: CostKind::Saturating,
            target: vec![TargetEntry::Value(0.0), TargetEntry::Value(std::f64::consts::PI)],
            weights: vec![0.1, 1.0],
            width: 0.5,
            action_weight: 0.0,
            angle_dims: vec![1],
            params: BTreeMap::new(),
        },
        horizon_secs: 2.0,
        discount: 1.0,
        n_samples: 10,
        n_opt: 3,
        initial_random_trials: 1,
        optimizer: Some(Strategy::Remote),
        random_walk: false,
        wrap_angles: true,
        optimizer_params: OptimizerSettings::default(),
    }
}

fn training_task() -> Task {
    let mut task = Task::new(spec()).unwrap();
    task.transition(TaskState::Ready).unwrap();
    task.transition(TaskState::Training).unwrap();
    task
}

fn backend(url: String) -> RemoteBackend {
    RemoteBackend::new(&RemoteConfig {
        base_url: url,
        request_timeout_secs: 5,
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    })
    .unwrap()
}

fn params_body(task: &Task, value: f64) -> String {
    serde_json::to_string(&vec![value; task.policy.param_count()]).unwrap()
}

#[tokio::test]
async fn unknown_task_is_registered_before_optimizing() {
    let mut server = Server::new_async().await;
    let mut task = training_task();
    let before = task.policy.params().to_vec();

    let status = server
        .mock("GET", "/get_task_init_status/swingup")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let init = server
        .mock("POST", "/init_task/swingup")
        .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
        .match_body(Matcher::Regex("name=\"tspec_file\"".into()))
        .with_status(200)
        .with_body("init_task/swingup: OK")
        .expect(1)
        .create_async()
        .await;
    let optimize = server
        .mock("POST", "/optimize/swingup")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("name=\"exp_file\"".into()),
            Matcher::Regex("name=\"pol_params_file\"".into()),
        ]))
        .with_status(200)
        .with_body(params_body(&task, 0.25))
        .expect(1)
        .create_async()
        .await;

    let outcome = backend(server.url()).optimize(&mut task).await.unwrap();

    status.assert_async().await;
    init.assert_async().await;
    optimize.assert_async().await;
    assert_eq!(outcome.params, vec![0.25; task.policy.param_count()]);
    assert!(outcome.model.is_none());
    assert_eq!(outcome.report.strategy, Strategy::Remote);
    assert_eq!(outcome.report.completed_iterations, 1);
    assert_eq!(task.state(), TaskState::Optimizing);
    assert_eq!(task.policy.params(), &before[..]);
}

#[tokio::test]
async fn not_found_body_means_unregistered() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/get_task_init_status/swingup")
        .with_status(200)
        .with_body("get_task_init_status/swingup: NOT FOUND")
        .create_async()
        .await;
    server
        .mock("GET", "/get_task_init_status/known")
        .with_status(200)
        .with_body("get_task_init_status/known: READY")
        .create_async()
        .await;

    let backend = backend(server.url());
    assert!(!backend.is_registered("swingup").await.unwrap());
    assert!(backend.is_registered("known").await.unwrap());
}

#[tokio::test]
async fn registered_task_skips_registration() {
    let mut server = Server::new_async().await;
    let mut task = training_task();

    server
        .mock("GET", "/get_task_init_status/swingup")
        .with_status(200)
        .with_body("get_task_init_status/swingup: READY")
        .create_async()
        .await;
    let init = server
        .mock("POST", "/init_task/swingup")
        .expect(0)
        .create_async()
        .await;
    server
        .mock("POST", "/optimize/swingup")
        .with_status(200)
        .with_body(params_body(&task, -0.5))
        .create_async()
        .await;

    let outcome = backend(server.url()).optimize(&mut task).await.unwrap();
    init.assert_async().await;
    assert!(outcome.params.iter().all(|&p| p == -0.5));
}

#[tokio::test]
async fn malformed_response_is_not_retried_and_leaves_policy_alone() {
    let mut server = Server::new_async().await;
    let mut task = training_task();
    let before = task.policy.params().to_vec();

    server
        .mock("GET", "/get_task_init_status/swingup")
        .with_status(200)
        .with_body("get_task_init_status/swingup: READY")
        .create_async()
        .await;
    let optimize = server
        .mock("POST", "/optimize/swingup")
        .with_status(200)
        .with_body("[1.0, 2.0")
        .expect(1)
        .create_async()
        .await;

    let err = backend(server.url()).optimize(&mut task).await.unwrap_err();
    optimize.assert_async().await;
    assert!(matches!(err, MbrlError::RemoteService(ref m) if m.contains("malformed")));
    assert_eq!(task.policy.params(), &before[..]);
}

#[tokio::test]
async fn wrong_parameter_count_is_malformed() {
    let mut server = Server::new_async().await;
    let mut task = training_task();

    server
        .mock("GET", "/get_task_init_status/swingup")
        .with_status(200)
        .create_async()
        .await;
    server
        .mock("POST", "/optimize/swingup")
        .with_status(200)
        .with_body("[1.0, 2.0]")
        .create_async()
        .await;

    let err = backend(server.url()).optimize(&mut task).await.unwrap_err();
    assert!(matches!(err, MbrlError::RemoteService(ref m) if m.contains("expected")));
}

#[tokio::test]
async fn server_errors_are_retried_with_backoff() {
    let mut server = Server::new_async().await;
    let mut task = training_task();

    server
        .mock("GET", "/get_task_init_status/swingup")
        .with_status(200)
        .create_async()
        .await;
    let optimize = server
        .mock("POST", "/optimize/swingup")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let err = backend(server.url()).optimize(&mut task).await.unwrap_err();
    optimize.assert_async().await;
    assert!(matches!(err, MbrlError::RemoteService(_)));
}

#[tokio::test]
async fn client_errors_fail_without_retry() {
    let mut server = Server::new_async().await;
    let status = server
        .mock("GET", "/get_task_init_status/swingup")
        .with_status(401)
        .with_body("unauthorized")
        .expect(1)
        .create_async()
        .await;

    let err = backend(server.url()).is_registered("swingup").await.unwrap_err();
    status.assert_async().await;
    assert!(matches!(err, MbrlError::RemoteService(_)));
}
