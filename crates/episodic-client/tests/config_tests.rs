//! Configuration loading: includes, constants, presets, validation

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use pretty_assertions::assert_eq;

use episodic_client::Config;
use episodic_core::{MbrlError, Strategy, TargetEntry};

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

const PRESETS: &str = r#"
[constants]
upright = "pi"
gain = 2.0

[presets.plants.pendulum]
kind = "pendulum"
dt = 0.05
state0 = { mean = [0, 0], std = [0.05, 0.05] }

[presets.policies.small]
max_u = ["gain"]
angle_dims = [0]

[presets.costs.upright]
kind = "saturating"
target = ["upright", 0]
weights = [1, 0.1]
width = 0.5
angle_dims = [0]
"#;

fn task(extra: &str) -> String {
    format!(
        r#"
        [tasks.swing]
        plant = "pendulum"
        policy = "small"
        cost = "upright"
        horizon_secs = 2.0
        n_opt = 5
        {extra}
        "#
    )
}

#[test]
fn included_presets_and_constants_are_available() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "presets.toml", PRESETS);
    let main = write(
        dir.path(),
        "main.toml",
        &format!("default_optimizer = \"local\"\ninclude = [\"presets.toml\"]\n{}", task("")),
    );

    let config = Config::load(&main).unwrap();
    let spec = &config.tasks["swing"];
    assert_eq!(spec.plant.kind, "pendulum");
    assert_eq!(spec.policy.max_u, vec![2.0]);
    assert_eq!(spec.cost.target, vec![TargetEntry::Value(PI), TargetEntry::Value(0.0)]);
    assert_eq!(spec.strategy(config.default_optimizer), Strategy::Local);
    assert!(config.rejected.is_empty());
}

#[test]
fn including_file_wins_on_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "presets.toml", PRESETS);
    let main = write(
        dir.path(),
        "main.toml",
        &format!(
            r#"
            default_optimizer = "local"
            include = ["presets.toml"]
            [constants]
            gain = 5.0
            {}
            "#,
            task("")
        ),
    );

    let config = Config::load(&main).unwrap();
    assert_eq!(config.tasks["swing"].policy.max_u, vec![5.0]);
}

#[test]
fn nested_includes_resolve_relative_to_each_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("shared")).unwrap();
    write(&dir.path().join("shared"), "presets.toml", PRESETS);
    write(
        &dir.path().join("shared"),
        "all.toml",
        "include = [\"presets.toml\"]\n",
    );
    let main = write(
        dir.path(),
        "main.toml",
        &format!("default_optimizer = \"local\"\ninclude = [\"shared/all.toml\"]\n{}", task("")),
    );

    assert!(Config::load(&main).unwrap().tasks.contains_key("swing"));
}

#[test]
fn include_cycle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.toml", "include = [\"b.toml\"]\n");
    write(dir.path(), "b.toml", "include = [\"a.toml\"]\n");

    let err = Config::load(&dir.path().join("a.toml")).unwrap_err();
    assert!(matches!(err, MbrlError::Config(ref m) if m.contains("include cycle")));
}

#[test]
fn unknown_preset_and_constant_reject_the_task() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "presets.toml", PRESETS);
    let main = write(
        dir.path(),
        "main.toml",
        r#"
        default_optimizer = "local"
        include = ["presets.toml"]

        [tasks.no_preset]
        plant = "quadrotor"
        policy = "small"
        cost = "upright"
        horizon_secs = 1
        n_opt = 1

        [tasks.no_constant]
        plant = "pendulum"
        policy = { max_u = ["-speed_of_light"] }
        cost = "upright"
        horizon_secs = 1
        n_opt = 1
        "#,
    );

    let config = Config::load(&main).unwrap();
    assert!(config.tasks.is_empty());
    let errors: Vec<String> = config.rejected.iter().map(|r| r.error.to_string()).collect();
    assert!(errors[0].contains("unknown plant preset `quadrotor`"));
    assert!(errors[1].contains("unknown constant `-speed_of_light`"));
}

#[test]
fn dimension_mismatch_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "presets.toml", PRESETS);
    let main = write(
        dir.path(),
        "main.toml",
        r#"
        default_optimizer = "local"
        include = ["presets.toml"]

        [tasks.swing]
        plant = "pendulum"
        policy = "small"
        cost = { kind = "quadratic", target = [0, 0, 0], weights = [1, 1, 1] }
        horizon_secs = 1
        n_opt = 1
        "#,
    );

    let config = Config::load(&main).unwrap();
    assert!(matches!(config.rejected[0].error, MbrlError::Config(ref m) if m.contains("swing")));
}

#[test]
fn free_variables_come_from_cost_params() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "presets.toml", PRESETS);
    let main = write(
        dir.path(),
        "main.toml",
        r#"
        default_optimizer = "local"
        include = ["presets.toml"]

        [tasks.track]
        plant = "pendulum"
        policy = "small"
        cost = { kind = "quadratic", target = [{ var = "goal" }, 0], weights = [1, 1], params = { goal = "upright" } }
        horizon_secs = 1
        n_opt = 1

        [tasks.unbound]
        plant = "pendulum"
        policy = "small"
        cost = { kind = "quadratic", target = [{ var = "goal" }, 0], weights = [1, 1] }
        horizon_secs = 1
        n_opt = 1
        "#,
    );

    let config = Config::load(&main).unwrap();
    let cost = &config.tasks["track"].cost;
    assert_eq!(cost.target[0], TargetEntry::Variable("goal".into()));
    assert_eq!(cost.params["goal"], PI);
    assert_eq!(config.rejected.len(), 1);
    assert_eq!(config.rejected[0].name, "unbound");
}

#[test]
fn task_filter_keeps_declaration_order_and_rejects_unknown_names() {
    let text = format!(
        "default_optimizer = \"local\"\n{PRESETS}\n{}\n{}",
        task(""),
        task("").replace("tasks.swing", "tasks.hold")
    );
    let config = Config::from_toml(&text, Path::new(".")).unwrap();

    let all: Vec<String> = config.select(&[]).unwrap().into_iter().map(|s| s.name).collect();
    assert_eq!(all, vec!["swing", "hold"]);

    let picked = config.select(&["hold".to_string()]).unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].name, "hold");

    let err = config.select(&["nope".to_string()]).unwrap_err();
    assert!(matches!(err, MbrlError::Config(_)));
}

#[test]
fn scheduler_and_global_defaults() {
    let text = format!("default_optimizer = \"local\"\ninitial_random_trials = 7\n{PRESETS}\n{}", task(""));
    let config = Config::from_toml(&text, Path::new(".")).unwrap();
    assert_eq!(config.scheduler.dequeue_timeout_secs, 5);
    assert_eq!(config.scheduler.playback_episodes, 1);
    assert_eq!(config.output_directory, PathBuf::from("output"));
    assert_eq!(config.tasks["swing"].initial_random_trials, 7);
    assert!(config.remote.is_none());
    assert!(config.backends().unwrap().has(Strategy::Local));
}

#[test]
fn shipped_configs_load() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs");

    let cartpole = Config::load(&root.join("cartpole.toml")).unwrap();
    assert!(cartpole.rejected.is_empty(), "{:?}", cartpole.rejected);
    assert_eq!(cartpole.tasks.len(), 2);
    assert_eq!(cartpole.tasks["cartpole_offset"].cost.params["x_goal"], 0.5);

    let pendulum = Config::load(&root.join("pendulum_remote.toml")).unwrap();
    assert!(pendulum.rejected.is_empty(), "{:?}", pendulum.rejected);
    assert_eq!(pendulum.default_optimizer, Strategy::Remote);
    let backends = pendulum.backends().unwrap();
    assert!(backends.has(Strategy::Remote) && backends.has(Strategy::Local));
    assert_eq!(
        pendulum.tasks["pendulum_local"].strategy(pendulum.default_optimizer),
        Strategy::Local
    );
}
