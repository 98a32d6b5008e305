//! Experiment configuration
//!
//! A TOML document describes the tasks to run. Documents may pull
//! constants and presets from other files through `include`; numeric
//! entries may name a constant instead of spelling out a literal.
//!
//! ```toml
//! output_directory = "runs/cartpole"
//! default_optimizer = "local"
//! include = ["presets.toml"]
//!
//! [constants]
//! upright = "pi"
//!
//! [tasks.balance]
//! plant = "cartpole"
//! policy = { max_u = [10] }
//! cost = { kind = "saturating", target = [0, 0, "upright", 0], weights = [1, 0, 1, 0], width = 0.25 }
//! horizon_secs = 4.0
//! n_opt = 10
//! ```

use std::collections::BTreeMap;
use std::f64::consts::{PI, TAU};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;

use episodic_core::{
    CostFunction, CostKind, MbrlError, OptimizerSettings, PlantParams, PolicySpec, Result,
    StateDistribution, Strategy, TargetEntry, TaskSpec,
};
use episodic_optim::{Backends, LocalBackend, RemoteBackend, RemoteConfig};
use episodic_plant::PlantRegistry;

use crate::scheduler::SchedulerConfig;

const DEFAULT_INITIAL_RANDOM_TRIALS: usize = 4;
const DEFAULT_DISCOUNT: f64 = 1.0;
const DEFAULT_N_SAMPLES: usize = 100;

/// A number, or the name of a constant with an optional leading `-`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Num {
    Literal(f64),
    Named(String),
}

/// Either the name of a preset or an inline table
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PresetOr<T> {
    Preset(String),
    Inline(T),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTarget {
    Num(Num),
    Variable { var: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStateDistribution {
    mean: Vec<Num>,
    std: Vec<Num>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlant {
    kind: String,
    dt: Num,
    state0: RawStateDistribution,
    #[serde(default)]
    max_steps: Option<usize>,
    #[serde(default)]
    settings: BTreeMap<String, Num>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
    max_u: Vec<Num>,
    #[serde(default)]
    angle_dims: Vec<usize>,
    #[serde(default)]
    seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCost {
    kind: CostKind,
    target: Vec<RawTarget>,
    weights: Vec<Num>,
    #[serde(default)]
    width: Option<Num>,
    #[serde(default)]
    action_weight: Option<Num>,
    #[serde(default)]
    angle_dims: Vec<usize>,
    #[serde(default)]
    params: BTreeMap<String, Num>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    plant: PresetOr<RawPlant>,
    policy: PresetOr<RawPolicy>,
    cost: PresetOr<RawCost>,
    horizon_secs: Num,
    #[serde(default)]
    discount: Option<Num>,
    #[serde(default)]
    n_opt: Option<usize>,
    #[serde(default)]
    initial_random_trials: Option<usize>,
    #[serde(default)]
    n_samples: Option<usize>,
    #[serde(default)]
    optimizer: Option<Strategy>,
    #[serde(default)]
    random_walk: bool,
    #[serde(default)]
    wrap_angles: bool,
    #[serde(default)]
    optimizer_params: OptimizerSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPresets {
    #[serde(default)]
    plants: IndexMap<String, RawPlant>,
    #[serde(default)]
    policies: IndexMap<String, RawPolicy>,
    #[serde(default)]
    costs: IndexMap<String, RawCost>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    include: Vec<PathBuf>,
    #[serde(default)]
    output_directory: Option<PathBuf>,
    #[serde(default)]
    initial_random_trials: Option<usize>,
    #[serde(default)]
    default_optimizer: Option<Strategy>,
    #[serde(default)]
    constants: IndexMap<String, Num>,
    #[serde(default)]
    presets: RawPresets,
    #[serde(default)]
    remote: Option<RemoteConfig>,
    #[serde(default)]
    scheduler: Option<SchedulerConfig>,
    #[serde(default)]
    tasks: IndexMap<String, RawTask>,
}

impl RawDocument {
    /// Take constants and presets from an included document; entries
    /// already present here win
    fn absorb(&mut self, included: RawDocument) {
        fn merge<V>(own: &mut IndexMap<String, V>, theirs: IndexMap<String, V>) {
            let mine = std::mem::take(own);
            *own = theirs;
            own.extend(mine);
        }
        merge(&mut self.constants, included.constants);
        merge(&mut self.presets.plants, included.presets.plants);
        merge(&mut self.presets.policies, included.presets.policies);
        merge(&mut self.presets.costs, included.presets.costs);
    }
}

/// Resolved named numbers
#[derive(Debug, Clone)]
struct Constants {
    values: IndexMap<String, f64>,
}

impl Constants {
    fn builtin() -> Self {
        let mut values = IndexMap::new();
        values.insert("pi".to_string(), PI);
        values.insert("tau".to_string(), TAU);
        Self { values }
    }

    /// Resolve constants in declaration order; a constant may only refer to
    /// built-ins or to constants declared before it
    fn resolve_all(raw: &IndexMap<String, Num>) -> Result<Self> {
        let mut constants = Self::builtin();
        for (name, value) in raw {
            let resolved = constants.resolve(value, &format!("constant `{name}`"))?;
            constants.values.insert(name.clone(), resolved);
        }
        Ok(constants)
    }

    fn resolve(&self, value: &Num, context: &str) -> Result<f64> {
        match value {
            Num::Literal(v) => Ok(*v),
            Num::Named(name) => {
                let trimmed = name.trim();
                let (sign, key) = match trimmed.strip_prefix('-') {
                    Some(rest) => (-1.0, rest.trim()),
                    None => (1.0, trimmed),
                };
                self.values.get(key).map(|v| sign * v).ok_or_else(|| {
                    MbrlError::Config(format!("{context}: unknown constant `{name}`"))
                })
            }
        }
    }

    fn resolve_vec(&self, values: &[Num], context: &str) -> Result<Vec<f64>> {
        values.iter().map(|v| self.resolve(v, context)).collect()
    }

    fn resolve_map(&self, values: &BTreeMap<String, Num>, context: &str) -> Result<BTreeMap<String, f64>> {
        values
            .iter()
            .map(|(k, v)| -> Result<(String, f64)> {
                Ok((k.clone(), self.resolve(v, &format!("{context}.{k}"))?))
            })
            .collect()
    }
}

/// A task left out of the run because its entry is invalid
#[derive(Debug)]
pub struct RejectedTask {
    /// Task name
    pub name: String,
    /// Why it was rejected
    pub error: MbrlError,
}

/// Validated experiment configuration
#[derive(Debug)]
pub struct Config {
    /// Where experience files are written
    pub output_directory: PathBuf,
    /// Strategy for tasks without an override
    pub default_optimizer: Strategy,
    /// Remote optimization service, if configured
    pub remote: Option<RemoteConfig>,
    /// Scheduler settings
    pub scheduler: SchedulerConfig,
    /// Valid tasks in declaration order
    pub tasks: IndexMap<String, TaskSpec>,
    /// Invalid task entries
    pub rejected: Vec<RejectedTask>,
}

impl Config {
    /// Load a configuration file and everything it includes.
    ///
    /// Document-level problems (unreadable file, parse error, include
    /// cycle, bad constant) fail the whole load. Invalid task entries are
    /// collected in [`Config::rejected`].
    pub fn load(path: &Path) -> Result<Self> {
        let mut stack = Vec::new();
        let raw = load_document(path, &mut stack)?;
        Self::from_raw(raw)
    }

    /// Parse a configuration from a string; includes are resolved against
    /// `base_dir`
    pub fn from_toml(text: &str, base_dir: &Path) -> Result<Self> {
        let mut raw: RawDocument = toml::from_str(text)
            .map_err(|e| MbrlError::Config(format!("parsing configuration: {e}")))?;
        let mut stack = Vec::new();
        resolve_includes(&mut raw, base_dir, &mut stack)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDocument) -> Result<Self> {
        let constants = Constants::resolve_all(&raw.constants)?;
        let default_optimizer = raw.default_optimizer.unwrap_or(Strategy::Remote);
        let global_trials = raw.initial_random_trials.unwrap_or(DEFAULT_INITIAL_RANDOM_TRIALS);

        let resolver = Resolver {
            constants: &constants,
            presets: &raw.presets,
            global_trials,
        };

        let plants = PlantRegistry::with_builtin();
        let mut tasks = IndexMap::new();
        let mut rejected = Vec::new();
        for (name, entry) in &raw.tasks {
            let spec = resolver.task(name, entry).and_then(|spec| {
                if spec.strategy(default_optimizer) == Strategy::Remote && raw.remote.is_none() {
                    return Err(MbrlError::Config(format!(
                        "task `{name}` uses the remote optimizer but there is no [remote] section"
                    )));
                }
                plants
                    .validate(&spec.plant, spec.policy.max_u.len())
                    .map_err(|e| MbrlError::Config(format!("task `{name}`: {e}")))?;
                Ok(spec)
            });
            match spec {
                Ok(spec) => {
                    tasks.insert(name.clone(), spec);
                }
                Err(error) => {
                    tracing::error!(task = %name, error = %error, "rejecting task");
                    rejected.push(RejectedTask {
                        name: name.clone(),
                        error,
                    });
                }
            }
        }

        Ok(Self {
            output_directory: raw.output_directory.unwrap_or_else(|| PathBuf::from("output")),
            default_optimizer,
            remote: raw.remote,
            scheduler: raw.scheduler.unwrap_or_default(),
            tasks,
            rejected,
        })
    }

    /// Task specs to run, in declaration order.
    ///
    /// An empty filter selects every valid task. Naming a task that does
    /// not exist is an error; naming a rejected one only skips it.
    pub fn select(&self, names: &[String]) -> Result<Vec<TaskSpec>> {
        if names.is_empty() {
            return Ok(self.tasks.values().cloned().collect());
        }
        for name in names {
            let known = self.tasks.contains_key(name) || self.rejected.iter().any(|r| &r.name == name);
            if !known {
                return Err(MbrlError::Config(format!("unknown task `{name}`")));
            }
        }
        Ok(self
            .tasks
            .values()
            .filter(|spec| names.contains(&spec.name))
            .cloned()
            .collect())
    }

    /// Backends for this configuration: local always, remote when a
    /// `[remote]` section exists
    pub fn backends(&self) -> Result<Backends> {
        let mut backends = Backends::new(self.default_optimizer).with(Arc::new(LocalBackend::new()));
        if let Some(remote) = &self.remote {
            backends = backends.with(Arc::new(RemoteBackend::new(remote)?));
        }
        Ok(backends)
    }
}

fn load_document(path: &Path, stack: &mut Vec<PathBuf>) -> Result<RawDocument> {
    let canonical = path
        .canonicalize()
        .map_err(|e| MbrlError::Config(format!("reading {}: {e}", path.display())))?;
    if stack.contains(&canonical) {
        let chain: Vec<String> = stack
            .iter()
            .chain(std::iter::once(&canonical))
            .map(|p| p.display().to_string())
            .collect();
        return Err(MbrlError::Config(format!("include cycle: {}", chain.join(" -> "))));
    }

    let text = std::fs::read_to_string(&canonical)
        .map_err(|e| MbrlError::Config(format!("reading {}: {e}", canonical.display())))?;
    let mut raw: RawDocument = toml::from_str(&text)
        .map_err(|e| MbrlError::Config(format!("parsing {}: {e}", canonical.display())))?;

    let base_dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    stack.push(canonical);
    resolve_includes(&mut raw, &base_dir, stack)?;
    stack.pop();
    Ok(raw)
}

fn resolve_includes(raw: &mut RawDocument, base_dir: &Path, stack: &mut Vec<PathBuf>) -> Result<()> {
    for include in std::mem::take(&mut raw.include) {
        let path = base_dir.join(&include);
        let included = load_document(&path, stack)?;
        if !included.tasks.is_empty() {
            tracing::warn!(file = %path.display(), "tasks in included files are ignored");
        }
        raw.absorb(included);
    }
    Ok(())
}

struct Resolver<'a> {
    constants: &'a Constants,
    presets: &'a RawPresets,
    global_trials: usize,
}

impl Resolver<'_> {
    fn pick<'b, T>(&self, entry: &'b PresetOr<T>, presets: &'b IndexMap<String, T>, what: &str) -> Result<&'b T> {
        match entry {
            PresetOr::Inline(value) => Ok(value),
            PresetOr::Preset(name) => presets
                .get(name)
                .ok_or_else(|| MbrlError::Config(format!("unknown {what} preset `{name}`"))),
        }
    }

    fn plant(&self, raw: &RawPlant) -> Result<PlantParams> {
        let c = self.constants;
        Ok(PlantParams {
            kind: raw.kind.clone(),
            dt: c.resolve(&raw.dt, "plant.dt")?,
            state0: StateDistribution {
                mean: c.resolve_vec(&raw.state0.mean, "plant.state0.mean")?,
                std: c.resolve_vec(&raw.state0.std, "plant.state0.std")?,
            },
            max_steps: raw.max_steps,
            settings: c.resolve_map(&raw.settings, "plant.settings")?,
        })
    }

    fn policy(&self, raw: &RawPolicy) -> Result<PolicySpec> {
        Ok(PolicySpec {
            max_u: self.constants.resolve_vec(&raw.max_u, "policy.max_u")?,
            angle_dims: raw.angle_dims.clone(),
            seed: raw.seed,
        })
    }

    fn cost(&self, raw: &RawCost) -> Result<CostFunction> {
        let c = self.constants;
        let target = raw
            .target
            .iter()
            .map(|entry| match entry {
                RawTarget::Num(n) => c.resolve(n, "cost.target").map(TargetEntry::Value),
                RawTarget::Variable { var } => Ok(TargetEntry::Variable(var.clone())),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CostFunction {
            kind: raw.kind,
            target,
            weights: c.resolve_vec(&raw.weights, "cost.weights")?,
            width: raw.width.as_ref().map_or(Ok(1.0), |w| c.resolve(w, "cost.width"))?,
            action_weight: raw
                .action_weight
                .as_ref()
                .map_or(Ok(0.0), |w| c.resolve(w, "cost.action_weight"))?,
            angle_dims: raw.angle_dims.clone(),
            params: c.resolve_map(&raw.params, "cost.params")?,
        })
    }

    fn task(&self, name: &str, raw: &RawTask) -> Result<TaskSpec> {
        let in_task = |e: MbrlError| match e {
            MbrlError::Config(msg) if !msg.starts_with("task `") => {
                MbrlError::Config(format!("task `{name}`: {msg}"))
            }
            other => other,
        };

        let plant = self
            .pick(&raw.plant, &self.presets.plants, "plant")
            .and_then(|p| self.plant(p))
            .map_err(in_task)?;
        let policy = self
            .pick(&raw.policy, &self.presets.policies, "policy")
            .and_then(|p| self.policy(p))
            .map_err(in_task)?;
        let cost = self
            .pick(&raw.cost, &self.presets.costs, "cost")
            .and_then(|c| self.cost(c))
            .map_err(in_task)?;
        let n_opt = raw
            .n_opt
            .ok_or_else(|| MbrlError::Config(format!("task `{name}`: n_opt is required")))?;

        let spec = TaskSpec {
            name: name.to_string(),
            plant,
            policy,
            cost,
            horizon_secs: self
                .constants
                .resolve(&raw.horizon_secs, "horizon_secs")
                .map_err(in_task)?,
            discount: raw
                .discount
                .as_ref()
                .map_or(Ok(DEFAULT_DISCOUNT), |d| self.constants.resolve(d, "discount"))
                .map_err(in_task)?,
            n_samples: raw.n_samples.unwrap_or(DEFAULT_N_SAMPLES),
            n_opt,
            initial_random_trials: raw.initial_random_trials.unwrap_or(self.global_trials),
            optimizer: raw.optimizer,
            random_walk: raw.random_walk,
            wrap_angles: raw.wrap_angles,
            optimizer_params: raw.optimizer_params.clone(),
        };
        spec.validate().map_err(|e| match e {
            MbrlError::Config(_) => in_task(e),
            other => MbrlError::Config(format!("task `{name}`: {other}")),
        })?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLANT: &str = r#"
        [presets.plants.pendulum]
        kind = "pendulum"
        dt = 0.1
        state0 = { mean = [0, 0], std = [0.1, 0.1] }
    "#;

    fn parse(body: &str) -> Config {
        Config::from_toml(&format!("{body}\n{PLANT}"), Path::new(".")).unwrap()
    }

    #[test]
    fn negated_constants_resolve() {
        let config = parse(
            r#"
            default_optimizer = "local"
            [constants]
            half = 0.5
            [tasks.swing]
            plant = "pendulum"
            policy = { max_u = ["half"] }
            cost = { kind = "quadratic", target = ["-pi", 0], weights = [1, "tau"] }
            horizon_secs = 1
            n_opt = 2
            "#,
        );
        let spec = &config.tasks["swing"];
        assert_eq!(spec.policy.max_u, vec![0.5]);
        assert_eq!(spec.cost.target[0], TargetEntry::Value(-PI));
        assert_eq!(spec.cost.weights, vec![1.0, TAU]);
        assert_eq!(spec.initial_random_trials, DEFAULT_INITIAL_RANDOM_TRIALS);
        assert_eq!(spec.n_samples, DEFAULT_N_SAMPLES);
    }

    #[test]
    fn missing_n_opt_rejects_only_that_task() {
        let config = parse(
            r#"
            default_optimizer = "local"
            [tasks.good]
            plant = "pendulum"
            policy = { max_u = [1] }
            cost = { kind = "quadratic", target = [0, 0], weights = [1, 1] }
            horizon_secs = 1
            n_opt = 1
            [tasks.bad]
            plant = "pendulum"
            policy = { max_u = [1] }
            cost = { kind = "quadratic", target = [0, 0], weights = [1, 1] }
            horizon_secs = 1
            "#,
        );
        assert_eq!(config.tasks.keys().collect::<Vec<_>>(), vec!["good"]);
        assert_eq!(config.rejected.len(), 1);
        assert!(config.rejected[0].error.to_string().contains("n_opt"));
    }

    #[test]
    fn remote_default_requires_remote_section() {
        let config = parse(
            r#"
            [tasks.swing]
            plant = "pendulum"
            policy = { max_u = [1] }
            cost = { kind = "quadratic", target = [0, 0], weights = [1, 1] }
            horizon_secs = 1
            n_opt = 1
            "#,
        );
        assert!(config.tasks.is_empty());
        assert!(config.rejected[0].error.to_string().contains("[remote]"));
    }

    #[test]
    fn plants_that_cannot_be_built_reject_their_task() {
        let config = parse(
            r#"
            default_optimizer = "local"
            [tasks.good]
            plant = "pendulum"
            policy = { max_u = [1] }
            cost = { kind = "quadratic", target = [0, 0], weights = [1, 1] }
            horizon_secs = 1
            n_opt = 1
            [tasks.typo]
            plant = { kind = "pendulm", dt = 0.1, state0 = { mean = [0, 0], std = [0, 0] } }
            policy = { max_u = [1] }
            cost = { kind = "quadratic", target = [0, 0], weights = [1, 1] }
            horizon_secs = 1
            n_opt = 1
            [tasks.narrow]
            plant = { kind = "cartpole", dt = 0.1, state0 = { mean = [0, 0], std = [0, 0] } }
            policy = { max_u = [1] }
            cost = { kind = "quadratic", target = [0, 0], weights = [1, 1] }
            horizon_secs = 1
            n_opt = 1
            [tasks.two_hands]
            plant = "pendulum"
            policy = { max_u = [1, 1] }
            cost = { kind = "quadratic", target = [0, 0], weights = [1, 1] }
            horizon_secs = 1
            n_opt = 1
            "#,
        );
        assert_eq!(config.tasks.keys().collect::<Vec<_>>(), vec!["good"]);
        let errors: Vec<(String, String)> = config
            .rejected
            .iter()
            .map(|r| (r.name.clone(), r.error.to_string()))
            .collect();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].0 == "typo" && errors[0].1.contains("unknown plant kind `pendulm`"));
        assert!(errors[1].0 == "narrow" && errors[1].1.contains("4 state dimensions"));
        assert!(errors[2].0 == "two_hands" && errors[2].1.contains("takes 1 actions"));
    }

    #[test]
    fn unparseable_document_is_fatal() {
        let err = Config::from_toml("tasks = [", Path::new(".")).unwrap_err();
        assert!(matches!(err, MbrlError::Config(_)));
    }
}
