//! Per-task experience storage
//!
//! An append-only log of episodes plus the history of policy parameters
//! produced by optimization. Persisted as gzip-compressed bincode, one file
//! per task, written atomically.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::{MbrlError, Result};
use crate::plant::StepInfo;
use crate::task::Strategy;

const FORMAT_VERSION: u32 = 1;

/// One control step of an episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// State the action was taken in
    pub state: Vec<f64>,
    /// Applied action
    pub action: Vec<f64>,
    /// Immediate cost
    pub cost: f64,
    /// Plant info
    pub info: StepInfo,
}

/// One bounded-horizon interaction trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Episode ID
    pub id: Uuid,
    /// Control steps in order
    pub transitions: Vec<Transition>,
    /// State after the last action
    pub final_state: Vec<f64>,
    /// Parameters of the learned policy in effect, `None` for exploration
    pub policy_params: Option<Vec<f64>>,
    /// Per-step timestamps reported by the plant
    pub timestamps: Vec<Option<f64>>,
    /// Whether the plant signalled termination before the horizon
    pub terminated_early: bool,
    /// Collection time
    pub recorded_at: DateTime<Utc>,
}

impl Episode {
    /// Number of control steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Check if the episode has no steps
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Sum of immediate costs
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.transitions.iter().map(|t| t.cost).sum()
    }

    /// `(state, action, next_state)` triples in collection order
    pub fn state_transitions(&self) -> impl Iterator<Item = (&[f64], &[f64], &[f64])> + '_ {
        self.transitions.iter().enumerate().map(move |(i, t)| {
            let next = self
                .transitions
                .get(i + 1)
                .map_or(self.final_state.as_slice(), |n| n.state.as_slice());
            (t.state.as_slice(), t.action.as_slice(), next)
        })
    }
}

/// Policy parameters recorded after a successful optimization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Parameter vector
    pub params: Vec<f64>,
    /// 1-based optimization iteration
    pub iteration: usize,
    /// Strategy that produced the parameters
    pub strategy: Strategy,
    /// Time of the update
    pub recorded_at: DateTime<Utc>,
}

/// Append-only experience log for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceStore {
    task_name: String,
    episodes: Vec<Episode>,
    policy_history: Vec<PolicySnapshot>,
}

#[derive(Serialize, Deserialize)]
struct ExperienceFile {
    version: u32,
    store: ExperienceStore,
}

impl ExperienceStore {
    /// Create an empty store
    #[must_use]
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            episodes: Vec::new(),
            policy_history: Vec::new(),
        }
    }

    /// Owning task
    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Append a collected episode
    pub fn append_episode(&mut self, episode: Episode) {
        self.episodes.push(episode);
    }

    /// Record the parameters produced by an optimization pass
    pub fn append_policy_params(&mut self, params: Vec<f64>, strategy: Strategy) -> &PolicySnapshot {
        let iteration = self.policy_history.len() + 1;
        self.policy_history.push(PolicySnapshot {
            params,
            iteration,
            strategy,
            recorded_at: Utc::now(),
        });
        &self.policy_history[iteration - 1]
    }

    /// Episodes in collection order
    #[must_use]
    pub fn episodes(&self) -> &[Episode] {
        &self.episodes
    }

    /// Parameter snapshots in update order
    #[must_use]
    pub fn policy_history(&self) -> &[PolicySnapshot] {
        &self.policy_history
    }

    /// Number of collected episodes
    #[must_use]
    pub fn n_episodes(&self) -> usize {
        self.episodes.len()
    }

    /// Number of completed optimization iterations
    #[must_use]
    pub fn completed_iterations(&self) -> usize {
        self.policy_history.len()
    }

    /// Most recent optimized parameters
    #[must_use]
    pub fn latest_policy_params(&self) -> Option<&[f64]> {
        self.policy_history.last().map(|s| s.params.as_slice())
    }

    /// Total number of control steps across all episodes
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.episodes.iter().map(Episode::len).sum()
    }

    /// File used to persist a task's experience
    #[must_use]
    pub fn path_for(dir: &Path, task_name: &str) -> PathBuf {
        dir.join(format!("{task_name}.experience.gz"))
    }

    /// Encode to compressed bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let file = ExperienceFile {
            version: FORMAT_VERSION,
            store: self.clone(),
        };
        let data = bincode::serialize(&file)
            .map_err(|e| MbrlError::Persistence(format!("encoding experience: {e}")))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data)?;
        Ok(encoder.finish()?)
    }

    /// Decode from compressed bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut decoder = GzDecoder::new(bytes);
        let mut data = Vec::new();
        decoder
            .read_to_end(&mut data)
            .map_err(|e| MbrlError::Persistence(format!("decompressing experience: {e}")))?;

        let file: ExperienceFile = bincode::deserialize(&data)
            .map_err(|e| MbrlError::Persistence(format!("decoding experience: {e}")))?;
        if file.version != FORMAT_VERSION {
            return Err(MbrlError::Persistence(format!(
                "unsupported experience format version {}",
                file.version
            )));
        }
        Ok(file.store)
    }

    /// Save to `dir`, replacing any previous file atomically
    pub async fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path_for(dir, &self.task_name);
        let tmp = path.with_extension("gz.tmp");
        let bytes = self.to_bytes()?;

        fs::write(&tmp, bytes)
            .await
            .map_err(|e| MbrlError::Persistence(format!("writing {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| MbrlError::Persistence(format!("replacing {}: {e}", path.display())))?;

        tracing::debug!(
            task = %self.task_name,
            episodes = self.episodes.len(),
            path = %path.display(),
            "saved experience"
        );
        Ok(path)
    }

    /// Load a task's experience from `dir`
    pub async fn load(dir: &Path, task_name: &str) -> Result<Self> {
        let path = Self::path_for(dir, task_name);
        let bytes = fs::read(&path)
            .await
            .map_err(|e| MbrlError::Persistence(format!("reading {}: {e}", path.display())))?;
        let store = Self::from_bytes(&bytes)?;
        if store.task_name != task_name {
            return Err(MbrlError::Persistence(format!(
                "{} belongs to task `{}`",
                path.display(),
                store.task_name
            )));
        }
        tracing::info!(
            task = task_name,
            episodes = store.n_episodes(),
            iterations = store.completed_iterations(),
            "loaded experience"
        );
        Ok(store)
    }

    /// Load a task's experience, falling back to an empty store
    pub async fn load_or_empty(dir: &Path, task_name: &str) -> Self {
        match Self::load(dir, task_name).await {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(task = task_name, error = %e, "starting with empty experience");
                Self::new(task_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn episode(n: usize, params: Option<Vec<f64>>) -> Episode {
        Episode {
            id: Uuid::new_v4(),
            transitions: (0..n)
                .map(|i| Transition {
                    state: vec![i as f64, 0.5],
                    action: vec![-(i as f64)],
                    cost: 0.25,
                    info: StepInfo::at(i as f64 * 0.1),
                })
                .collect(),
            final_state: vec![n as f64, 0.5],
            policy_params: params,
            timestamps: (0..n).map(|i| Some(i as f64 * 0.1)).collect(),
            terminated_early: false,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn state_transitions_chain_to_final_state() {
        let ep = episode(3, None);
        let triples: Vec<_> = ep.state_transitions().collect();
        assert_eq!(triples.len(), 3);
        assert_eq!(triples[0].2, &[1.0, 0.5][..]);
        assert_eq!(triples[2].2, &[3.0, 0.5][..]);
        assert!((ep.total_cost() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn iterations_count_policy_updates_only() {
        let mut store = ExperienceStore::new("reach");
        store.append_episode(episode(2, None));
        store.append_episode(episode(2, Some(vec![0.1, 0.2])));
        assert_eq!(store.completed_iterations(), 0);

        let snap = store.append_policy_params(vec![0.3, 0.4], Strategy::Local);
        assert_eq!(snap.iteration, 1);
        assert_eq!(store.completed_iterations(), 1);
        assert_eq!(store.latest_policy_params(), Some(&[0.3, 0.4][..]));
        assert_eq!(store.total_steps(), 4);
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ExperienceStore::new("swingup");
        store.append_episode(episode(5, None));
        store.append_episode(episode(4, Some(vec![1.0, -1.0])));
        store.append_policy_params(vec![2.0, -2.0], Strategy::Remote);

        let path = store.save(dir.path()).await.unwrap();
        assert!(path.ends_with("swingup.experience.gz"));

        let loaded = ExperienceStore::load(dir.path(), "swingup").await.unwrap();
        assert_eq!(loaded, store);
    }

    #[tokio::test]
    async fn missing_or_corrupt_files_fall_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let empty = ExperienceStore::load_or_empty(dir.path(), "absent").await;
        assert_eq!(empty.n_episodes(), 0);

        std::fs::write(ExperienceStore::path_for(dir.path(), "broken"), b"not gzip").unwrap();
        let err = ExperienceStore::load(dir.path(), "broken").await.unwrap_err();
        assert!(matches!(err, MbrlError::Persistence(_)));
    }
}
