//! Remote optimization service client
//!
//! The service keeps its own copy of each task. A task is registered once
//! with its full definition; every pass then uploads the experience and
//! current policy parameters and receives new parameters back.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use episodic_core::{MbrlError, Result, Strategy, Task, TaskSpec, TaskState};

use crate::backend::{OptimizationBackend, OptimizationOutcome, OptimizationReport};
use crate::retry::{AttemptError, RetryPolicy};

/// Connection settings of the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL, e.g. `http://optimizer:8008`
    pub base_url: String,
    /// Per-request timeout; optimization requests can be slow
    pub request_timeout_secs: u64,
    /// Retries of transient failures
    pub max_retries: u32,
    /// First retry delay
    pub initial_backoff_ms: u64,
    /// Retry delay cap
    pub max_backoff_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8008".to_string(),
            request_timeout_secs: 600,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RemoteConfig {
    /// Backoff schedule derived from these settings
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
        }
    }
}

/// Delegates optimization to the remote service over HTTP
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl RemoteBackend {
    /// Build a client for the configured service
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| MbrlError::RemoteService(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: config.retry_policy(),
        })
    }

    fn url(&self, endpoint: &str, task: &str) -> String {
        format!("{}/{endpoint}/{task}", self.base_url)
    }

    /// Send a request built by `build`, retrying transport errors and 5xx
    async fn send<F>(&self, what: &str, build: F) -> Result<Response>
    where
        F: Fn() -> Result<RequestBuilder> + Send + Sync,
    {
        let build = &build;
        self.retry
            .run(what, move || async move {
                let request = build().map_err(AttemptError::Fatal)?;
                let response = request.send().await.map_err(|e| {
                    AttemptError::Retryable(MbrlError::RemoteService(format!("{what}: {e}")))
                })?;
                if response.status().is_server_error() {
                    return Err(AttemptError::Retryable(MbrlError::RemoteService(format!(
                        "{what}: server answered {}",
                        response.status()
                    ))));
                }
                Ok(response)
            })
            .await
    }

    /// Whether the service already knows `task`
    pub async fn is_registered(&self, task: &str) -> Result<bool> {
        let url = self.url("get_task_init_status", task);
        let response = self
            .send("get_task_init_status", || Ok(self.client.get(&url)))
            .await?;
        let status = response.status();
        let body = read_body(response).await?;
        tracing::debug!(status = %status, body = %body, "task status answered");

        if status == StatusCode::NOT_FOUND
            || body.trim() == format!("get_task_init_status/{task}: NOT FOUND")
        {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(MbrlError::RemoteService(format!(
                "get_task_init_status/{task}: unexpected status {status}: {body}"
            )));
        }
        Ok(true)
    }

    /// Register `spec` with the service
    pub async fn register(&self, spec: &TaskSpec) -> Result<()> {
        let url = self.url("init_task", &spec.name);
        let tspec = serde_json::to_vec(spec)?;
        let response = self
            .send("init_task", || {
                let form = Form::new().part("tspec_file", json_part(tspec.clone(), "task_spec.json")?);
                Ok(self.client.post(&url).multipart(form))
            })
            .await?;
        let status = response.status();
        let body = read_body(response).await?;
        if !status.is_success() {
            return Err(MbrlError::RemoteService(format!(
                "init_task/{}: status {status}: {body}",
                spec.name
            )));
        }
        tracing::info!(response = %body, "task registered with remote optimizer");
        Ok(())
    }

    /// Upload experience and parameters, returning the new parameters
    pub async fn submit(&self, task: &Task) -> Result<Vec<f64>> {
        let name = task.name();
        let url = self.url("optimize", name);
        let experience = serde_json::to_vec(&task.experience)?;
        let params = serde_json::to_vec(task.policy.params())?;

        let response = self
            .send("optimize", || {
                let form = Form::new()
                    .part("exp_file", json_part(experience.clone(), "experience.json")?)
                    .part("pol_params_file", json_part(params.clone(), "policy_params.json")?);
                Ok(self.client.post(&url).multipart(form))
            })
            .await?;
        let status = response.status();
        let body = read_body(response).await?;
        if !status.is_success() {
            return Err(MbrlError::RemoteService(format!(
                "optimize/{name}: status {status}: {body}"
            )));
        }
        parse_params(&body, task.policy.param_count())
    }
}

#[async_trait]
impl OptimizationBackend for RemoteBackend {
    fn strategy(&self) -> Strategy {
        Strategy::Remote
    }

    async fn optimize(&self, task: &mut Task) -> Result<OptimizationOutcome> {
        let report = OptimizationReport::for_task(task, Strategy::Remote);

        if !self.is_registered(task.name()).await? {
            tracing::info!("task unknown to remote optimizer, registering");
            self.register(&task.spec).await?;
        }
        task.transition(TaskState::Optimizing)?;

        let params = self.submit(task).await?;
        tracing::info!(
            params = params.len(),
            completed_iterations = report.completed_iterations,
            "remote optimization finished"
        );
        Ok(OptimizationOutcome {
            params,
            model: None,
            report,
        })
    }
}

fn json_part(bytes: Vec<u8>, file_name: &'static str) -> Result<Part> {
    Part::bytes(bytes)
        .file_name(file_name)
        .mime_str("application/json")
        .map_err(|e| MbrlError::RemoteService(format!("building upload: {e}")))
}

async fn read_body(response: Response) -> Result<String> {
    response
        .text()
        .await
        .map_err(|e| MbrlError::RemoteService(format!("reading response body: {e}")))
}

/// Parse the parameter vector returned by `/optimize`
fn parse_params(body: &str, expected: usize) -> Result<Vec<f64>> {
    let params: Vec<f64> = serde_json::from_str(body).map_err(|e| {
        MbrlError::RemoteService(format!("malformed response from optimize: {e}"))
    })?;
    if params.len() != expected {
        return Err(MbrlError::RemoteService(format!(
            "malformed response from optimize: expected {expected} parameters, got {}",
            params.len()
        )));
    }
    if params.iter().any(|p| !p.is_finite()) {
        return Err(MbrlError::RemoteService(
            "malformed response from optimize: non-finite parameter".into(),
        ));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_vectors_are_validated() {
        assert_eq!(parse_params("[0.5, -1.0]", 2).unwrap(), vec![0.5, -1.0]);
        assert!(parse_params("[0.5]", 2).is_err());
        assert!(parse_params("{\"params\": []}", 0).is_err());
        assert!(parse_params("not json", 1).is_err());
    }

    #[test]
    fn urls_ignore_trailing_slash() {
        let backend = RemoteBackend::new(&RemoteConfig {
            base_url: "http://optimizer:8008/".into(),
            ..RemoteConfig::default()
        })
        .unwrap();
        assert_eq!(
            backend.url("optimize", "swingup"),
            "http://optimizer:8008/optimize/swingup"
        );
    }

    #[test]
    fn backoff_cap_is_never_below_initial_delay() {
        let config = RemoteConfig {
            initial_backoff_ms: 2_000,
            max_backoff_ms: 100,
            ..RemoteConfig::default()
        };
        assert_eq!(config.retry_policy().delay(0), Duration::from_millis(2_000));
    }
}
