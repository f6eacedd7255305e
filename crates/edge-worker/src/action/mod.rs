//! Action dispatch: turning a job body into a command run and a posted result.

mod command;
mod dispatcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::DispatchError;

pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use dispatcher::CommandDispatcher;

/// What a dispatcher knows about the job it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: String,
    pub owner_id: String,
    pub queue_url: String,
    pub body: String,
}

/// Runs the action a job asks for.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, job: &JobContext) -> Result<(), DispatchError>;
}

/// Delivers action results.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn post_result(&self, result: &ActionResult) -> Result<(), DispatchError>;
}

/// Job body carried in a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobRequest {
    pub action: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl JobRequest {
    pub fn parse(body: &str) -> Result<Self, DispatchError> {
        let request: JobRequest =
            serde_json::from_str(body).map_err(|e| DispatchError::InvalidBody(e.to_string()))?;
        if request.action.trim().is_empty() {
            return Err(DispatchError::InvalidBody("action is empty".to_string()));
        }
        Ok(request)
    }
}

/// Git remote an action's command lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositorySource {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
}

/// How to run one named action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// Executable; relative to the checkout when `repository` is set.
    pub command: String,

    /// Arguments placed before the job's own arguments.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub repository: Option<RepositorySource>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Action name to action spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionMap {
    actions: HashMap<String, ActionSpec>,
}

impl ActionMap {
    pub fn new(actions: HashMap<String, ActionSpec>) -> Self {
        Self { actions }
    }

    /// Load a JSON action map. A missing file yields an empty map.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Action map not found, no actions available");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    /// Every distinct repository referenced by an action.
    pub fn repositories(&self) -> Vec<RepositorySource> {
        let mut sources: Vec<RepositorySource> = self
            .actions
            .values()
            .filter_map(|spec| spec.repository.clone())
            .collect();
        sources.sort_by(|a, b| a.url.cmp(&b.url));
        sources.dedup_by(|a, b| a.url == b.url);
        sources
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Result payload posted after an action runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub job_id: String,
    pub owner_id: String,
    pub action: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_request() {
        let request =
            JobRequest::parse(r#"{"action":"deploy","args":["--fast"],"env":{"A":"1"}}"#).unwrap();
        assert_eq!(request.action, "deploy");
        assert_eq!(request.args, vec!["--fast"]);
        assert_eq!(request.env.get("A").map(String::as_str), Some("1"));

        let minimal = JobRequest::parse(r#"{"action":"noop"}"#).unwrap();
        assert!(minimal.args.is_empty());
    }

    #[test]
    fn test_parse_job_request_rejects_bad_bodies() {
        assert!(matches!(JobRequest::parse("nope"), Err(DispatchError::InvalidBody(_))));
        assert!(matches!(
            JobRequest::parse(r#"{"action":"  "}"#),
            Err(DispatchError::InvalidBody(_))
        ));
    }

    #[test]
    fn test_action_map_repositories_are_distinct() {
        let map: ActionMap = serde_json::from_value(serde_json::json!({
            "build": {"command": "bin/build", "repository": {"url": "https://git.example/a.git"}},
            "test": {"command": "bin/test", "repository": {"url": "https://git.example/a.git"}},
            "lint": {"command": "bin/lint", "repository": {"url": "https://git.example/b.git", "branch": "dev"}},
            "echo": {"command": "/bin/echo", "timeoutSeconds": 5}
        }))
        .unwrap();

        assert_eq!(map.len(), 4);
        assert_eq!(map.get("echo").unwrap().timeout_seconds, Some(5));

        let repos = map.repositories();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].url, "https://git.example/a.git");
        assert_eq!(repos[1].branch.as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn test_load_missing_action_map_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = ActionMap::load(&dir.path().join("absent.json")).await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_load_action_map_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.json");
        tokio::fs::write(&path, r#"{"hello": {"command": "/bin/echo", "args": ["hi"]}}"#)
            .await
            .unwrap();

        let map = ActionMap::load(&path).await.unwrap();
        assert_eq!(map.get("hello").unwrap().args, vec!["hi"]);
    }

    #[test]
    fn test_action_result_serialization() {
        let result = ActionResult {
            job_id: "job-1".to_string(),
            owner_id: "owner-1".to_string(),
            action: "build".to_string(),
            success: true,
            exit_code: Some(0),
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            duration_ms: 12,
            finished_at: Utc::now(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["durationMs"], 12);
    }
}
