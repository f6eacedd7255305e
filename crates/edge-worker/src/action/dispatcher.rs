//! Default dispatcher: action map lookup, command run, result delivery.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{
    ActionDispatcher, ActionMap, ActionResult, ActionSpec, CommandRunner, CommandSpec, JobContext,
    JobRequest, ResultSink,
};
use crate::error::DispatchError;
use crate::repository::RepositoryRegistry;

/// Runs mapped commands and posts their results.
pub struct CommandDispatcher {
    actions: Arc<ActionMap>,
    repositories: Arc<RepositoryRegistry>,
    runner: Arc<dyn CommandRunner>,
    sink: Arc<dyn ResultSink>,
}

impl CommandDispatcher {
    pub fn new(
        actions: Arc<ActionMap>,
        repositories: Arc<RepositoryRegistry>,
        runner: Arc<dyn CommandRunner>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            actions,
            repositories,
            runner,
            sink,
        }
    }

    fn command_spec(
        &self,
        job: &JobContext,
        request: &JobRequest,
        base: &ActionSpec,
        checkout: Option<PathBuf>,
    ) -> CommandSpec {
        let program = match &checkout {
            Some(dir) => dir.join(&base.command),
            None => PathBuf::from(&base.command),
        };

        let mut args = base.args.clone();
        args.extend(request.args.iter().cloned());

        let mut env = base.env.clone();
        env.extend(request.env.clone());
        env.insert("EDGE_JOB_ID".to_string(), job.job_id.clone());
        env.insert("EDGE_OWNER_ID".to_string(), job.owner_id.clone());
        env.insert("EDGE_QUEUE_URL".to_string(), job.queue_url.clone());

        CommandSpec {
            program,
            args,
            env,
            cwd: checkout,
            timeout: base.timeout_seconds.filter(|s| *s > 0).map(Duration::from_secs),
        }
    }
}

#[async_trait]
impl ActionDispatcher for CommandDispatcher {
    async fn dispatch(&self, job: &JobContext) -> Result<(), DispatchError> {
        let request = JobRequest::parse(&job.body)?;
        let action = self
            .actions
            .get(&request.action)
            .ok_or_else(|| DispatchError::UnknownAction(request.action.clone()))?;

        tracing::info!(
            job_id = %job.job_id,
            action = %request.action,
            "Dispatching action"
        );

        let output = match &action.repository {
            Some(source) => {
                let repository = self.repositories.checkout(source).await?;
                let _guard = repository.read().await;
                let spec =
                    self.command_spec(job, &request, action, Some(repository.path().to_path_buf()));
                self.runner.run(&spec).await?
            }
            None => {
                let spec = self.command_spec(job, &request, action, None);
                self.runner.run(&spec).await?
            }
        };

        let success = output.is_success();
        let result = ActionResult {
            job_id: job.job_id.clone(),
            owner_id: job.owner_id.clone(),
            action: request.action.clone(),
            success,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration_ms,
            finished_at: Utc::now(),
        };

        tracing::info!(
            job_id = %job.job_id,
            action = %request.action,
            success,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Action finished"
        );

        self.sink.post_result(&result).await?;

        if output.timed_out {
            return Err(DispatchError::Timeout {
                action: request.action,
                seconds: action.timeout_seconds.unwrap_or_default(),
            });
        }
        if !success {
            return Err(DispatchError::ActionFailed {
                action: request.action,
                exit_code: result.exit_code,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::command::MockCommandRunner;
    use crate::action::{CommandOutput, MockResultSink, RepositorySource};
    use crate::error::RepositoryError;
    use crate::repository::MockGitBackend;
    use std::collections::HashMap;

    fn job(body: &str) -> JobContext {
        JobContext {
            job_id: "job-1".to_string(),
            owner_id: "owner-1".to_string(),
            queue_url: "https://sqs.example/q".to_string(),
            body: body.to_string(),
        }
    }

    fn actions() -> Arc<ActionMap> {
        let mut map = HashMap::new();
        map.insert(
            "echo".to_string(),
            ActionSpec {
                command: "/bin/echo".to_string(),
                args: vec!["base".to_string()],
                env: HashMap::from([("LEVEL".to_string(), "base".to_string())]),
                repository: None,
                timeout_seconds: Some(30),
            },
        );
        map.insert(
            "build".to_string(),
            ActionSpec {
                command: "bin/build.sh".to_string(),
                args: vec![],
                env: HashMap::new(),
                repository: Some(RepositorySource {
                    url: "https://git.example/tools.git".to_string(),
                    branch: Some("main".to_string()),
                }),
                timeout_seconds: None,
            },
        );
        Arc::new(ActionMap::new(map))
    }

    fn registry(dir: &std::path::Path) -> Arc<RepositoryRegistry> {
        let mut git = MockGitBackend::new();
        git.expect_clone_repo()
            .returning(|_, dest| std::fs::create_dir_all(dest).map_err(RepositoryError::from));
        Arc::new(RepositoryRegistry::new(dir, Arc::new(git)))
    }

    fn output(exit_code: Option<i32>, timed_out: bool) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: "out".to_string(),
            stderr: String::new(),
            timed_out,
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_dispatch_merges_args_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.program == PathBuf::from("/bin/echo")
                    && spec.args == vec!["base", "extra"]
                    && spec.env.get("LEVEL").map(String::as_str) == Some("job")
                    && spec.env.get("EDGE_JOB_ID").map(String::as_str) == Some("job-1")
                    && spec.timeout == Some(Duration::from_secs(30))
                    && spec.cwd.is_none()
            })
            .times(1)
            .returning(|_| Ok(output(Some(0), false)));

        let mut sink = MockResultSink::new();
        sink.expect_post_result()
            .withf(|r| r.success && r.job_id == "job-1" && r.action == "echo")
            .times(1)
            .returning(|_| Ok(()));

        let dispatcher = CommandDispatcher::new(
            actions(),
            registry(dir.path()),
            Arc::new(runner),
            Arc::new(sink),
        );

        dispatcher
            .dispatch(&job(r#"{"action":"echo","args":["extra"],"env":{"LEVEL":"job"}}"#))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_runs_from_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(move |spec| {
                let cwd = spec.cwd.clone().unwrap_or_default();
                cwd.starts_with(&root) && spec.program == cwd.join("bin/build.sh")
            })
            .times(1)
            .returning(|_| Ok(output(Some(0), false)));

        let mut sink = MockResultSink::new();
        sink.expect_post_result().times(1).returning(|_| Ok(()));

        let repositories = registry(dir.path());
        let dispatcher =
            CommandDispatcher::new(actions(), repositories.clone(), Arc::new(runner), Arc::new(sink));

        dispatcher.dispatch(&job(r#"{"action":"build"}"#)).await.unwrap();
        assert!(repositories.get("https://git.example/tools.git").await.is_some());
    }

    #[tokio::test]
    async fn test_failed_action_still_posts_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok(output(Some(3), false)));

        let mut sink = MockResultSink::new();
        sink.expect_post_result()
            .withf(|r| !r.success && r.exit_code == Some(3))
            .times(1)
            .returning(|_| Ok(()));

        let dispatcher =
            CommandDispatcher::new(actions(), registry(dir.path()), Arc::new(runner), Arc::new(sink));

        let err = dispatcher.dispatch(&job(r#"{"action":"echo"}"#)).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ActionFailed {
                exit_code: Some(3),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_timed_out_action() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok(output(None, true)));

        let mut sink = MockResultSink::new();
        sink.expect_post_result().times(1).returning(|_| Ok(()));

        let dispatcher =
            CommandDispatcher::new(actions(), registry(dir.path()), Arc::new(runner), Arc::new(sink));

        let err = dispatcher.dispatch(&job(r#"{"action":"echo"}"#)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { seconds: 30, .. }));
    }

    #[tokio::test]
    async fn test_unknown_action_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let mut sink = MockResultSink::new();
        sink.expect_post_result().never();

        let dispatcher =
            CommandDispatcher::new(actions(), registry(dir.path()), Arc::new(runner), Arc::new(sink));

        let err = dispatcher.dispatch(&job(r#"{"action":"nope"}"#)).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownAction(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| Ok(output(Some(0), false)));
        let mut sink = MockResultSink::new();
        sink.expect_post_result()
            .returning(|_| Err(DispatchError::Delivery("status 500".to_string())));

        let dispatcher =
            CommandDispatcher::new(actions(), registry(dir.path()), Arc::new(runner), Arc::new(sink));

        let err = dispatcher.dispatch(&job(r#"{"action":"echo"}"#)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Delivery(_)));
    }
}
