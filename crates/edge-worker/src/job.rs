//! A job wraps one received message and runs it at most once.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionDispatcher, JobContext};
use crate::error::JobError;
use crate::pool::Executable;
use crate::queue::{as_seconds, Message, QueueClient};

/// Shortest watchdog period, so tiny timeouts cannot spin.
const MIN_WATCHDOG_PERIOD: Duration = Duration::from_millis(100);

/// Job execution state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initial = 0,
    Executing = 1,
    Finished = 2,
    Error = 3,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Initial,
            1 => JobState::Executing,
            2 => JobState::Finished,
            _ => JobState::Error,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Initial => "initial",
            JobState::Executing => "executing",
            JobState::Finished => "finished",
            JobState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Per-job settings shared by every job a poller creates.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Owner of the token the queue belongs to.
    pub owner_id: String,

    /// Visibility timeout the message was received with.
    pub visibility_timeout: Duration,

    /// Extensions beyond the first before the watchdog gives up.
    pub observation_exceed_retry_count: u32,
}

/// One received message and its execution state.
pub struct Job {
    id: String,
    options: JobOptions,
    message: Message,
    queue: Arc<dyn QueueClient>,
    dispatcher: Arc<dyn ActionDispatcher>,
    state: Arc<AtomicU8>,
    extensions: Arc<AtomicU32>,
    watchdog: CancellationToken,
}

impl Job {
    /// Wrap a received message.
    pub fn new(
        message: Message,
        queue: Arc<dyn QueueClient>,
        dispatcher: Arc<dyn ActionDispatcher>,
        options: JobOptions,
    ) -> Self {
        let id = message
            .message_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            id,
            options,
            message,
            queue,
            dispatcher,
            state: Arc::new(AtomicU8::new(JobState::Initial as u8)),
            extensions: Arc::new(AtomicU32::new(0)),
            watchdog: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Visibility extensions performed so far.
    pub fn extensions(&self) -> u32 {
        self.extensions.load(Ordering::SeqCst)
    }

    /// Execute the job.
    ///
    /// Only the first call gets past the state guard. The source message is
    /// deleted before dispatch so it is not redelivered while running.
    pub async fn execute(&self) -> Result<(), JobError> {
        self.state
            .compare_exchange(
                JobState::Initial as u8,
                JobState::Executing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| JobError::AlreadyExecuting(self.id.clone()))?;

        tracing::debug!(
            job_id = %self.id,
            queue_url = %self.queue.queue_url(),
            "Executing job"
        );

        if let Err(e) = self.queue.delete_message(&self.message).await {
            self.finish(JobState::Error);
            return Err(JobError::Delete {
                job_id: self.id.clone(),
                source: e,
            });
        }

        let watchdog = self.spawn_watchdog();

        let context = JobContext {
            job_id: self.id.clone(),
            owner_id: self.options.owner_id.clone(),
            queue_url: self.queue.queue_url(),
            body: self.message.body.clone(),
        };
        let result = self.dispatcher.dispatch(&context).await;

        self.finish(if result.is_ok() {
            JobState::Finished
        } else {
            JobState::Error
        });
        if let Err(e) = watchdog.await {
            tracing::warn!(job_id = %self.id, error = %e, "Watchdog task failed");
        }

        result.map_err(|e| JobError::Dispatch {
            job_id: self.id.clone(),
            source: e,
        })
    }

    fn finish(&self, state: JobState) {
        self.state.store(state as u8, Ordering::SeqCst);
        self.watchdog.cancel();
        tracing::debug!(job_id = %self.id, state = %state, "Job finished");
    }

    fn spawn_watchdog(&self) -> tokio::task::JoinHandle<()> {
        let watchdog = Watchdog {
            job_id: self.id.clone(),
            message: self.message.clone(),
            queue: self.queue.clone(),
            timeout: self.options.visibility_timeout,
            max_extensions: self.options.observation_exceed_retry_count + 1,
            state: self.state.clone(),
            extensions: self.extensions.clone(),
            cancel: self.watchdog.clone(),
        };
        tokio::spawn(watchdog.run())
    }
}

#[async_trait]
impl Executable for Job {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.execute().await?;
        Ok(())
    }
}

/// Keeps a running job's message invisible, a bounded number of times.
struct Watchdog {
    job_id: String,
    message: Message,
    queue: Arc<dyn QueueClient>,
    timeout: Duration,
    max_extensions: u32,
    state: Arc<AtomicU8>,
    extensions: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl Watchdog {
    async fn run(self) {
        let period = (self.timeout * 3 / 4).max(MIN_WATCHDOG_PERIOD);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }

            if JobState::from_u8(self.state.load(Ordering::SeqCst)) != JobState::Executing {
                return;
            }

            let done = self.extensions.load(Ordering::SeqCst);
            if done >= self.max_extensions {
                tracing::warn!(
                    job_id = %self.job_id,
                    extensions = done,
                    "Visibility extension limit reached, message may be redelivered"
                );
                return;
            }
            self.extensions.fetch_add(1, Ordering::SeqCst);

            match self
                .queue
                .change_message_visibility(&self.message, as_seconds(self.timeout))
                .await
            {
                Ok(()) => tracing::debug!(
                    job_id = %self.job_id,
                    extension = done + 1,
                    "Extended message visibility"
                ),
                Err(e) => tracing::warn!(
                    job_id = %self.job_id,
                    error = %e,
                    "Failed to extend message visibility"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::MockActionDispatcher;
    use crate::config::PoolConfig;
    use crate::error::{DispatchError, QueueError};
    use crate::pool::{JobPool, WorkerPool};
    use crate::queue::MockQueueClient;
    use tokio::sync::{mpsc, Notify};

    struct SlowDispatcher(Duration);

    #[async_trait]
    impl ActionDispatcher for SlowDispatcher {
        async fn dispatch(&self, _job: &JobContext) -> Result<(), DispatchError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    /// Reports that dispatch started, then holds until released.
    struct HeldDispatcher {
        started: mpsc::UnboundedSender<String>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ActionDispatcher for HeldDispatcher {
        async fn dispatch(&self, job: &JobContext) -> Result<(), DispatchError> {
            let _ = self.started.send(job.job_id.clone());
            self.release.notified().await;
            Ok(())
        }
    }

    fn message() -> Message {
        Message {
            message_id: Some("msg-1".to_string()),
            receipt_handle: "receipt-1".to_string(),
            body: r#"{"action":"build"}"#.to_string(),
        }
    }

    fn options(timeout_secs: u64, retries: u32) -> JobOptions {
        JobOptions {
            owner_id: "owner-1".to_string(),
            visibility_timeout: Duration::from_secs(timeout_secs),
            observation_exceed_retry_count: retries,
        }
    }

    fn queue_expecting_delete(times: usize) -> MockQueueClient {
        let mut queue = MockQueueClient::new();
        queue
            .expect_queue_url()
            .returning(|| "https://sqs.test/queue".to_string());
        queue
            .expect_delete_message()
            .withf(|m| m.receipt_handle == "receipt-1")
            .times(times)
            .returning(|_| Ok(()));
        queue
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let mut dispatcher = MockActionDispatcher::new();
        dispatcher
            .expect_dispatch()
            .withf(|ctx| ctx.job_id == "msg-1" && ctx.owner_id == "owner-1")
            .times(1)
            .returning(|_| Ok(()));

        let job = Job::new(
            message(),
            Arc::new(queue_expecting_delete(1)),
            Arc::new(dispatcher),
            options(60, 3),
        );
        assert_eq!(job.state(), JobState::Initial);

        job.execute().await.unwrap();

        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(job.extensions(), 0);
        assert!(matches!(job.execute().await, Err(JobError::AlreadyExecuting(_))));
    }

    #[tokio::test]
    async fn test_submitted_job_runs_through_pool() {
        let pool = WorkerPool::new(PoolConfig {
            min_workers: 1,
            max_workers: 1,
            ..Default::default()
        });
        pool.start().unwrap();

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let job = Arc::new(Job::new(
            message(),
            Arc::new(queue_expecting_delete(1)),
            Arc::new(HeldDispatcher {
                started: started_tx,
                release: release.clone(),
            }),
            options(60, 3),
        ));
        assert_eq!(job.state(), JobState::Initial);

        assert!(pool.submit(job.clone()).unwrap());

        let started = tokio::time::timeout(Duration::from_secs(2), started_rx.recv())
            .await
            .expect("job was not dispatched");
        assert_eq!(started.as_deref(), Some("msg-1"));
        assert_eq!(job.state(), JobState::Executing);

        release.notify_one();
        pool.stop().await.unwrap();

        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(job.extensions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_execute_runs_once() {
        let mut dispatcher = MockActionDispatcher::new();
        dispatcher.expect_dispatch().times(1).returning(|_| Ok(()));

        let job = Arc::new(Job::new(
            message(),
            Arc::new(queue_expecting_delete(1)),
            Arc::new(dispatcher),
            options(60, 3),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let job = job.clone();
                tokio::spawn(async move { job.execute().await })
            })
            .collect();

        let mut succeeded = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(JobError::AlreadyExecuting(_)) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(succeeded, 1);
        assert_eq!(rejected, 15);
        assert_eq!(job.state(), JobState::Finished);
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_error() {
        let mut dispatcher = MockActionDispatcher::new();
        dispatcher
            .expect_dispatch()
            .times(1)
            .returning(|_| Err(DispatchError::UnknownAction("build".to_string())));

        let job = Job::new(
            message(),
            Arc::new(queue_expecting_delete(1)),
            Arc::new(dispatcher),
            options(60, 3),
        );

        let err = job.execute().await.unwrap_err();
        assert!(matches!(err, JobError::Dispatch { .. }));
        assert_eq!(job.state(), JobState::Error);
    }

    #[tokio::test]
    async fn test_delete_failure_skips_dispatch() {
        let mut queue = MockQueueClient::new();
        queue
            .expect_queue_url()
            .returning(|| "https://sqs.test/queue".to_string());
        queue
            .expect_delete_message()
            .times(1)
            .returning(|_| Err(QueueError::Transient("boom".to_string())));

        let mut dispatcher = MockActionDispatcher::new();
        dispatcher.expect_dispatch().times(0);

        let job = Job::new(message(), Arc::new(queue), Arc::new(dispatcher), options(60, 3));

        let err = job.execute().await.unwrap_err();
        assert!(matches!(err, JobError::Delete { .. }));
        assert_eq!(job.state(), JobState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_extends_a_bounded_number_of_times() {
        let retries = 2;
        let mut queue = queue_expecting_delete(1);
        queue
            .expect_change_message_visibility()
            .withf(|m, timeout| m.receipt_handle == "receipt-1" && *timeout == 10)
            .times(retries as usize + 1)
            .returning(|_, _| Ok(()));

        let job = Job::new(
            message(),
            Arc::new(queue),
            Arc::new(SlowDispatcher(Duration::from_secs(600))),
            options(10, retries),
        );

        job.execute().await.unwrap();

        assert_eq!(job.extensions(), retries + 1);
        assert_eq!(job.state(), JobState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_cancelled_when_job_finishes_early() {
        let mut queue = queue_expecting_delete(1);
        queue.expect_change_message_visibility().times(0);

        let job = Job::new(
            message(),
            Arc::new(queue),
            Arc::new(SlowDispatcher(Duration::from_secs(5))),
            options(10, 3),
        );

        job.execute().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(job.extensions(), 0);
    }

    #[tokio::test]
    async fn test_failed_extension_counts_toward_limit() {
        tokio::time::pause();
        let mut queue = queue_expecting_delete(1);
        queue
            .expect_change_message_visibility()
            .times(2)
            .returning(|_, _| Err(QueueError::Transient("throttled".to_string())));

        let job = Job::new(
            message(),
            Arc::new(queue),
            Arc::new(SlowDispatcher(Duration::from_secs(120))),
            options(4, 1),
        );

        job.execute().await.unwrap();
        assert_eq!(job.extensions(), 2);
    }

    #[test]
    fn test_job_id_falls_back_to_uuid() {
        let mut msg = message();
        msg.message_id = None;
        let job = Job::new(
            msg,
            Arc::new(MockQueueClient::new()),
            Arc::new(MockActionDispatcher::new()),
            options(60, 3),
        );
        assert!(uuid::Uuid::parse_str(job.id()).is_ok());
    }
}
