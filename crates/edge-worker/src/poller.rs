//! Per-queue polling loop.
//!
//! A poller asks the pool how much work it can take, receives at most that
//! many messages and submits each one as a [`Job`]. Messages the pool does
//! not take are released with a zero visibility timeout so they can be
//! redelivered right away.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::action::ActionDispatcher;
use crate::config::PollerConfig;
use crate::error::PollerError;
use crate::job::{Job, JobOptions};
use crate::pool::JobPool;
use crate::queue::{as_seconds, Message, QueueClient};

/// Poller lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Initial = 0,
    Polling = 1,
    Waiting = 2,
    Finished = 3,
}

impl PollerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PollerState::Initial,
            1 => PollerState::Polling,
            2 => PollerState::Waiting,
            _ => PollerState::Finished,
        }
    }
}

/// Pulls messages from one queue into the shared pool.
pub struct Poller {
    queue: Arc<dyn QueueClient>,
    pool: Arc<dyn JobPool>,
    dispatcher: Arc<dyn ActionDispatcher>,
    config: PollerConfig,
    job_options: JobOptions,

    /// Raised when the queue rejects our credentials.
    refresh: Arc<Notify>,

    state: AtomicU8,
    quit: CancellationToken,
    wake: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        pool: Arc<dyn JobPool>,
        dispatcher: Arc<dyn ActionDispatcher>,
        config: PollerConfig,
        job_options: JobOptions,
        refresh: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            pool,
            dispatcher,
            config,
            job_options,
            refresh,
            state: AtomicU8::new(PollerState::Initial as u8),
            quit: CancellationToken::new(),
            wake: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PollerState {
        PollerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn queue_url(&self) -> String {
        self.queue.queue_url()
    }

    /// Spawn the polling loop. Only valid once, from `Initial`.
    pub fn start_polling(self: &Arc<Self>) -> Result<(), PollerError> {
        self.state
            .compare_exchange(
                PollerState::Initial as u8,
                PollerState::Polling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| PollerError::AlreadyRunning(self.queue_url()))?;

        tracing::info!(queue_url = %self.queue_url(), "Poller started");
        let handle = tokio::spawn(self.clone().run());
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop_polling(&self) -> Result<(), PollerError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match PollerState::from_u8(current) {
                PollerState::Polling | PollerState::Waiting => {}
                _ => return Err(PollerError::NotRunning(self.queue_url())),
            }
            match self.state.compare_exchange(
                current,
                PollerState::Finished as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.quit.cancel();
        self.wake.notify_waiters();

        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(queue_url = %self.queue_url(), error = %e, "Poller task failed");
            }
        }

        tracing::info!(queue_url = %self.queue_url(), "Poller stopped");
        Ok(())
    }

    /// Cut the current wait short. No-op once finished.
    pub fn wake(&self) {
        if self.state() != PollerState::Finished {
            self.wake.notify_one();
        }
    }

    /// Move between `Polling` and `Waiting` without leaving `Finished`.
    fn transition(&self, from: PollerState, to: PollerState) {
        let _ = self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    async fn run(self: Arc<Self>) {
        let capacity_freed = self.pool.capacity_signal();

        while !self.quit.is_cancelled() {
            // Register before checking capacity so a worker going idle
            // during the pass still ends the wait.
            let freed = capacity_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.poll_once().await {
                continue;
            }

            self.transition(PollerState::Polling, PollerState::Waiting);
            tokio::select! {
                biased;
                _ = self.quit.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = &mut freed => {}
                _ = tokio::time::sleep(self.config.wait_interval) => {}
            }
            self.transition(PollerState::Waiting, PollerState::Polling);
        }

        tracing::debug!(queue_url = %self.queue_url(), "Poll loop exited");
    }

    /// One receive-and-submit pass. Returns true when every received
    /// message was submitted, meaning the next pass should start at once.
    async fn poll_once(&self) -> bool {
        // A job's delete or visibility extension may have flagged expiry.
        if self.queue.is_token_expired() {
            self.refresh.notify_one();
        }

        let capacity = self.pool.capacity();
        if capacity == 0 {
            return false;
        }

        let max_messages = self.config.max_messages.min(capacity);
        let receive = self.queue.receive_messages(
            i32::try_from(max_messages).unwrap_or(i32::MAX),
            as_seconds(self.config.visibility_timeout),
        );
        let received = tokio::select! {
            _ = self.quit.cancelled() => return false,
            received = receive => received,
        };

        let messages = match received {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(queue_url = %self.queue_url(), error = %e, "Receive failed");
                if e.is_credential_expired() {
                    self.refresh.notify_one();
                }
                return false;
            }
        };

        if messages.is_empty() {
            return false;
        }

        tracing::debug!(
            queue_url = %self.queue_url(),
            count = messages.len(),
            capacity,
            "Received messages"
        );

        let mut remaining = messages.into_iter();
        while let Some(message) = remaining.next() {
            let job = Arc::new(Job::new(
                message.clone(),
                self.queue.clone(),
                self.dispatcher.clone(),
                self.job_options.clone(),
            ));

            match self.pool.submit(job) {
                Ok(true) => {}
                Ok(false) => {
                    self.release(&message).await;
                }
                Err(e) => {
                    tracing::warn!(queue_url = %self.queue_url(), error = %e, "Submit failed, releasing batch");
                    self.release(&message).await;
                    for rest in remaining {
                        self.release(&rest).await;
                    }
                    return false;
                }
            }
        }

        true
    }

    /// Make a message visible again right away.
    async fn release(&self, message: &Message) {
        if let Err(e) = self.queue.change_message_visibility(message, 0).await {
            tracing::warn!(
                queue_url = %self.queue_url(),
                receipt_handle = %message.receipt_handle,
                error = %e,
                "Failed to release message"
            );
        }
    }
}
