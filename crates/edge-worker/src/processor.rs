//! Top-level orchestration.
//!
//! The processor owns the worker pool, one poller per queue named in the
//! latest token, the token refresh loop and the repository pull loop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionDispatcher, ActionMap};
use crate::config::EdgeConfig;
use crate::error::ProcessorError;
use crate::job::JobOptions;
use crate::poller::Poller;
use crate::pool::{JobPool, WorkerPool};
use crate::queue::{QueueClient, QueueClientFactory};
use crate::repository::RepositoryRegistry;
use crate::token::{QueueProperties, Token, TokenSource};

/// A running poller and the client it polls through.
struct PollerEntry {
    poller: Arc<Poller>,
    client: Arc<dyn QueueClient>,
    properties: QueueProperties,
}

struct Shared {
    config: EdgeConfig,
    tokens: Arc<dyn TokenSource>,
    queues: Arc<dyn QueueClientFactory>,
    dispatcher: Arc<dyn ActionDispatcher>,
    actions: Arc<ActionMap>,
    repositories: Arc<RepositoryRegistry>,
    pool: WorkerPool,

    /// Raised by pollers whose credentials were rejected.
    refresh: Arc<Notify>,

    /// Held for a whole refresh cycle.
    refresh_cycle: tokio::sync::Mutex<()>,

    pollers: tokio::sync::Mutex<HashMap<String, PollerEntry>>,

    /// Last token fetched successfully.
    token: Mutex<Option<Token>>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// Edge worker orchestrator.
pub struct Processor {
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl Processor {
    pub fn new(
        config: EdgeConfig,
        tokens: Arc<dyn TokenSource>,
        queues: Arc<dyn QueueClientFactory>,
        dispatcher: Arc<dyn ActionDispatcher>,
        actions: Arc<ActionMap>,
        repositories: Arc<RepositoryRegistry>,
    ) -> Self {
        let pool = WorkerPool::new(config.pool.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                tokens,
                queues,
                dispatcher,
                actions,
                repositories,
                pool,
                refresh: Arc::new(Notify::new()),
                refresh_cycle: tokio::sync::Mutex::new(()),
                pollers: tokio::sync::Mutex::new(HashMap::new()),
                token: Mutex::new(None),
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    /// Queues currently being polled, sorted.
    pub async fn queue_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.shared.pollers.lock().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Check out repositories, start the pool, fetch the first token and
    /// spawn the background loops.
    pub async fn start(&self) -> Result<(), ProcessorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Err(ProcessorError::AlreadyRunning);
        }

        for source in self.shared.actions.repositories() {
            if let Err(e) = self.shared.repositories.checkout(&source).await {
                self.shared.repositories.remove_all().await;
                return Err(e.into());
            }
        }

        self.shared.pool.start()?;

        let first = self.shared.refresh_token().await;

        let cancel = CancellationToken::new();
        lifecycle.tasks.push(tokio::spawn(token_loop(
            self.shared.clone(),
            cancel.clone(),
            first,
        )));
        lifecycle.tasks.push(tokio::spawn(pull_loop(
            self.shared.clone(),
            cancel.clone(),
        )));
        lifecycle.cancel = Some(cancel);
        lifecycle.running = true;

        tracing::info!(
            actions = self.shared.actions.len(),
            queues = self.shared.pollers.lock().await.len(),
            "Processor started"
        );
        Ok(())
    }

    /// Stop the loops and pollers, drain the pool and delete checkouts.
    pub async fn stop(&self) -> Result<(), ProcessorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return Err(ProcessorError::NotRunning);
        }
        lifecycle.running = false;

        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        for task in lifecycle.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Processor loop failed");
            }
        }

        let entries: Vec<PollerEntry> = self
            .shared
            .pollers
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            if let Err(e) = entry.poller.stop_polling().await {
                tracing::warn!(error = %e, "Failed to stop poller");
            }
        }

        self.shared.pool.stop().await?;
        self.shared.repositories.remove_all().await;
        *self.shared.lock_token() = None;

        tracing::info!("Processor stopped");
        Ok(())
    }

    /// Fetch and apply a token now, after any cycle already in progress.
    /// Returns the delay before the next scheduled refresh.
    pub async fn refresh_now(&self) -> Duration {
        self.shared.refresh_token().await
    }
}

impl Shared {
    fn lock_token(&self) -> std::sync::MutexGuard<'_, Option<Token>> {
        self.token.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn refresh_token(&self) -> Duration {
        let _cycle = self.refresh_cycle.lock().await;
        match self.tokens.fetch_token().await {
            Ok(token) => {
                self.apply_token(&token).await;
                let next = token
                    .success_period()
                    .unwrap_or(self.config.processor.token_success_refresh);
                *self.lock_token() = Some(token);
                tracing::debug!(next_refresh_secs = next.as_secs(), "Token refreshed");
                next
            }
            Err(e) => {
                let next = self
                    .lock_token()
                    .as_ref()
                    .and_then(Token::error_period)
                    .unwrap_or(self.config.processor.token_error_refresh);
                tracing::warn!(
                    error = %e,
                    next_refresh_secs = next.as_secs(),
                    "Token refresh failed"
                );
                next
            }
        }
    }

    /// Converge the poller set onto `token`.
    async fn apply_token(&self, token: &Token) {
        let mut pollers = self.pollers.lock().await;

        let wanted: HashSet<&str> = token
            .queue_properties
            .iter()
            .map(|p| p.queue_url.as_str())
            .collect();
        let stale: Vec<String> = pollers
            .keys()
            .filter(|url| !wanted.contains(url.as_str()))
            .cloned()
            .collect();
        for url in stale {
            if let Some(entry) = pollers.remove(&url) {
                tracing::info!(queue_url = %url, "Queue no longer authorized, removing poller");
                if let Err(e) = entry.poller.stop_polling().await {
                    tracing::warn!(queue_url = %url, error = %e, "Failed to stop poller");
                }
            }
        }

        for properties in &token.queue_properties {
            match pollers.get_mut(&properties.queue_url) {
                Some(entry) => self.update_entry(entry, properties).await,
                None => {
                    if let Some(entry) = self.create_entry(&token.owner_id, properties) {
                        pollers.insert(properties.queue_url.clone(), entry);
                    }
                }
            }
        }
    }

    async fn update_entry(&self, entry: &mut PollerEntry, properties: &QueueProperties) {
        let changed = entry.properties.credentials != properties.credentials
            || entry.properties.region != properties.region
            || entry.client.is_token_expired();
        if !changed {
            entry.properties = properties.clone();
            return;
        }

        match entry.client.refresh_client(properties.clone()).await {
            Ok(()) => {
                tracing::info!(queue_url = %properties.queue_url, "Queue credentials refreshed");
                entry.properties = properties.clone();
                entry.poller.wake();
            }
            Err(e) => {
                tracing::warn!(
                    queue_url = %properties.queue_url,
                    error = %e,
                    "Failed to refresh queue client"
                );
            }
        }
    }

    fn create_entry(&self, owner_id: &str, properties: &QueueProperties) -> Option<PollerEntry> {
        let client = match self.queues.create(properties) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(
                    queue_url = %properties.queue_url,
                    error = %e,
                    "Failed to create queue client"
                );
                return None;
            }
        };

        let pool: Arc<dyn JobPool> = Arc::new(self.pool.clone());
        let poller = Arc::new(Poller::new(
            client.clone(),
            pool,
            self.dispatcher.clone(),
            self.config.poller.clone(),
            JobOptions {
                owner_id: owner_id.to_string(),
                visibility_timeout: self.config.poller.visibility_timeout,
                observation_exceed_retry_count: self.config.job.observation_exceed_retry_count,
            },
            self.refresh.clone(),
        ));
        if let Err(e) = poller.start_polling() {
            tracing::warn!(queue_url = %properties.queue_url, error = %e, "Failed to start poller");
            return None;
        }

        tracing::info!(queue_url = %properties.queue_url, "Poller added");
        Some(PollerEntry {
            poller,
            client,
            properties: properties.clone(),
        })
    }
}

async fn token_loop(shared: Arc<Shared>, cancel: CancellationToken, first: Duration) {
    let mut next = first;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.refresh.notified() => {
                tracing::info!("Out-of-cycle token refresh requested");
            }
            _ = tokio::time::sleep(next) => {}
        }
        next = shared.refresh_token().await;
    }
}

async fn pull_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.processor.repository_pull);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let failed = shared.repositories.pull_all().await;
                if failed > 0 {
                    tracing::warn!(failed, "Some repositories could not be updated");
                }
            }
        }
    }
}
