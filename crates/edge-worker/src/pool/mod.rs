//! Bounded, dynamically sized worker pool.
//!
//! Submission tries, in order: hand the job to an idle worker, spawn a new
//! worker while below `max_workers`, queue it in the bounded backlog, and
//! finally reject it with `Ok(false)` so the caller can apply backpressure.
//! Workers above `min_workers` retire after sitting idle for the keep-alive
//! duration.
//!
//! All counters live behind a single pool-wide mutex because they change
//! together (spawn + count, retire + uncount, hand-off + un-idle).

mod worker;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PoolConfig;
use crate::error::PoolError;

/// A unit of work the pool can run.
#[async_trait]
pub trait Executable: Send + Sync + 'static {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Run the work. Errors are logged by the worker and never stop the pool.
    async fn run(&self) -> anyhow::Result<()>;
}

/// Shared handle to a submitted job.
pub type PoolJob = Arc<dyn Executable>;

/// What pollers need from a pool.
pub trait JobPool: Send + Sync {
    /// Jobs the pool can start right now without queueing.
    fn capacity(&self) -> usize;

    /// Submit a job. `Ok(false)` means the pool is saturated.
    fn submit(&self, job: PoolJob) -> Result<bool, PoolError>;

    /// Signal fired whenever a worker becomes idle.
    fn capacity_signal(&self) -> Arc<Notify>;
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetrics {
    pub current: usize,
    pub idle: usize,
    pub backlog: usize,
}

#[derive(Default)]
struct PoolState {
    running: bool,

    /// Set on stop; workers exit once they find no more work.
    closed: bool,

    current: usize,

    /// Idle workers not yet claimed by a pending hand-off.
    idle: usize,

    /// Jobs handed to idle workers that have not picked them up yet.
    handoff: VecDeque<PoolJob>,

    backlog: VecDeque<PoolJob>,

    metrics_cancel: Option<CancellationToken>,
}

pub(crate) struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,

    /// Wakes idle workers for hand-offs and shutdown.
    work_ready: Notify,

    capacity_freed: Arc<Notify>,
    tracker: TaskTracker,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A poisoned lock only means a thread panicked while holding it; the
        // counters are updated in single statements, so keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn metrics(&self) -> PoolMetrics {
        let state = self.lock();
        PoolMetrics {
            current: state.current,
            idle: state.idle,
            backlog: state.backlog.len(),
        }
    }

    fn spawn_worker(self: &Arc<Self>, initial: Option<PoolJob>) {
        self.tracker.spawn(worker::run(self.clone(), initial));
    }
}

/// Worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Create a stopped pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState::default()),
                work_ready: Notify::new(),
                capacity_freed: Arc::new(Notify::new()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Spawn `min_workers` workers and the metrics reporter.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = self.shared.lock();
        if state.running {
            return Err(PoolError::AlreadyRunning);
        }

        state.running = true;
        state.closed = false;
        self.shared.tracker.reopen();

        // Workers left over from an immediate stop rejoin the pool.
        let missing = self.shared.config.min_workers.saturating_sub(state.current);
        for _ in 0..missing {
            state.current += 1;
            self.shared.spawn_worker(None);
        }

        let cancel = CancellationToken::new();
        state.metrics_cancel = Some(cancel.clone());
        tokio::spawn(report_metrics(self.shared.clone(), cancel));

        tracing::info!(
            min_workers = self.shared.config.min_workers,
            max_workers = self.shared.config.max_workers,
            backlog_size = self.shared.config.backlog_size,
            "Worker pool started"
        );

        Ok(())
    }

    /// Stop accepting work, drain the backlog and wait for every worker to exit.
    pub async fn stop(&self) -> Result<(), PoolError> {
        self.close(false)?;
        self.shared.tracker.wait().await;
        tracing::info!("Worker pool stopped");
        Ok(())
    }

    /// Stop accepting work, drop the backlog and return without waiting.
    ///
    /// Jobs already handed to a worker still run to completion.
    pub fn stop_now(&self) -> Result<(), PoolError> {
        self.close(true)
    }

    fn close(&self, abandon_backlog: bool) -> Result<(), PoolError> {
        {
            let mut state = self.shared.lock();
            if !state.running {
                return Err(PoolError::NotRunning);
            }

            state.running = false;
            state.closed = true;

            if let Some(cancel) = state.metrics_cancel.take() {
                cancel.cancel();
            }

            if abandon_backlog {
                let dropped = state.backlog.len();
                state.backlog.clear();
                tracing::warn!(dropped, "Worker pool stopping immediately, backlog abandoned");
            } else {
                tracing::info!(
                    backlog = state.backlog.len(),
                    "Worker pool stopping, draining backlog"
                );
            }
        }

        self.shared.tracker.close();
        self.shared.work_ready.notify_waiters();
        Ok(())
    }

    /// Current counters.
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.metrics()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }
}

impl JobPool for WorkerPool {
    fn capacity(&self) -> usize {
        let state = self.shared.lock();
        if !state.running {
            return 0;
        }
        state.idle + self.shared.config.max_workers.saturating_sub(state.current)
    }

    fn submit(&self, job: PoolJob) -> Result<bool, PoolError> {
        let mut state = self.shared.lock();
        if !state.running {
            return Err(PoolError::NotRunning);
        }

        if state.idle > 0 {
            state.idle -= 1;
            state.handoff.push_back(job);
            drop(state);
            self.shared.work_ready.notify_one();
            return Ok(true);
        }

        if state.current < self.shared.config.max_workers {
            state.current += 1;
            self.shared.spawn_worker(Some(job));
            return Ok(true);
        }

        if state.backlog.len() < self.shared.config.backlog_size {
            state.backlog.push_back(job);
            return Ok(true);
        }

        tracing::debug!(job_id = %job.id(), "Worker pool saturated, job rejected");
        Ok(false)
    }

    fn capacity_signal(&self) -> Arc<Notify> {
        self.shared.capacity_freed.clone()
    }
}

async fn report_metrics(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.monitor_period);
    ticker.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let metrics = shared.metrics();
                tracing::info!(
                    current = metrics.current,
                    idle = metrics.idle,
                    backlog = metrics.backlog,
                    "Worker pool metrics"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Job that waits on a gate, tracking how many run at once.
    struct GatedJob {
        id: String,
        gate: Arc<Semaphore>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Executable for GatedJob {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self) -> anyhow::Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _permit = self.gate.acquire().await?;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        gate: Arc<Semaphore>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                gate: Arc::new(Semaphore::new(0)),
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                done: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn job(&self, n: usize) -> PoolJob {
            Arc::new(GatedJob {
                id: format!("job-{}", n),
                gate: self.gate.clone(),
                running: self.running.clone(),
                peak: self.peak.clone(),
                done: self.done.clone(),
            })
        }

        fn open(&self) {
            self.gate.add_permits(1_000);
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl Executable for PanickingJob {
        fn id(&self) -> &str {
            "panics"
        }

        async fn run(&self) -> anyhow::Result<()> {
            panic!("job blew up");
        }
    }

    fn config(min: usize, max: usize, backlog: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            keep_alive: Duration::from_secs(1),
            monitor_period: Duration::from_secs(30),
            backlog_size: backlog,
        }
    }

    async fn wait_for(pool: &WorkerPool, check: impl Fn(PoolMetrics) -> bool) {
        for _ in 0..10_000 {
            if check(pool.metrics()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("pool never reached expected state: {:?}", pool.metrics());
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let pool = WorkerPool::new(config(1, 2, 1));
        let harness = Harness::new();

        assert_eq!(pool.submit(harness.job(0)), Err(PoolError::NotRunning));
        assert_eq!(pool.stop().await, Err(PoolError::NotRunning));

        pool.start().unwrap();
        assert_eq!(pool.start(), Err(PoolError::AlreadyRunning));

        pool.stop().await.unwrap();
        assert_eq!(pool.stop().await, Err(PoolError::NotRunning));
        assert_eq!(pool.stop_now(), Err(PoolError::NotRunning));
    }

    #[tokio::test]
    async fn test_start_spawns_min_workers() {
        let pool = WorkerPool::new(config(3, 5, 0));
        pool.start().unwrap();
        wait_for(&pool, |m| m.idle == 3).await;

        assert_eq!(pool.metrics().current, 3);
        assert_eq!(pool.capacity(), 5);

        pool.stop().await.unwrap();
        assert_eq!(pool.metrics().current, 0);
    }

    #[tokio::test]
    async fn test_burst_accepts_max_plus_backlog() {
        let (min, max, backlog) = (1, 2, 3);
        let pool = WorkerPool::new(config(min, max, backlog));
        let harness = Harness::new();
        pool.start().unwrap();
        wait_for(&pool, |m| m.idle == min).await;

        let results: Vec<bool> = (0..max + backlog + 1)
            .map(|n| pool.submit(harness.job(n)).unwrap())
            .collect();

        assert_eq!(results.iter().filter(|accepted| **accepted).count(), max + backlog);
        assert_eq!(results.last(), Some(&false));
        assert_eq!(pool.metrics().current, max);
        assert_eq!(pool.metrics().backlog, backlog);
        assert_eq!(pool.capacity(), 0);

        harness.open();
        pool.stop().await.unwrap();

        assert_eq!(harness.done.load(Ordering::SeqCst), max + backlog);
        assert!(harness.peak.load(Ordering::SeqCst) <= max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grows_to_max_and_shrinks_to_min() {
        let pool = WorkerPool::new(config(2, 4, 10));
        let harness = Harness::new();
        pool.start().unwrap();
        wait_for(&pool, |m| m.idle == 2).await;

        for n in 0..8 {
            assert!(pool.submit(harness.job(n)).unwrap());
        }
        wait_for(&pool, |_| harness.running.load(Ordering::SeqCst) == 4).await;
        assert_eq!(pool.metrics().current, 4);
        assert_eq!(pool.metrics().backlog, 4);

        harness.open();
        wait_for(&pool, |_| harness.done.load(Ordering::SeqCst) == 8).await;

        // Paused time auto-advances past the keep-alive.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let metrics = pool.metrics();
        assert_eq!(metrics.current, 2);
        assert_eq!(metrics.idle, 2);
        assert!(harness.peak.load(Ordering::SeqCst) <= 4);

        pool.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_size_pool_never_shrinks() {
        let pool = WorkerPool::new(config(2, 2, 0));
        pool.start().unwrap();
        wait_for(&pool, |m| m.idle == 2).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(pool.metrics().current, 2);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_break_pool() {
        let pool = WorkerPool::new(config(1, 1, 1));
        let harness = Harness::new();
        harness.open();
        pool.start().unwrap();
        wait_for(&pool, |m| m.idle == 1).await;

        assert!(pool.submit(Arc::new(PanickingJob)).unwrap());
        wait_for(&pool, |m| m.idle == 1).await;
        assert_eq!(pool.metrics().current, 1);

        assert!(pool.submit(harness.job(1)).unwrap());
        wait_for(&pool, |_| harness.done.load(Ordering::SeqCst) == 1).await;

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_now_abandons_backlog() {
        let pool = WorkerPool::new(config(1, 1, 2));
        let harness = Harness::new();
        pool.start().unwrap();
        wait_for(&pool, |m| m.idle == 1).await;

        for n in 0..3 {
            assert!(pool.submit(harness.job(n)).unwrap());
        }
        wait_for(&pool, |_| harness.running.load(Ordering::SeqCst) == 1).await;

        pool.stop_now().unwrap();
        assert_eq!(pool.metrics().backlog, 0);
        assert_eq!(pool.submit(harness.job(9)), Err(PoolError::NotRunning));

        harness.open();
        wait_for(&pool, |m| m.current == 0).await;
        assert_eq!(harness.done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_signal_fires_when_worker_idles() {
        let pool = WorkerPool::new(config(1, 1, 0));
        let harness = Harness::new();
        pool.start().unwrap();
        wait_for(&pool, |m| m.idle == 1).await;

        assert!(pool.submit(harness.job(0)).unwrap());
        let signal = pool.capacity_signal();
        let notified = signal.notified();
        harness.open();

        tokio::time::timeout(Duration::from_secs(5), notified)
            .await
            .expect("capacity signal should fire");

        pool.stop().await.unwrap();
    }
}
