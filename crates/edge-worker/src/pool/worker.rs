//! Worker task loop.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::{PoolJob, Shared};

/// Run an optional initial job, then serve the backlog and hand-offs until
/// the pool closes or this worker retires.
pub(super) async fn run(shared: Arc<Shared>, initial: Option<PoolJob>) {
    if let Some(job) = initial {
        execute(job).await;
    }

    loop {
        // Busy workers drain the backlog before going idle.
        let next = {
            let mut state = shared.lock();
            match state.backlog.pop_front() {
                Some(job) => Some(job),
                None if state.closed => {
                    state.current -= 1;
                    return;
                }
                None => {
                    state.idle += 1;
                    None
                }
            }
        };

        if let Some(job) = next {
            execute(job).await;
            continue;
        }

        shared.capacity_freed.notify_waiters();

        match wait_idle(&shared).await {
            Some(job) => execute(job).await,
            None => return,
        }
    }
}

/// Wait as an idle worker. Returns the next handed-off job, or `None` when
/// the worker has uncounted itself and must exit.
async fn wait_idle(shared: &Shared) -> Option<PoolJob> {
    let fixed_size = shared.config.is_fixed_size();

    loop {
        let notified = shared.work_ready.notified();
        tokio::pin!(notified);
        // Register before looking at the state so a hand-off made right
        // after the check still wakes this worker.
        notified.as_mut().enable();

        {
            let mut state = shared.lock();
            if let Some(job) = state.handoff.pop_front() {
                return Some(job);
            }
            if state.closed {
                state.idle -= 1;
                state.current -= 1;
                return None;
            }
        }

        if fixed_size {
            notified.await;
            continue;
        }

        if tokio::time::timeout(shared.config.keep_alive, notified).await.is_ok() {
            continue;
        }

        let mut state = shared.lock();
        if let Some(job) = state.handoff.pop_front() {
            return Some(job);
        }
        if state.closed || state.current > shared.config.min_workers {
            state.idle -= 1;
            state.current -= 1;
            tracing::debug!(current = state.current, "Idle worker retiring");
            return None;
        }
    }
}

async fn execute(job: PoolJob) {
    let job_id = job.id().to_string();

    match AssertUnwindSafe(job.run()).catch_unwind().await {
        Ok(Ok(())) => {
            tracing::debug!(job_id = %job_id, "Job completed");
        }
        Ok(Err(e)) => {
            tracing::warn!(job_id = %job_id, error = %e, "Job failed");
        }
        Err(_) => {
            tracing::error!(job_id = %job_id, "Job panicked");
        }
    }
}
