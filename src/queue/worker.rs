//! Bounded pool of queue consumers.
//!
//! Each worker pulls one task at a time and runs it to completion, renewing
//! the task's lease while the handler runs. A separate scheduler loop
//! promotes due retries and requeues tasks whose lease expired. On shutdown
//! the workers stop pulling and the pool waits for whatever is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use super::{retry_delay, HandlerError, LeasedTask, Task, TaskHandler, TaskQueue};

const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// What happened to a task after one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retrying { retried: u32, delay: Duration },
    Archived { reason: String },
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    handlers: Arc<HashMap<&'static str, Arc<dyn TaskHandler>>>,
    queue_name: String,
    concurrency: usize,
    poll_wait: Duration,
    scheduler_interval: Duration,
    heartbeat_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn TaskQueue>, queue_name: &str, concurrency: usize) -> Self {
        Self {
            queue,
            handlers: Arc::new(HashMap::new()),
            queue_name: queue_name.to_string(),
            concurrency: concurrency.max(1),
            poll_wait: DEFAULT_POLL_WAIT,
            scheduler_interval: DEFAULT_SCHEDULER_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn register(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).insert(handler.kind(), handler);
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    /// Must stay well under the queue's lease duration.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Runs until `shutdown` flips to `true`, then drains in-flight tasks.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            queue = %self.queue_name,
            concurrency = self.concurrency,
            "Worker pool started"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.worker_loop(worker_id, shutdown).await });
        }

        let scheduler = self.clone();
        let scheduler_shutdown = shutdown.clone();
        workers.spawn(async move { scheduler.scheduler_loop(scheduler_shutdown).await });

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        tracing::info!(queue = %self.queue_name, "Worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        // The flag is only checked between tasks, so a leased task always
        // gets settled by the worker that took it.
        while !*shutdown.borrow() {
            match self.queue.dequeue(&self.queue_name, self.poll_wait).await {
                Ok(Some(leased)) => {
                    self.process(leased).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Failed to dequeue task");
                    tokio::time::sleep(self.poll_wait).await;
                }
            }
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    async fn scheduler_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.queue.promote_due(&self.queue_name).await {
                Ok(0) => {}
                Ok(promoted) => tracing::debug!(promoted, "Promoted scheduled retries"),
                Err(e) => tracing::error!(error = %e, "Failed to promote scheduled retries"),
            }
            match self.queue.recover_expired(&self.queue_name).await {
                Ok(0) => {}
                Ok(recovered) => {
                    tracing::warn!(recovered, "Requeued tasks with an expired lease")
                }
                Err(e) => tracing::error!(error = %e, "Failed to recover expired leases"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.scheduler_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Runs one leased task through its handler, applies the retry policy and
    /// settles the lease. A failed settlement leaves the task leased; it is
    /// delivered again once the lease runs out.
    pub async fn process(&self, leased: LeasedTask) -> TaskOutcome {
        let mut task = leased.task.clone();
        let handler = match self.handlers.get(task.kind.as_str()) {
            Some(handler) => Arc::clone(handler),
            None => {
                let reason = format!("no handler registered for {}", task.kind);
                task.last_error = Some(reason.clone());
                self.archive(&leased, &task).await;
                return TaskOutcome::Archived { reason };
            }
        };

        let error = match self.handle_with_heartbeat(handler.as_ref(), &leased).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&leased).await {
                    tracing::error!(
                        task_id = %task.id,
                        error = %e,
                        "Failed to acknowledge task, it will be redelivered"
                    );
                }
                tracing::debug!(task_id = %task.id, kind = %task.kind, "Task completed");
                return TaskOutcome::Completed;
            }
            Err(error) => error,
        };

        match error {
            HandlerError::Retryable(reason) if task.can_retry() => {
                let delay = retry_delay(task.retried);
                task.retried += 1;
                task.last_error = Some(reason.clone());

                tracing::warn!(
                    task_id = %task.id,
                    retried = task.retried,
                    max_retry = task.max_retry,
                    delay_secs = delay.as_secs(),
                    error = %reason,
                    "Task failed, scheduling retry"
                );

                if let Err(e) = self.queue.schedule_retry(&leased, &task, delay).await {
                    tracing::error!(
                        task_id = %task.id,
                        error = %e,
                        "Failed to schedule retry, it will be redelivered"
                    );
                }
                TaskOutcome::Retrying {
                    retried: task.retried,
                    delay,
                }
            }
            HandlerError::Retryable(reason) | HandlerError::Fatal(reason) => {
                tracing::error!(
                    task_id = %task.id,
                    kind = %task.kind,
                    retried = task.retried,
                    error = %reason,
                    "Task failed permanently, archiving"
                );
                task.last_error = Some(reason.clone());
                self.archive(&leased, &task).await;
                TaskOutcome::Archived { reason }
            }
        }
    }

    async fn handle_with_heartbeat(
        &self,
        handler: &dyn TaskHandler,
        leased: &LeasedTask,
    ) -> Result<(), HandlerError> {
        let handled = handler.handle(&leased.task);
        tokio::pin!(handled);

        let period = self.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires at once; the lease is fresh from dequeue.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut handled => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.extend_lease(leased).await {
                        tracing::warn!(task_id = %leased.task.id, error = %e, "Failed to extend task lease");
                    }
                }
            }
        }
    }

    async fn archive(&self, leased: &LeasedTask, task: &Task) {
        if let Err(e) = self.queue.archive(leased, task).await {
            tracing::error!(
                task_id = %task.id,
                error = %e,
                "Failed to archive task, it will be redelivered"
            );
        }
    }
}
