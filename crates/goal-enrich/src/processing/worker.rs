//! Worker pool pulling tasks from the scheduler

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::WorkerConfig;
use crate::error::Error;
use crate::scheduler::{RetryPolicy, Scheduler};
use crate::types::TaskRecord;

use super::handler::{HandlerRegistry, TaskContext};

/// Executes one task at a time: dispatch, timeout, then record the outcome
#[derive(Clone)]
pub struct Worker {
    scheduler: Arc<Scheduler>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// Create a standalone worker (no pool, no shutdown signal)
    pub fn new(scheduler: Arc<Scheduler>, registry: Arc<HandlerRegistry>, policy: RetryPolicy) -> Self {
        let (_tx, shutdown) = watch::channel(false);
        Self {
            scheduler,
            registry,
            policy,
            shutdown,
        }
    }

    /// Process queued tasks until the queue has nothing runnable.
    /// Returns the number of handler runs.
    pub async fn drain(&self) -> usize {
        let mut runs = 0;
        while let Some(task) = self.scheduler.next() {
            self.process(task).await;
            runs += 1;
        }
        runs
    }

    /// Run the handler for a task the scheduler just handed out
    pub async fn process(&self, task: TaskRecord) {
        let task_id = task.id;

        let Some(handler) = self.registry.get(&task.task_type).cloned() else {
            let err = Error::HandlerNotFound(task.task_type.to_string());
            tracing::error!("Task {} failed: {}", task_id, err);
            self.scheduler.fail(&task_id, &err);
            return;
        };

        tracing::info!(
            "Processing task {} ({}, attempt {}/{})",
            task_id,
            task.task_type,
            task.retry_count + 1,
            task.max_retries + 1
        );

        let limit = task.timeout();
        let start_time = Instant::now();
        let ctx = TaskContext::new(task.clone(), self.scheduler.clone());

        let result = match timeout(limit, handler.handle(&ctx)).await {
            Ok(inner_result) => inner_result,
            Err(_) => {
                tracing::error!(
                    "TIMEOUT processing task {} after {:.1}s (limit: {}s)",
                    task_id,
                    start_time.elapsed().as_secs_f64(),
                    limit.as_secs()
                );
                let err = Error::Timeout(limit);
                handler.on_timeout(&ctx, &err).await;
                Err(err)
            }
        };

        match result {
            Ok(value) => {
                self.scheduler.complete(&task_id, value);
                tracing::info!(
                    "Task {} completed in {:.1}s",
                    task_id,
                    start_time.elapsed().as_secs_f64()
                );
            }
            Err(err) if self.scheduler.is_cancelled(&task_id) => {
                tracing::info!("Task {} stopped after cancellation: {}", task_id, err);
                self.scheduler.finish_cancelled(&task_id);
            }
            Err(err) if err.is_permanent() => {
                tracing::error!("Task {} failed permanently: {}", task_id, err);
                self.scheduler.fail(&task_id, &err);
            }
            Err(err) if !task.has_retry_budget() => {
                tracing::error!(
                    "Task {} failed after {} retries: {}",
                    task_id,
                    task.retry_count,
                    err
                );
                self.scheduler.fail(&task_id, &err);
            }
            Err(err) => {
                let Some(retry_count) = self.scheduler.begin_retry(&task_id, &err) else {
                    tracing::info!("Task {} cancelled before retry: {}", task_id, err);
                    return;
                };
                let delay = self.policy.delay_for(retry_count);
                tracing::warn!(
                    "Task {} failed (retry {}/{} in {:.1}s): {}",
                    task_id,
                    retry_count + 1,
                    task.max_retries,
                    delay.as_secs_f64(),
                    err
                );
                self.backoff(delay).await;
                self.scheduler.requeue(&task_id);
            }
        }
    }

    /// Sleep before a retry; shutdown cuts the wait short
    async fn backoff(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            Ok(_) = shutdown.wait_for(|stop| *stop) => {
                tracing::debug!("Backoff interrupted by shutdown");
            }
        }
    }

    async fn run(self, worker_id: usize, poll_interval: Duration) {
        let mut shutdown = self.shutdown.clone();
        tracing::info!("Worker {} started", worker_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.scheduler.next() {
                Some(task) => self.process(task).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!("Worker {} stopped", worker_id);
    }
}

/// Fixed-size pool of workers plus the retention reaper
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the workers and the reaper on the current runtime
    pub fn spawn(
        scheduler: Arc<Scheduler>,
        registry: Arc<HandlerRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = config.resolved_worker_count();
        let poll_interval = config.poll_interval();
        let policy = RetryPolicy::from_config(config);

        tracing::info!(
            "Worker pool configured: {} workers, backoff {}ms x{} (max {}s)",
            worker_count,
            config.backoff_base_ms,
            config.backoff_multiplier,
            config.max_backoff_secs
        );

        let mut joins = Vec::with_capacity(worker_count + 1);
        for worker_id in 0..worker_count {
            let worker = Worker {
                scheduler: Arc::clone(&scheduler),
                registry: Arc::clone(&registry),
                policy: policy.clone(),
                shutdown: shutdown_rx.clone(),
            };
            joins.push(tokio::spawn(worker.run(worker_id, poll_interval)));
        }

        joins.push(tokio::spawn(reaper_loop(scheduler, shutdown_rx)));

        Self { shutdown_tx, joins }
    }

    /// Stop taking new tasks. Running handlers are not interrupted.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Request shutdown and wait for every worker to finish its current task
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!("Worker task panicked: {}", e);
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

/// Periodically drop terminal tasks past the retention window
async fn reaper_loop(scheduler: Arc<Scheduler>, mut shutdown: watch::Receiver<bool>) {
    let retention = scheduler.config().retention();
    let mut ticker = tokio::time::interval(scheduler.config().reap_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                scheduler.reap(retention);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
