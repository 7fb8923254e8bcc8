use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use db::{
    DBService,
    models::job::{CreateJob, Job},
};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::execution::ExecutionError;

/// Cap for the exponential retry backoff.
const MAX_RETRY_BACKOFF_SECS: u64 = 300;

fn retry_backoff_seconds(retry_count: i64) -> u64 {
    2_u64
        .saturating_pow(retry_count.clamp(0, 32) as u32)
        .min(MAX_RETRY_BACKOFF_SECS)
}

#[derive(Debug, Error)]
pub enum JobError {
    /// Poisoned input: fails the job immediately, burning no retry credit.
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Per-type job handler. Delivery is at-least-once; handlers must tolerate
/// redelivery by re-reading current state before mutating.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue: String,
    pub max_retry: i64,
    pub timeout: Duration,
    pub delay: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            max_retry: 3,
            timeout: Duration::from_secs(600),
            delay: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Worker concurrency per queue name; queues not listed here are not
    /// polled by this process.
    pub concurrency: HashMap<String, usize>,
    pub poll_interval: Duration,
    pub stale_check_interval: Duration,
    /// Grace added to a job's timeout before a running job counts as stale.
    pub stale_grace_seconds: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: HashMap::from([
                ("planning".to_string(), 2),
                ("implementation".to_string(), 2),
                ("monitoring".to_string(), 1),
                ("default".to_string(), 2),
            ]),
            poll_interval: Duration::from_millis(250),
            stale_check_interval: Duration::from_secs(30),
            stale_grace_seconds: 60,
        }
    }
}

/// Durable at-least-once job queue over the database, with one worker pool
/// per queue, handler timeouts, exponential retries and periodic schedules.
#[derive(Clone)]
pub struct JobQueue {
    db: DBService,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    config: QueueConfig,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(db: DBService, config: QueueConfig) -> Self {
        Self {
            db,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn register_handler(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .await
            .insert(job_type.to_string(), handler);
    }

    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let scheduled_at = match opts.delay {
            Some(delay) => Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
            None => Utc::now(),
        };
        let job = Job::create(
            &self.db.pool,
            &CreateJob {
                job_type: job_type.to_string(),
                queue: opts.queue,
                payload,
                max_retries: opts.max_retry,
                timeout_seconds: opts.timeout.as_secs() as i64,
                scheduled_at,
            },
            Uuid::new_v4(),
        )
        .await?;
        tracing::debug!("Enqueued {} job {} on queue {}", job.job_type, job.id, job.queue);
        Ok(job.id)
    }

    /// Start one worker pool per configured queue plus the stale-job reaper.
    pub fn start(&self) {
        for (queue, concurrency) in self.config.concurrency.clone() {
            self.spawn_queue_worker(queue, concurrency);
        }
        self.spawn_stale_reaper();
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Enqueue `job_type` every `interval`, skipping ticks while an earlier
    /// job of the same type is still pending.
    pub fn register_periodic(
        &self,
        job_type: &'static str,
        interval: Duration,
        opts: EnqueueOptions,
    ) {
        let queue = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match Job::has_pending(&queue.db.pool, job_type).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        if let Err(e) = queue
                            .enqueue(
                                job_type,
                                serde_json::json!({"version": 1}),
                                opts.clone(),
                            )
                            .await
                        {
                            tracing::error!("Failed to enqueue periodic {job_type}: {e}");
                        }
                    }
                    Err(e) => tracing::error!("Periodic {job_type} pending check failed: {e}"),
                }
            }
        });
    }

    fn spawn_queue_worker(&self, queue: String, concurrency: usize) {
        let db = self.db.clone();
        let handlers = self.handlers.clone();
        let poll_interval = self.config.poll_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tracing::info!("Queue worker started: {queue} (concurrency {concurrency})");
            let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }
                };
                match Job::claim_next(&db.pool, &queue).await {
                    Ok(Some(job)) => {
                        let db = db.clone();
                        let handlers = handlers.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            Self::dispatch(db, handlers, job).await;
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        tracing::error!("Failed to claim job on queue {queue}: {e}");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
            tracing::info!("Queue worker stopped: {queue}");
        });
    }

    async fn dispatch(
        db: DBService,
        handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
        job: Job,
    ) {
        let handler = handlers.read().await.get(&job.job_type).cloned();
        let Some(handler) = handler else {
            tracing::error!("No handler registered for job type {}", job.job_type);
            if let Err(e) = Job::mark_failed(&db.pool, job.id, "no handler registered").await {
                tracing::error!("Failed to mark job {} failed: {e}", job.id);
            }
            return;
        };

        let timeout = Duration::from_secs(job.timeout_seconds.max(1) as u64);
        let outcome = tokio::time::timeout(timeout, handler.handle(&job)).await;
        let update = match outcome {
            Ok(Ok(())) => Job::mark_completed(&db.pool, job.id).await,
            Ok(Err(JobError::Validation(msg))) => {
                tracing::warn!("Job {} ({}) rejected: {msg}", job.id, job.job_type);
                Job::mark_failed(&db.pool, job.id, &msg).await
            }
            Ok(Err(e)) => Self::retry_or_fail(&db, &job, &e.to_string()).await,
            Err(_) => Self::retry_or_fail(&db, &job, "handler timed out").await,
        };
        if let Err(e) = update {
            tracing::error!("Failed to record outcome for job {}: {e}", job.id);
        }
    }

    async fn retry_or_fail(db: &DBService, job: &Job, error: &str) -> Result<(), sqlx::Error> {
        if job.can_retry() {
            let backoff = retry_backoff_seconds(job.retry_count);
            tracing::warn!(
                "Job {} ({}) failed, retry {}/{} in {backoff}s: {error}",
                job.id,
                job.job_type,
                job.retry_count + 1,
                job.max_retries,
            );
            Job::reschedule(
                &db.pool,
                job.id,
                Utc::now() + chrono::Duration::seconds(backoff as i64),
                error,
            )
            .await
        } else {
            tracing::error!(
                "Job {} ({}) failed after {} retries: {error}",
                job.id,
                job.job_type,
                job.retry_count,
            );
            Job::mark_failed(&db.pool, job.id, error).await
        }
    }

    /// Requeue (or fail) running jobs whose worker died without reporting.
    fn spawn_stale_reaper(&self) {
        let db = self.db.clone();
        let interval = self.config.stale_check_interval;
        let grace = self.config.stale_grace_seconds;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let stale = match Job::find_stale_running(
                    &db.pool,
                    chrono::Duration::seconds(grace),
                )
                .await
                {
                    Ok(stale) => stale,
                    Err(e) => {
                        tracing::error!("Stale job scan failed: {e}");
                        continue;
                    }
                };
                for job in stale {
                    let outcome = if job.can_retry() {
                        Job::reschedule(&db.pool, job.id, Utc::now(), "requeued after worker stall")
                            .await
                    } else {
                        Job::mark_failed(&db.pool, job.id, "timed out without completion").await
                    };
                    if let Err(e) = outcome {
                        tracing::error!("Failed to reap stale job {}: {e}", job.id);
                    } else {
                        tracing::warn!("Reaped stale job {} ({})", job.id, job.job_type);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_then_capped() {
        assert_eq!(retry_backoff_seconds(0), 1);
        assert_eq!(retry_backoff_seconds(1), 2);
        assert_eq!(retry_backoff_seconds(3), 8);
        assert_eq!(retry_backoff_seconds(9), MAX_RETRY_BACKOFF_SECS);
        assert_eq!(retry_backoff_seconds(40), MAX_RETRY_BACKOFF_SECS);
    }
}
