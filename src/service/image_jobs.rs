use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::agent::ImageGenerator;
use crate::db::JobStore;
use crate::errors::{minimize, AppError};
use crate::models::{ImageJobSettings, JobRecord, Reservation, ReserveOutcome};
use crate::service::ledger::Ledger;
use crate::service::rate_guard::{RateGuard, IMAGE_BUCKET};

const QUEUE_CAPACITY: usize = 100;

/// Background image generation keyed off a committed turn.
///
/// Submission takes, in order, a concurrency slot, one request from the image
/// rate bucket and a ledger reservation. Whatever happens afterwards, the slot
/// is given back exactly once; on failure the reservation and the quota are
/// returned as well.
#[derive(Clone)]
pub struct ImageJobRunner {
    sender: mpsc::Sender<JobRecord>,
    executor: Arc<JobExecutor>,
}

struct JobExecutor {
    jobs: Arc<dyn JobStore>,
    ledger: Ledger,
    guard: RateGuard,
    generator: Arc<dyn ImageGenerator>,
    job_cost: i64,
}

impl ImageJobRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: Ledger,
        guard: RateGuard,
        generator: Arc<dyn ImageGenerator>,
        job_cost: i64,
        workers: usize,
    ) -> Self {
        let executor = Arc::new(JobExecutor { jobs, ledger, guard, generator, job_cost });
        let (sender, receiver) = mpsc::channel::<JobRecord>(QUEUE_CAPACITY);
        let receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..workers.max(1) {
            let rx = receiver.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                debug!("Image worker {worker_id} started");
                loop {
                    let mut lock = rx.lock().await;
                    match lock.recv().await {
                        Some(job) => {
                            drop(lock);
                            info!("Worker {worker_id} processing image job {}", job.id);
                            JobExecutor::process(executor.clone(), job).await;
                        }
                        None => break,
                    }
                }
            });
        }

        Self { sender, executor }
    }

    pub fn job_cost(&self) -> i64 {
        self.executor.job_cost
    }

    /// Admits a job and queues it. Rejections happen before anything is charged.
    pub async fn submit(
        &self,
        user_id: &str,
        chat_id: &str,
        turn_id: &str,
        settings: ImageJobSettings,
    ) -> Result<JobRecord, AppError> {
        let ex = &self.executor;

        if !ex.guard.increment_concurrent_jobs(user_id).await {
            info!("Image job for turn {turn_id} refused: slot busy for {user_id}");
            return Err(AppError::JobSlotBusy);
        }

        if !ex.guard.check_and_consume(user_id, IMAGE_BUCKET).await.allowed {
            ex.release_slot(user_id).await;
            return Err(AppError::RateLimited { bucket: IMAGE_BUCKET.into() });
        }

        let reason = format!("image_job:{turn_id}");
        let reservation = match ex.ledger.reserve(user_id, ex.job_cost, &reason).await {
            Ok(ReserveOutcome::Reserved(r)) => r,
            Ok(ReserveOutcome::Insufficient { available }) => {
                ex.compensate(user_id, Reservation::default(), "image job refused").await;
                ex.release_slot(user_id).await;
                return Err(AppError::InsufficientTokens { required: ex.job_cost, available });
            }
            Err(e) => {
                ex.compensate(user_id, Reservation::default(), "image job refused").await;
                ex.release_slot(user_id).await;
                return Err(e);
            }
        };

        let job = JobRecord::pending(
            turn_id.to_string(),
            chat_id.to_string(),
            user_id.to_string(),
            ex.job_cost,
            reservation,
            settings,
        );
        if let Err(e) = ex.jobs.insert_job(&job).await {
            error!("Failed to persist image job for turn {turn_id}: {e}");
            ex.compensate(user_id, reservation, "image job not persisted").await;
            ex.release_slot(user_id).await;
            return Err(e);
        }

        if let Err(e) = self.sender.send(job.clone()).await {
            error!("Image queue closed, failing job {}", job.id);
            ex.fail(&job, &AppError::Unexpected(format!("queue closed: {e}"))).await;
            ex.release_slot(user_id).await;
            return Err(AppError::Unexpected("image queue is closed".into()));
        }

        info!("Queued image job {} for turn {turn_id}", job.id);
        Ok(job)
    }

    /// Fire-and-forget submission; the caller never waits on the outcome.
    pub fn enqueue(
        &self,
        user_id: String,
        chat_id: String,
        turn_id: String,
        settings: ImageJobSettings,
    ) {
        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.submit(&user_id, &chat_id, &turn_id, settings).await {
                warn!("Side job for turn {turn_id} not started: {e}");
            }
        });
    }

    pub async fn job(&self, user_id: &str, job_id: &str) -> Result<JobRecord, AppError> {
        let job = self.executor.jobs.find_job(job_id).await?.ok_or_else(|| {
            AppError::RecordNotFound { entity_type: "image_job".into(), id: job_id.to_string() }
        })?;
        if job.user_id != user_id {
            return Err(AppError::Forbidden { id: job_id.to_string() });
        }
        Ok(job)
    }
}

impl JobExecutor {
    async fn process(executor: Arc<Self>, job: JobRecord) {
        let run = {
            let executor = executor.clone();
            let job = job.clone();
            tokio::spawn(async move { executor.execute(&job).await })
        };
        let result = match run.await {
            Ok(result) => result,
            Err(join) => Err(AppError::ImageGenerationFailed {
                message: format!("worker task aborted: {join}"),
            }),
        };

        if let Err(e) = result {
            executor.fail(&job, &e).await;
        }
        executor.release_slot(&job.user_id).await;
    }

    async fn execute(&self, job: &JobRecord) -> Result<(), AppError> {
        self.jobs.mark_processing(&job.id).await?;
        let image = self.generator.generate(&job.settings).await?;
        self.jobs.mark_success(&job.id, &image.url, Utc::now()).await?;
        info!("Image job {} succeeded", job.id);
        Ok(())
    }

    /// Terminal failure: refund, restore the image quota, record the error.
    async fn fail(&self, job: &JobRecord, err: &AppError) {
        warn!("Image job {} failed: {err}", job.id);
        self.compensate(&job.user_id, job.reservation, &format!("image job {} failed", job.id))
            .await;
        let message = minimize(&err.to_string());
        if let Err(e) = self.jobs.mark_failed(&job.id, &message, Utc::now()).await {
            error!("Could not mark image job {} as failed: {e}", job.id);
        }
    }

    /// Refunds `reservation` and gives back the image quota. Each step is
    /// attempted regardless of the others.
    async fn compensate(&self, user_id: &str, reservation: Reservation, reason: &str) {
        if let Err(e) = self.ledger.refund(user_id, reservation, reason).await {
            error!("Refund for {user_id} failed ({reason}): {e}");
        }
        if let Err(e) = self.guard.restore(user_id, IMAGE_BUCKET).await {
            error!("Image quota restore for {user_id} failed: {e}");
        }
    }

    async fn release_slot(&self, user_id: &str) {
        if let Err(e) = self.guard.decrement_concurrent_jobs(user_id).await {
            error!("Failed to release job slot for {user_id}: {e}");
        }
    }
}
