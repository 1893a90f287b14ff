use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::schema::{DeliveryJob, JobStatus};

#[derive(Debug, Clone)]
pub struct NewDeliveryJob {
    pub schedule_id: Uuid,
    pub company_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub backoff_base_secs: i64,
}

/// Durable delayed-job backend. Enqueueing is keyed by schedule id:
/// a pending job for the same schedule is superseded, never duplicated,
/// so re-arming from the sweeper stays idempotent.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewDeliveryJob) -> Result<Uuid>;

    /// Best-effort cancellation of the pending job for a schedule.
    /// Absence of such a job is not an error.
    async fn cancel(&self, schedule_id: Uuid) -> Result<u64>;

    /// Claim up to `limit` due jobs, marking them running and counting
    /// the attempt.
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryJob>>;

    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Settle a failed attempt: with `retry_at` the job goes back to
    /// pending at that instant, without it the job is terminally failed.
    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Availability probe used by the scheduler before trusting this
    /// backend.
    async fn ping(&self) -> Result<()>;
}

pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: NewDeliveryJob) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE delivery_jobs SET status = 'cancelled', updated_at = now()
             WHERE schedule_id = $1 AND status = 'pending'",
        )
        .bind(job.schedule_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO delivery_jobs
                (id, schedule_id, company_id, run_at, attempts, max_attempts, backoff_base_secs, status)
            VALUES ($1, $2, $3, $4, 0, $5, $6, 'pending')
            "#,
        )
        .bind(id)
        .bind(job.schedule_id)
        .bind(job.company_id)
        .bind(job.run_at)
        .bind(job.max_attempts)
        .bind(job.backoff_base_secs)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn cancel(&self, schedule_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE delivery_jobs SET status = 'cancelled', updated_at = now()
             WHERE schedule_id = $1 AND status = 'pending'",
        )
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryJob>> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            r#"
            UPDATE delivery_jobs
            SET status = 'running', attempts = attempts + 1, updated_at = now()
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE status = 'pending' AND run_at <= $1
                ORDER BY run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE delivery_jobs SET status = 'done', updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match retry_at {
            Some(run_at) => {
                sqlx::query(
                    r#"
                    UPDATE delivery_jobs
                    SET status = 'pending', run_at = $2, last_error = $3, updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(run_at)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE delivery_jobs
                    SET status = 'failed', last_error = $2, updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-memory queue with the same claim/settle semantics, used by tests
/// and available when running without Postgres-backed jobs.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<Uuid, DeliveryJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<DeliveryJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn pending_for(&self, schedule_id: Uuid) -> Vec<DeliveryJob> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.schedule_id == schedule_id && j.status == JobStatus::Pending)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewDeliveryJob) -> Result<Uuid> {
        let mut jobs = self.jobs.lock().unwrap();
        for existing in jobs.values_mut() {
            if existing.schedule_id == job.schedule_id && existing.status == JobStatus::Pending {
                existing.status = JobStatus::Cancelled;
                existing.updated_at = Utc::now();
            }
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        jobs.insert(
            id,
            DeliveryJob {
                id,
                schedule_id: job.schedule_id,
                company_id: job.company_id,
                run_at: job.run_at,
                attempts: 0,
                max_attempts: job.max_attempts,
                backoff_base_secs: job.backoff_base_secs,
                status: JobStatus::Pending,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn cancel(&self, schedule_id: Uuid) -> Result<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut cancelled = 0;
        for job in jobs.values_mut() {
            if job.schedule_id == schedule_id && job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                job.updated_at = Utc::now();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DeliveryJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now)
            .map(|j| (j.run_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            job.status = JobStatus::Done;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            job.last_error = Some(error.to_string());
            job.updated_at = Utc::now();
            match retry_at {
                Some(run_at) => {
                    job.status = JobStatus::Pending;
                    job.run_at = run_at;
                }
                None => job.status = JobStatus::Failed,
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
