use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::functions::deliver::DeliveryExecutor;
use crate::schema::ScheduledMessage;
use crate::services::{JobQueue, NewDeliveryJob};

/// One way of making a future delivery happen. The scheduler owns two:
/// the durable queue and the in-process timer fallback.
#[async_trait::async_trait]
pub trait SchedulingBackend: Send + Sync {
    async fn arm(&self, schedule: &ScheduledMessage) -> Result<()>;

    /// Best-effort: absence of anything to cancel is not an error.
    async fn cancel(&self, schedule_id: Uuid) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Delayed job in the durable queue, keyed by schedule id, carrying the
/// retry policy. A past-due schedule enqueues for immediate processing
/// instead of being dropped.
pub struct DurableBackend {
    queue: Arc<dyn JobQueue>,
    max_attempts: i32,
    backoff_base_secs: i64,
}

impl DurableBackend {
    pub fn new(queue: Arc<dyn JobQueue>, max_attempts: i32, backoff_base_secs: i64) -> Self {
        Self {
            queue,
            max_attempts,
            backoff_base_secs,
        }
    }
}

#[async_trait::async_trait]
impl SchedulingBackend for DurableBackend {
    async fn arm(&self, schedule: &ScheduledMessage) -> Result<()> {
        let run_at = schedule.send_at.max(Utc::now());
        let job_id = self
            .queue
            .enqueue(NewDeliveryJob {
                schedule_id: schedule.id,
                company_id: schedule.company_id,
                run_at,
                max_attempts: self.max_attempts,
                backoff_base_secs: self.backoff_base_secs,
            })
            .await?;
        tracing::debug!(
            schedule_id = %schedule.id,
            job_id = %job_id,
            run_at = %run_at,
            "scheduler: durable job enqueued"
        );
        Ok(())
    }

    async fn cancel(&self, schedule_id: Uuid) -> Result<()> {
        self.queue.cancel(schedule_id).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.queue.ping().await
    }
}

/// One-shot in-process timer driving the executor directly. Not
/// crash-safe; the sweeper covers restarts. There is no cancel handle;
/// the executor's eligibility guards neutralize stale timers at fire
/// time.
pub struct FallbackBackend {
    executor: Arc<DeliveryExecutor>,
    grace: Duration,
    jitter_mod_ms: u64,
}

impl FallbackBackend {
    pub fn new(executor: Arc<DeliveryExecutor>, grace: Duration, jitter_mod_ms: u64) -> Self {
        Self {
            executor,
            grace,
            jitter_mod_ms,
        }
    }
}

/// Deterministic per-schedule jitter, spreading bursts of timers created
/// in the same instant.
fn jitter_ms(id: Uuid, modulus: u64) -> u64 {
    if modulus == 0 {
        return 0;
    }
    (id.as_u128() % u128::from(modulus)) as u64
}

#[async_trait::async_trait]
impl SchedulingBackend for FallbackBackend {
    async fn arm(&self, schedule: &ScheduledMessage) -> Result<()> {
        let delay = (schedule.send_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let wait = delay + self.grace + Duration::from_millis(jitter_ms(schedule.id, self.jitter_mod_ms));

        let executor = self.executor.clone();
        let (schedule_id, company_id) = (schedule.id, schedule.company_id);
        tracing::debug!(
            schedule_id = %schedule_id,
            wait_ms = wait.as_millis() as u64,
            "scheduler: fallback timer armed"
        );
        tokio::spawn(async move {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            // the fallback has no job-layer retry behind it
            if let Err(err) = executor.deliver(schedule_id, company_id, true).await {
                tracing::warn!(
                    schedule_id = %schedule_id,
                    error = %err,
                    "scheduler: fallback delivery failed"
                );
            }
        });
        Ok(())
    }

    async fn cancel(&self, _schedule_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Chooses between the durable queue and the timer fallback. Durable
/// health is probed at startup, demoted on the first enqueue failure and
/// re-probed by every sweeper pass, so a queue outage degrades service
/// instead of dropping schedules.
pub struct JobScheduler {
    durable: Option<Arc<dyn SchedulingBackend>>,
    fallback: Arc<dyn SchedulingBackend>,
    durable_healthy: AtomicBool,
}

impl JobScheduler {
    pub fn new(
        durable: Option<Arc<dyn SchedulingBackend>>,
        fallback: Arc<dyn SchedulingBackend>,
    ) -> Self {
        Self {
            durable,
            fallback,
            durable_healthy: AtomicBool::new(false),
        }
    }

    pub fn durable_healthy(&self) -> bool {
        self.durable_healthy.load(Ordering::SeqCst)
    }

    pub async fn probe(&self) -> bool {
        let Some(durable) = &self.durable else {
            return false;
        };
        let was_healthy = self.durable_healthy.load(Ordering::SeqCst);
        match durable.ping().await {
            Ok(()) => {
                if !was_healthy {
                    tracing::info!("scheduler: durable backend available");
                }
                self.durable_healthy.store(true, Ordering::SeqCst);
                true
            }
            Err(err) => {
                if was_healthy {
                    tracing::warn!(error = %err, "scheduler: durable backend lost");
                }
                self.durable_healthy.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Arm a future delivery, preferring the durable queue. Errors
    /// propagate so the sweeper can mark schedules it failed to re-arm.
    pub async fn try_schedule(&self, schedule: &ScheduledMessage) -> Result<()> {
        if let Some(durable) = &self.durable
            && self.durable_healthy.load(Ordering::SeqCst)
        {
            match durable.arm(schedule).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        error = %err,
                        "scheduler: durable enqueue failed, falling back to timer"
                    );
                    self.durable_healthy.store(false, Ordering::SeqCst);
                }
            }
        }
        self.fallback
            .arm(schedule)
            .await
            .map_err(|err| Error::SchedulingUnavailable(err.to_string()))
    }

    /// Fire-and-forget arming used on create/update: a schedule row must
    /// never fail to exist merely because arming failed. The sweeper
    /// picks the row up later.
    pub async fn schedule(&self, schedule: &ScheduledMessage) {
        if let Err(err) = self.try_schedule(schedule).await {
            tracing::error!(
                schedule_id = %schedule.id,
                error = %err,
                "scheduler: arming failed, leaving schedule pending for the sweeper"
            );
        }
    }

    /// Best-effort cancellation of the outstanding durable job; stale
    /// fallback timers die at the executor's guards instead.
    pub async fn cancel(&self, schedule_id: Uuid) {
        if let Some(durable) = &self.durable
            && let Err(err) = durable.cancel(schedule_id).await
        {
            tracing::warn!(
                schedule_id = %schedule_id,
                error = %err,
                "scheduler: durable cancel failed"
            );
        }
    }

    pub async fn reschedule(&self, schedule: &ScheduledMessage) {
        self.cancel(schedule.id).await;
        self.schedule(schedule).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ScheduleStatus;
    use crate::services::MemoryJobQueue;
    use crate::services::store::ScheduleStore;
    use crate::testing::*;
    use chrono::Duration as ChronoDuration;

    fn durable(queue: &Arc<MemoryJobQueue>) -> Arc<dyn SchedulingBackend> {
        Arc::new(DurableBackend::new(queue.clone(), 3, 2))
    }

    fn fallback(h: &Harness) -> Arc<dyn SchedulingBackend> {
        Arc::new(FallbackBackend::new(
            h.executor.clone(),
            h.config.fallback_grace,
            h.config.fallback_jitter_mod_ms,
        ))
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl SchedulingBackend for FailingBackend {
        async fn arm(&self, _schedule: &ScheduledMessage) -> Result<()> {
            Err(Error::SchedulingUnavailable("backend down".to_string()))
        }

        async fn cancel(&self, _schedule_id: Uuid) -> Result<()> {
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Err(Error::SchedulingUnavailable("backend down".to_string()))
        }
    }

    async fn wait_for_send(h: &Harness, expected: usize) {
        for _ in 0..100 {
            if h.transport.send_count() >= expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!(
            "expected {expected} sends, saw {}",
            h.transport.send_count()
        );
    }

    #[tokio::test]
    async fn healthy_durable_backend_gets_the_job() {
        let h = Harness::new();
        let queue = Arc::new(MemoryJobQueue::new());
        let scheduler = JobScheduler::new(Some(durable(&queue)), fallback(&h));
        assert!(scheduler.probe().await);

        let contact = h.add_contact(false);
        let send_at = Utc::now() + ChronoDuration::minutes(30);
        let schedule = h.add_schedule(&contact, send_at).await;
        scheduler.schedule(&schedule).await;

        let pending = queue.pending_for(schedule.id);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].run_at, send_at);
        assert_eq!(pending[0].max_attempts, 3);
        // nothing fired through the timer path
        assert_eq!(h.transport.send_count(), 0);
    }

    #[tokio::test]
    async fn past_due_schedule_enqueues_for_immediate_processing() {
        let h = Harness::new();
        let queue = Arc::new(MemoryJobQueue::new());
        let scheduler = JobScheduler::new(Some(durable(&queue)), fallback(&h));
        scheduler.probe().await;

        let contact = h.add_contact(false);
        let schedule = h
            .add_schedule(&contact, Utc::now() - ChronoDuration::minutes(10))
            .await;
        scheduler.schedule(&schedule).await;

        let pending = queue.pending_for(schedule.id);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].run_at >= schedule.send_at);
        assert!(pending[0].run_at <= Utc::now());
    }

    #[tokio::test]
    async fn unavailable_durable_backend_falls_back_to_timer() {
        let h = Harness::new();
        let scheduler =
            JobScheduler::new(Some(Arc::new(FailingBackend)), fallback(&h));
        assert!(!scheduler.probe().await);

        let contact = h.add_contact(false);
        let schedule = h
            .add_schedule(&contact, Utc::now() - ChronoDuration::seconds(1))
            .await;
        scheduler.schedule(&schedule).await;

        wait_for_send(&h, 1).await;
        assert_eq!(
            h.schedule_status(schedule.id).await.status,
            ScheduleStatus::Sent
        );
    }

    #[tokio::test]
    async fn enqueue_failure_demotes_durable_and_uses_timer() {
        let h = Harness::new();
        let scheduler = JobScheduler::new(Some(Arc::new(FailingBackend)), fallback(&h));
        // pretend the probe passed earlier
        scheduler.durable_healthy.store(true, Ordering::SeqCst);

        let contact = h.add_contact(false);
        let schedule = h
            .add_schedule(&contact, Utc::now() - ChronoDuration::seconds(1))
            .await;
        scheduler.schedule(&schedule).await;

        wait_for_send(&h, 1).await;
        assert!(!scheduler.durable_healthy());
    }

    #[tokio::test]
    async fn no_durable_backend_configured_uses_timer() {
        let h = Harness::new();
        let scheduler = JobScheduler::new(None, fallback(&h));
        assert!(!scheduler.probe().await);

        let contact = h.add_contact(false);
        let schedule = h
            .add_schedule(&contact, Utc::now() - ChronoDuration::seconds(1))
            .await;
        scheduler.schedule(&schedule).await;

        wait_for_send(&h, 1).await;
    }

    #[tokio::test]
    async fn stale_timer_respects_reschedule() {
        let h = Harness::new();
        let scheduler = JobScheduler::new(None, fallback(&h));

        let contact = h.add_contact(false);
        let mut schedule = h
            .add_schedule(&contact, Utc::now() + ChronoDuration::milliseconds(50))
            .await;
        scheduler.schedule(&schedule).await;

        // push the send time out before the timer fires; the stale timer
        // must hit the not-yet-due guard and do nothing
        schedule.send_at = Utc::now() + ChronoDuration::minutes(10);
        schedule.updated_at = Utc::now();
        h.store.update(&schedule).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(h.transport.send_count(), 0);
        assert_eq!(
            h.schedule_status(schedule.id).await.status,
            ScheduleStatus::Pending
        );

        // re-arming at a near time delivers exactly once
        schedule.send_at = Utc::now() + ChronoDuration::milliseconds(20);
        schedule.updated_at = Utc::now();
        h.store.update(&schedule).await.unwrap();
        scheduler.reschedule(&schedule).await;

        wait_for_send(&h, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.transport.send_count(), 1);
    }

    #[tokio::test]
    async fn reschedule_replaces_the_durable_job() {
        let h = Harness::new();
        let queue = Arc::new(MemoryJobQueue::new());
        let scheduler = JobScheduler::new(Some(durable(&queue)), fallback(&h));
        scheduler.probe().await;

        let contact = h.add_contact(false);
        let mut schedule = h
            .add_schedule(&contact, Utc::now() + ChronoDuration::minutes(30))
            .await;
        scheduler.schedule(&schedule).await;

        let new_send_at = Utc::now() + ChronoDuration::hours(2);
        schedule.send_at = new_send_at;
        scheduler.reschedule(&schedule).await;

        let pending = queue.pending_for(schedule.id);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].run_at, new_send_at);
    }

    #[tokio::test]
    async fn try_schedule_surfaces_total_failure() {
        let h = Harness::new();
        let scheduler = JobScheduler::new(
            Some(Arc::new(FailingBackend)),
            Arc::new(FailingBackend),
        );
        let contact = h.add_contact(false);
        let schedule = h
            .add_schedule(&contact, Utc::now() + ChronoDuration::minutes(5))
            .await;

        let result = scheduler.try_schedule(&schedule).await;
        assert!(matches!(result, Err(Error::SchedulingUnavailable(_))));
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let id = Uuid::new_v4();
        assert_eq!(jitter_ms(id, 500), jitter_ms(id, 500));
        assert!(jitter_ms(id, 500) < 500);
        assert_eq!(jitter_ms(id, 0), 0);
    }
}
