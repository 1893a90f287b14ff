use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::Result;
use crate::functions::scheduler::JobScheduler;
use crate::services::{Notifier, ScheduleStore};

/// One recovery pass: re-arm every pending schedule that came due inside
/// the recent window. In-process timers and channel chains do not survive
/// a restart; this pass is what makes the system converge afterwards.
/// A schedule the scheduler refuses to re-arm is marked `error` so it
/// surfaces to operators instead of silently vanishing.
pub async fn sweep_tick(
    store: &Arc<dyn ScheduleStore>,
    scheduler: &Arc<JobScheduler>,
    notifier: &Arc<dyn Notifier>,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<u32> {
    let due = store
        .pending_due_between(now - config.sweep_window(), now)
        .await?;
    if due.is_empty() {
        return Ok(0);
    }

    tracing::debug!(count = due.len(), "sweeper: re-arming pending schedules");

    let mut rearmed = 0u32;
    for schedule in due {
        match scheduler.try_schedule(&schedule).await {
            Ok(()) => rearmed += 1,
            Err(err) => {
                tracing::error!(
                    schedule_id = %schedule.id,
                    error = %err,
                    "sweeper: re-arm failed, marking error"
                );
                store.mark_error(schedule.id, schedule.company_id).await?;
                notifier
                    .publish(
                        "schedule_error",
                        serde_json::json!({
                            "schedule_id": schedule.id,
                            "company_id": schedule.company_id,
                            "error": err.to_string(),
                        }),
                    )
                    .await;
            }
        }
    }

    Ok(rearmed)
}

pub async fn sweeper(
    store: Arc<dyn ScheduleStore>,
    scheduler: Arc<JobScheduler>,
    notifier: Arc<dyn Notifier>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(config.sweep_interval) => {
                scheduler.probe().await;
                match sweep_tick(&store, &scheduler, &notifier, &config, Utc::now()).await {
                    Ok(n) if n > 0 => tracing::info!(rearmed = n, "sweep tick"),
                    Err(e) => tracing::error!(error = %e, "sweep tick failed"),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::scheduler::{DurableBackend, FallbackBackend, SchedulingBackend};
    use crate::functions::worker::worker_tick;
    use crate::schema::{ScheduleStatus, ScheduledMessage};
    use crate::services::{JobQueue, MemoryJobQueue};
    use crate::testing::*;
    use chrono::Duration;
    use uuid::Uuid;

    struct SweepSetup {
        h: Harness,
        memory: Arc<MemoryJobQueue>,
        queue: Arc<dyn JobQueue>,
        scheduler: Arc<JobScheduler>,
        store: Arc<dyn ScheduleStore>,
        notifier: Arc<dyn Notifier>,
    }

    async fn setup() -> SweepSetup {
        let h = Harness::new();
        let memory = Arc::new(MemoryJobQueue::new());
        let queue: Arc<dyn JobQueue> = memory.clone();
        let durable: Arc<dyn SchedulingBackend> =
            Arc::new(DurableBackend::new(queue.clone(), 3, 2));
        let fallback: Arc<dyn SchedulingBackend> = Arc::new(FallbackBackend::new(
            h.executor.clone(),
            h.config.fallback_grace,
            h.config.fallback_jitter_mod_ms,
        ));
        let scheduler = Arc::new(JobScheduler::new(Some(durable), fallback));
        scheduler.probe().await;
        let store: Arc<dyn ScheduleStore> = h.store.clone();
        let notifier: Arc<dyn Notifier> = h.notifier.clone();
        SweepSetup {
            h,
            memory,
            queue,
            scheduler,
            store,
            notifier,
        }
    }

    #[tokio::test]
    async fn lost_schedule_is_rearmed_and_delivered_once() {
        let s = setup().await;
        let contact = s.h.add_contact(false);
        // pending, due five minutes ago, with no timer and no job: the
        // state a restart leaves behind
        let schedule = s
            .h
            .add_schedule(&contact, Utc::now() - Duration::minutes(5))
            .await;

        let now = Utc::now();
        let rearmed = sweep_tick(&s.store, &s.scheduler, &s.notifier, &s.h.config, now)
            .await
            .unwrap();
        assert_eq!(rearmed, 1);
        assert_eq!(s.memory.pending_for(schedule.id).len(), 1);

        worker_tick(&s.queue, &s.h.executor, 20, Utc::now())
            .await
            .unwrap();
        assert_eq!(s.h.transport.send_count(), 1);
        assert_eq!(
            s.h.schedule_status(schedule.id).await.status,
            ScheduleStatus::Sent
        );

        // a second sweep re-arms nothing
        let rearmed = sweep_tick(&s.store, &s.scheduler, &s.notifier, &s.h.config, Utc::now())
            .await
            .unwrap();
        assert_eq!(rearmed, 0);
        assert_eq!(s.h.transport.send_count(), 1);
    }

    #[tokio::test]
    async fn ancient_schedules_are_left_alone() {
        let s = setup().await;
        let contact = s.h.add_contact(false);
        let schedule = s
            .h
            .add_schedule(&contact, Utc::now() - Duration::days(2))
            .await;

        let rearmed = sweep_tick(&s.store, &s.scheduler, &s.notifier, &s.h.config, Utc::now())
            .await
            .unwrap();
        assert_eq!(rearmed, 0);
        assert!(s.memory.pending_for(schedule.id).is_empty());
        assert_eq!(
            s.h.schedule_status(schedule.id).await.status,
            ScheduleStatus::Pending
        );
    }

    #[tokio::test]
    async fn future_schedules_are_not_rearmed_early() {
        let s = setup().await;
        let contact = s.h.add_contact(false);
        let schedule = s
            .h
            .add_schedule(&contact, Utc::now() + Duration::hours(1))
            .await;

        let rearmed = sweep_tick(&s.store, &s.scheduler, &s.notifier, &s.h.config, Utc::now())
            .await
            .unwrap();
        assert_eq!(rearmed, 0);
        assert!(s.memory.pending_for(schedule.id).is_empty());
    }

    #[tokio::test]
    async fn sent_and_errored_schedules_are_ignored() {
        let s = setup().await;
        let contact = s.h.add_contact(false);
        let sent = s
            .h
            .add_schedule(&contact, Utc::now() - Duration::minutes(5))
            .await;
        s.store
            .mark_sent(sent.id, s.h.company_id, Utc::now(), None)
            .await
            .unwrap();
        let errored = s
            .h
            .add_schedule(&contact, Utc::now() - Duration::minutes(5))
            .await;
        s.store
            .mark_error(errored.id, s.h.company_id)
            .await
            .unwrap();

        let rearmed = sweep_tick(&s.store, &s.scheduler, &s.notifier, &s.h.config, Utc::now())
            .await
            .unwrap();
        assert_eq!(rearmed, 0);
    }

    #[tokio::test]
    async fn unarmable_schedule_is_marked_error() {
        struct DownBackend;

        #[async_trait::async_trait]
        impl SchedulingBackend for DownBackend {
            async fn arm(&self, _schedule: &ScheduledMessage) -> crate::error::Result<()> {
                Err(crate::error::Error::SchedulingUnavailable(
                    "backend down".to_string(),
                ))
            }
            async fn cancel(&self, _schedule_id: Uuid) -> crate::error::Result<()> {
                Ok(())
            }
            async fn ping(&self) -> crate::error::Result<()> {
                Err(crate::error::Error::SchedulingUnavailable(
                    "backend down".to_string(),
                ))
            }
        }

        let h = Harness::new();
        let scheduler = Arc::new(JobScheduler::new(None, Arc::new(DownBackend)));
        let store: Arc<dyn ScheduleStore> = h.store.clone();
        let notifier: Arc<dyn Notifier> = h.notifier.clone();

        let contact = h.add_contact(false);
        let schedule = h
            .add_schedule(&contact, Utc::now() - Duration::minutes(5))
            .await;

        let rearmed = sweep_tick(&store, &scheduler, &notifier, &h.config, Utc::now())
            .await
            .unwrap();
        assert_eq!(rearmed, 0);
        assert_eq!(
            h.schedule_status(schedule.id).await.status,
            ScheduleStatus::Error
        );
        assert_eq!(h.published_actions(), vec!["schedule_error".to_string()]);
    }
}
