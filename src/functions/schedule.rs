use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::functions::normalize::normalize;
use crate::functions::scheduler::JobScheduler;
use crate::schema::{ScheduleStatus, ScheduledMessage};
use crate::services::ScheduleStore;

const BODY_MIN_CHARS: usize = 5;
const BODY_MAX_CHARS: usize = 4096;

#[derive(Debug, Clone)]
pub struct CreateSchedule {
    pub body: String,
    pub send_at: String,
    pub contact_id: Uuid,
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSchedule {
    pub body: Option<String>,
    pub send_at: Option<String>,
}

/// The surface route handlers call into. Everything here is tenant
/// scoped: an id from another company behaves exactly like a missing id.
pub struct ScheduleService {
    config: Arc<Config>,
    store: Arc<dyn ScheduleStore>,
    scheduler: Arc<JobScheduler>,
}

impl ScheduleService {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ScheduleStore>,
        scheduler: Arc<JobScheduler>,
    ) -> Self {
        Self {
            config,
            store,
            scheduler,
        }
    }

    /// Create a pending schedule and arm its delivery. Arming is a side
    /// effect that must never fail creation; a schedule that could not be
    /// armed stays pending and the sweeper retries it.
    pub async fn create(&self, input: CreateSchedule) -> Result<ScheduledMessage> {
        validate_body(&input.body)?;

        if self
            .store
            .contact(input.contact_id, input.company_id)
            .await?
            .is_none()
        {
            return Err(Error::NotFound(input.contact_id));
        }

        let send_at = normalize(&input.send_at, Utc::now(), &self.config)?;
        let schedule = ScheduledMessage::new(
            input.body,
            send_at,
            input.contact_id,
            input.company_id,
            input.user_id,
        );
        self.store.insert(&schedule).await?;

        tracing::info!(
            schedule_id = %schedule.id,
            company_id = %schedule.company_id,
            send_at = %schedule.send_at,
            "schedule: created"
        );

        self.scheduler.schedule(&schedule).await;
        Ok(schedule)
    }

    /// Patch body and/or send time of an unsent schedule. A new send time
    /// re-arms delivery (cancelling the outstanding durable job) and
    /// resets an errored schedule back to pending.
    pub async fn update(
        &self,
        id: Uuid,
        company_id: Uuid,
        patch: UpdateSchedule,
    ) -> Result<ScheduledMessage> {
        let mut schedule = self
            .store
            .get(id, company_id)
            .await?
            .ok_or(Error::NotFound(id))?;
        if schedule.sent_at.is_some() {
            return Err(Error::AlreadyDelivered(id));
        }

        if let Some(body) = patch.body {
            validate_body(&body)?;
            schedule.body = body;
        }

        let rearm = patch.send_at.is_some();
        if let Some(raw) = patch.send_at {
            schedule.send_at = normalize(&raw, Utc::now(), &self.config)?;
            // an explicit new time revives an errored schedule
            schedule.status = ScheduleStatus::Pending;
        }

        schedule.updated_at = Utc::now();
        self.store.update(&schedule).await?;

        tracing::info!(
            schedule_id = %schedule.id,
            send_at = %schedule.send_at,
            rearm,
            "schedule: updated"
        );

        if rearm {
            self.scheduler.reschedule(&schedule).await;
        }
        Ok(schedule)
    }

    pub async fn get(&self, id: Uuid, company_id: Uuid) -> Result<ScheduledMessage> {
        self.store
            .get(id, company_id)
            .await?
            .ok_or(Error::NotFound(id))
    }
}

fn validate_body(body: &str) -> Result<()> {
    let len = body.chars().count();
    if len < BODY_MIN_CHARS {
        return Err(Error::Validation(format!(
            "body must be at least {BODY_MIN_CHARS} characters"
        )));
    }
    if len > BODY_MAX_CHARS {
        return Err(Error::Validation(format!(
            "body must be at most {BODY_MAX_CHARS} characters"
        )));
    }
    Ok(())
}
