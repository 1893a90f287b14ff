use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::schema::{Contact, OutboundMessage, ScheduleStatus, ScheduledMessage};

/// Persistence seam for the delivery subsystem. Every read/update on the
/// exposed surface is tenant-scoped by `company_id`; a cross-tenant id is
/// indistinguishable from a missing row.
#[async_trait::async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, schedule: &ScheduledMessage) -> Result<()>;

    async fn get(&self, id: Uuid, company_id: Uuid) -> Result<Option<ScheduledMessage>>;

    /// Persist mutable fields (body, send_at, status) of an unsent row.
    async fn update(&self, schedule: &ScheduledMessage) -> Result<()>;

    /// Terminal success transition. Guarded on `sent_at IS NULL` so a
    /// duplicate invocation reports `false` instead of rewriting history.
    async fn mark_sent(
        &self,
        id: Uuid,
        company_id: Uuid,
        sent_at: DateTime<Utc>,
        ticket_id: Option<Uuid>,
    ) -> Result<bool>;

    async fn mark_error(&self, id: Uuid, company_id: Uuid) -> Result<()>;

    /// Pending, unsent schedules due inside `[from, to]`: the sweeper's
    /// recovery query, bounded so ancient schedules stay untouched.
    async fn pending_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>>;

    async fn contact(&self, id: Uuid, company_id: Uuid) -> Result<Option<Contact>>;

    async fn save_contact_address(
        &self,
        contact_id: Uuid,
        company_id: Uuid,
        address: &str,
    ) -> Result<()>;

    async fn record_outbound(&self, message: &OutboundMessage) -> Result<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schedules (
    id uuid PRIMARY KEY,
    body text NOT NULL,
    send_at timestamptz NOT NULL,
    sent_at timestamptz,
    status text NOT NULL DEFAULT 'pending',
    contact_id uuid NOT NULL,
    company_id uuid NOT NULL,
    user_id uuid,
    ticket_id uuid,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS schedules_pending_idx
    ON schedules (send_at) WHERE status = 'pending' AND sent_at IS NULL;

CREATE TABLE IF NOT EXISTS contacts (
    id uuid PRIMARY KEY,
    name text NOT NULL,
    number text NOT NULL,
    remote_address text,
    is_group bool NOT NULL DEFAULT false,
    channel_id uuid NOT NULL,
    company_id uuid NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS tickets (
    id uuid PRIMARY KEY,
    contact_id uuid NOT NULL,
    channel_id uuid NOT NULL,
    company_id uuid NOT NULL,
    status text NOT NULL DEFAULT 'open',
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS messages (
    id uuid PRIMARY KEY,
    schedule_id uuid NOT NULL,
    ticket_id uuid,
    contact_id uuid NOT NULL,
    company_id uuid NOT NULL,
    body text NOT NULL,
    external_id text,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS events (
    id uuid PRIMARY KEY,
    source text NOT NULL,
    action text NOT NULL,
    payload jsonb NOT NULL DEFAULT '{}'::jsonb,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS delivery_jobs (
    id uuid PRIMARY KEY,
    schedule_id uuid NOT NULL,
    company_id uuid NOT NULL,
    run_at timestamptz NOT NULL,
    attempts int NOT NULL DEFAULT 0,
    max_attempts int NOT NULL,
    backoff_base_secs bigint NOT NULL,
    status text NOT NULL DEFAULT 'pending',
    last_error text,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS delivery_jobs_due_idx
    ON delivery_jobs (run_at) WHERE status = 'pending';
"#;

pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent schema application, run once at startup.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn insert(&self, schedule: &ScheduledMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules
                (id, body, send_at, sent_at, status, contact_id, company_id, user_id, ticket_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.body)
        .bind(schedule.send_at)
        .bind(schedule.sent_at)
        .bind(schedule.status.as_str())
        .bind(schedule.contact_id)
        .bind(schedule.company_id)
        .bind(schedule.user_id)
        .bind(schedule.ticket_id)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid, company_id: Uuid) -> Result<Option<ScheduledMessage>> {
        let row = sqlx::query_as::<_, ScheduledMessage>(
            "SELECT * FROM schedules WHERE id = $1 AND company_id = $2",
        )
        .bind(id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update(&self, schedule: &ScheduledMessage) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET body = $3, send_at = $4, status = $5, updated_at = $6
            WHERE id = $1 AND company_id = $2 AND sent_at IS NULL
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.company_id)
        .bind(&schedule.body)
        .bind(schedule.send_at)
        .bind(schedule.status.as_str())
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        company_id: Uuid,
        sent_at: DateTime<Utc>,
        ticket_id: Option<Uuid>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET status = 'sent', sent_at = $3, ticket_id = COALESCE($4, ticket_id), updated_at = now()
            WHERE id = $1 AND company_id = $2 AND sent_at IS NULL
            "#,
        )
        .bind(id)
        .bind(company_id)
        .bind(sent_at)
        .bind(ticket_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_error(&self, id: Uuid, company_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET status = 'error', updated_at = now()
            WHERE id = $1 AND company_id = $2 AND sent_at IS NULL
            "#,
        )
        .bind(id)
        .bind(company_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<_, ScheduledMessage>(
            r#"
            SELECT * FROM schedules
            WHERE status = 'pending' AND sent_at IS NULL AND send_at >= $1 AND send_at <= $2
            ORDER BY send_at
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn contact(&self, id: Uuid, company_id: Uuid) -> Result<Option<Contact>> {
        let row = sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE id = $1 AND company_id = $2",
        )
        .bind(id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn save_contact_address(
        &self,
        contact_id: Uuid,
        company_id: Uuid,
        address: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE contacts SET remote_address = $3, updated_at = now()
            WHERE id = $1 AND company_id = $2
            "#,
        )
        .bind(contact_id)
        .bind(company_id)
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_outbound(&self, message: &OutboundMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, schedule_id, ticket_id, contact_id, company_id, body, external_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id)
        .bind(message.schedule_id)
        .bind(message.ticket_id)
        .bind(message.contact_id)
        .bind(message.company_id)
        .bind(&message.body)
        .bind(message.external_id.as_deref())
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory twin of the Postgres store, mirroring its guard semantics.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<Uuid, ScheduledMessage>>,
    contacts: Mutex<HashMap<Uuid, Contact>>,
    outbound: Mutex<Vec<OutboundMessage>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_contact(&self, contact: Contact) {
        self.contacts.lock().unwrap().insert(contact.id, contact);
    }

    pub fn outbound_messages(&self) -> Vec<OutboundMessage> {
        self.outbound.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, schedule: &ScheduledMessage) -> Result<()> {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid, company_id: Uuid) -> Result<Option<ScheduledMessage>> {
        Ok(self
            .schedules
            .lock()
            .unwrap()
            .get(&id)
            .filter(|s| s.company_id == company_id)
            .cloned())
    }

    async fn update(&self, schedule: &ScheduledMessage) -> Result<()> {
        let mut schedules = self.schedules.lock().unwrap();
        if let Some(existing) = schedules
            .get_mut(&schedule.id)
            .filter(|s| s.company_id == schedule.company_id && s.sent_at.is_none())
        {
            existing.body = schedule.body.clone();
            existing.send_at = schedule.send_at;
            existing.status = schedule.status;
            existing.updated_at = schedule.updated_at;
        }
        Ok(())
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        company_id: Uuid,
        sent_at: DateTime<Utc>,
        ticket_id: Option<Uuid>,
    ) -> Result<bool> {
        let mut schedules = self.schedules.lock().unwrap();
        match schedules
            .get_mut(&id)
            .filter(|s| s.company_id == company_id && s.sent_at.is_none())
        {
            Some(schedule) => {
                schedule.status = ScheduleStatus::Sent;
                schedule.sent_at = Some(sent_at);
                if ticket_id.is_some() {
                    schedule.ticket_id = ticket_id;
                }
                schedule.updated_at = sent_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_error(&self, id: Uuid, company_id: Uuid) -> Result<()> {
        let mut schedules = self.schedules.lock().unwrap();
        if let Some(schedule) = schedules
            .get_mut(&id)
            .filter(|s| s.company_id == company_id && s.sent_at.is_none())
        {
            schedule.status = ScheduleStatus::Error;
            schedule.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn pending_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>> {
        let mut due: Vec<ScheduledMessage> = self
            .schedules
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.status == ScheduleStatus::Pending
                    && s.sent_at.is_none()
                    && s.send_at >= from
                    && s.send_at <= to
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.send_at);
        Ok(due)
    }

    async fn contact(&self, id: Uuid, company_id: Uuid) -> Result<Option<Contact>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .get(&id)
            .filter(|c| c.company_id == company_id)
            .cloned())
    }

    async fn save_contact_address(
        &self,
        contact_id: Uuid,
        company_id: Uuid,
        address: &str,
    ) -> Result<()> {
        let mut contacts = self.contacts.lock().unwrap();
        if let Some(contact) = contacts
            .get_mut(&contact_id)
            .filter(|c| c.company_id == company_id)
        {
            contact.remote_address = Some(address.to_string());
            contact.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_outbound(&self, message: &OutboundMessage) -> Result<()> {
        self.outbound.lock().unwrap().push(message.clone());
        Ok(())
    }
}
