use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::schema::{Contact, Ticket};

/// Resolution into the ticket domain: delivery reuses the contact's open
/// ticket on its channel, or opens one.
#[async_trait::async_trait]
pub trait TicketResolver: Send + Sync {
    async fn find_or_create(&self, contact: &Contact) -> anyhow::Result<Ticket>;
}

pub struct PgTicketResolver {
    pool: PgPool,
}

impl PgTicketResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TicketResolver for PgTicketResolver {
    async fn find_or_create(&self, contact: &Contact) -> anyhow::Result<Ticket> {
        let existing = sqlx::query_as::<_, Ticket>(
            r#"
            SELECT * FROM tickets
            WHERE contact_id = $1 AND channel_id = $2 AND company_id = $3 AND status = 'open'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(contact.id)
        .bind(contact.channel_id)
        .bind(contact.company_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ticket) = existing {
            return Ok(ticket);
        }

        let now = Utc::now();
        let ticket = Ticket {
            id: Uuid::new_v4(),
            contact_id: contact.id,
            channel_id: contact.channel_id,
            company_id: contact.company_id,
            status: "open".to_string(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            r#"
            INSERT INTO tickets (id, contact_id, channel_id, company_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(ticket.id)
        .bind(ticket.contact_id)
        .bind(ticket.channel_id)
        .bind(ticket.company_id)
        .bind(&ticket.status)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(ticket)
    }
}
