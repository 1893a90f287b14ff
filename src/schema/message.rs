use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit record of a send actually performed for a schedule.
/// `external_id` is the id the channel assigned in its delivery receipt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub ticket_id: Option<Uuid>,
    pub contact_id: Uuid,
    pub company_id: Uuid,
    pub body: String,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn for_schedule(
        schedule_id: Uuid,
        ticket_id: Option<Uuid>,
        contact_id: Uuid,
        company_id: Uuid,
        body: String,
        external_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            ticket_id,
            contact_id,
            company_id,
            body,
            external_id,
            created_at: Utc::now(),
        }
    }
}
