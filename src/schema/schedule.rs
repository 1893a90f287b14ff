use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Sent,
    Error,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Sent => "sent",
            ScheduleStatus::Error => "error",
        }
    }
}

impl TryFrom<String> for ScheduleStatus {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, String> {
        match raw.as_str() {
            "pending" => Ok(ScheduleStatus::Pending),
            "sent" => Ok(ScheduleStatus::Sent),
            "error" => Ok(ScheduleStatus::Error),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted schedule row. `sent_at` is the authoritative
/// already-delivered guard; every component checks it before acting.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub body: String,
    pub send_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: ScheduleStatus,
    pub contact_id: Uuid,
    pub company_id: Uuid,
    pub user_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn new(
        body: String,
        send_at: DateTime<Utc>,
        contact_id: Uuid,
        company_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            body,
            send_at,
            sent_at: None,
            status: ScheduleStatus::Pending,
            contact_id,
            company_id,
            user_id,
            ticket_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
