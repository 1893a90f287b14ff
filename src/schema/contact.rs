use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Foreign reference into the contact domain. Only the fields the
/// delivery path needs are carried here; `remote_address` caches the
/// channel-level address once it has been resolved.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contact {
    pub id: Uuid,
    pub name: String,
    pub number: String,
    pub remote_address: Option<String>,
    pub is_group: bool,
    pub channel_id: Uuid,
    pub company_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
