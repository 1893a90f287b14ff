use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::schema::Event;

/// Fire-and-forget change notifications for real-time observers.
/// Publishing must never fail delivery; implementations swallow and log
/// their own errors.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, action: &str, payload: serde_json::Value);
}

/// Writes notifications as `events` rows for the dashboard/UI feed.
pub struct PgNotifier {
    pool: PgPool,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Notifier for PgNotifier {
    async fn publish(&self, action: &str, payload: serde_json::Value) {
        let event = Event {
            id: Uuid::new_v4(),
            source: "schedule".to_string(),
            action: action.to_string(),
            payload,
            created_at: Utc::now(),
        };
        let result = sqlx::query(
            "INSERT INTO events (id, source, action, payload, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.id)
        .bind(&event.source)
        .bind(&event.action)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::warn!(action = %event.action, error = %err, "notifier: event insert failed");
        }
    }
}

/// Captures published notifications; used by tests to assert the
/// observer-facing behavior.
#[derive(Default)]
pub struct RecordingNotifier {
    published: std::sync::Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, action: &str, payload: serde_json::Value) {
        self.published
            .lock()
            .unwrap()
            .push((action.to_string(), payload));
    }
}
