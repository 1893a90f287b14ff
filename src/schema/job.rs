use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, String> {
        match raw.as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delayed delivery job in the durable queue. A schedule has at most
/// one non-terminal job at any time; re-arming replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub company_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_base_secs: i64,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// Delay before the next retry: base * 2^(attempt-1), so attempts at
    /// the default base land 2s, 4s, 8s apart.
    pub fn backoff_delay(&self) -> Duration {
        let exponent = (self.attempts - 1).clamp(0, 16) as u32;
        Duration::seconds(self.backoff_base_secs << exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_attempts(attempts: i32) -> DeliveryJob {
        let now = Utc::now();
        DeliveryJob {
            id: Uuid::new_v4(),
            schedule_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            run_at: now,
            attempts,
            max_attempts: 3,
            backoff_base_secs: 2,
            status: JobStatus::Running,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(job_with_attempts(1).backoff_delay(), Duration::seconds(2));
        assert_eq!(job_with_attempts(2).backoff_delay(), Duration::seconds(4));
        assert_eq!(job_with_attempts(3).backoff_delay(), Duration::seconds(8));
    }

    #[test]
    fn backoff_is_clamped_for_degenerate_attempt_counts() {
        assert_eq!(job_with_attempts(0).backoff_delay(), Duration::seconds(2));
        assert_eq!(
            job_with_attempts(40).backoff_delay(),
            Duration::seconds(2 << 16)
        );
    }
}
