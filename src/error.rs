use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid schedule time: {0}")]
    InvalidScheduleTime(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("schedule {0} not found")]
    NotFound(Uuid),

    #[error("schedule {0} was already delivered")]
    AlreadyDelivered(Uuid),

    #[error("scheduling backend unavailable: {0}")]
    SchedulingUnavailable(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
