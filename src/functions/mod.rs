pub mod deliver;
pub mod normalize;
pub mod schedule;
pub mod scheduler;
pub mod serializer;
pub mod sweeper;
pub mod worker;

pub use deliver::DeliveryExecutor;
pub use normalize::normalize;
pub use schedule::{CreateSchedule, ScheduleService, UpdateSchedule};
pub use scheduler::{DurableBackend, FallbackBackend, JobScheduler, SchedulingBackend};
pub use serializer::ChannelSerializer;
pub use sweeper::{sweep_tick, sweeper};
pub use worker::{worker, worker_tick};
