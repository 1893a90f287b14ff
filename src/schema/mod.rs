pub mod contact;
pub mod event;
pub mod job;
pub mod message;
pub mod schedule;
pub mod ticket;

pub use contact::*;
pub use event::*;
pub use job::*;
pub use message::*;
pub use schedule::*;
pub use ticket::*;
