//! Scheduled-message delivery for a multi-tenant WhatsApp
//! customer-service platform.
//!
//! A schedule created "to be sent later" is normalized to an absolute
//! instant, persisted, and armed for delivery: through a durable job
//! queue when one is available, through an in-process timer otherwise. A
//! periodic sweeper re-arms anything a restart or lost timer left
//! behind. The executor performs exactly one send attempt per
//! invocation, serialized per channel, with the persisted row's
//! `sent_at` acting as the idempotency guard against duplicate fires.

pub mod config;
pub mod error;
pub mod functions;
pub mod schema;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result};
