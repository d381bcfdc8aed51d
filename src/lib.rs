//! Outbound send pipeline for a multi-tenant email platform.
//!
//! Recipients live in a sending pool (see [`storage::PoolStorage`]) and move
//! through three stages that talk to each other only through the pool and a
//! durable queue:
//!
//! * the [`validator::Validator`] checks address syntax and schedules or
//!   rejects each recipient,
//! * the [`dispatcher::Dispatcher`] renders and signs due recipients, publishes
//!   them on `kannon.sending`, and applies delivery feedback to the pool,
//! * the [`sender::Sender`] delivers each queued email directly to the
//!   recipient's MX hosts and publishes the outcome.
//!
//! [`service::run`] wires all of them together on their own threads.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod builder;
pub mod config;
pub mod delivery_result;
pub mod dispatcher;
pub mod email_id;
pub mod error;
pub mod lifecycle;
pub mod pool_entry;
pub mod prepared_email;
pub mod queue;
pub mod sender;
pub mod service;
pub mod smtp;
pub mod stats;
pub mod storage;
pub mod validator;

#[cfg(test)]
mod tests;

pub use crate::config::Config;
pub use crate::email_id::EmailId;
pub use crate::error::Error;
pub use crate::lifecycle::{Shutdown, TaskGroup};
pub use crate::pool_entry::{PoolEntry, PoolStatus, Recipient};
pub use crate::prepared_email::EmailToSend;
pub use crate::stats::{Stats, StatsData};
