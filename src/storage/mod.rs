pub mod memory_storage;
pub use self::memory_storage::MemoryStorage;

use std::sync::{RwLock, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::pool_entry::{PoolEntry, Recipient};

/// How long a row may stay claimed, per claiming stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckTtl {
    pub validating: Duration,
    pub sending: Duration,
}

pub trait PoolStorageError: ::std::error::Error {
    /// The targeted row does not exist (anymore)
    fn is_not_found(&self) -> bool;
}

/// A trait for implementing the sending pool.
///
/// Stages share one storage as `Arc<RwLock<S>>`. The claim operations
/// (`prepare_for_validate`, `prepare_for_send`) must select and transition
/// rows in one step, so that two callers never receive the same row. An SQL
/// implementation does this with `FOR UPDATE SKIP LOCKED` inside the update.
pub trait PoolStorage: Send + Sync {
    type Error: PoolStorageError;

    /// Insert recipients of a message in `Initializing`. A recipient already
    /// present for the same message is skipped. Returns how many were added.
    fn add_recipients(
        &mut self,
        message_id: &str,
        domain: &str,
        recipients: Vec<Recipient>,
        scheduled_time: DateTime<Utc>,
    ) -> Result<usize, Self::Error>;

    /// Move every `Initializing` row of a message to `ToValidate`
    fn release_message(&mut self, message_id: &str) -> Result<usize, Self::Error>;

    /// Claim up to `max` rows in `ToValidate`, marking them `Validating`
    fn prepare_for_validate(&mut self, max: usize) -> Result<Vec<PoolEntry>, Self::Error>;

    /// Claim up to `max` `Scheduled` rows that are due, marking them `Sending`
    fn prepare_for_send(&mut self, max: usize) -> Result<Vec<PoolEntry>, Self::Error>;

    fn set_scheduled(&mut self, message_id: &str, email: &str) -> Result<(), Self::Error>;

    /// Delete a row. This is how every terminal state is reached.
    fn clean_email(&mut self, message_id: &str, email: &str) -> Result<(), Self::Error>;

    /// Count one more attempt and push `scheduled_time` forward with backoff.
    /// Returns the updated row.
    fn reschedule_email(&mut self, message_id: &str, email: &str)
        -> Result<PoolEntry, Self::Error>;

    /// Hand rows claimed too long ago back to the stage that claimed them:
    /// `Validating` to `ToValidate`, `Sending` to `Scheduled`.
    fn release_stuck(&mut self, ttl: StuckTtl) -> Result<usize, Self::Error>;

    fn retrieve(&self, message_id: &str, email: &str) -> Result<PoolEntry, Self::Error>;
}

/// Lock the storage for a read-modify-write
pub(crate) fn lock<S: PoolStorage>(
    storage: &RwLock<S>,
) -> Result<RwLockWriteGuard<'_, S>, Error> {
    storage.write().map_err(|_| Error::LockPoisoned)
}
