//! Queue subjects and the publish/consume seams between stages.
//!
//! Production runs on a durable stream (`kannon`, file storage, limits
//! retention, 10 minute duplicate window, 24h max age). Stages only see the
//! [`Publisher`] and [`Consumer`] traits; [`MemoryQueue`] implements both
//! in-process.

pub mod memory_queue;
pub use self::memory_queue::{MemoryConsumer, MemoryQueue};

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::Error;

pub const STREAM_NAME: &str = "kannon";
pub const SENDING_SUBJECT: &str = "kannon.sending";
pub const STATS_SUBJECT_PREFIX: &str = "kannon.stats";
pub const ALL_STATS_SUBJECTS: &str = "kannon.stats.>";

/// Settings of the stream every subject lives on
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
    /// How long a fetched message may stay unsettled before it is redelivered
    pub ack_wait: Duration,
    /// Deliveries after which a nak'd message is dead-lettered
    pub max_deliver: u32,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            name: STREAM_NAME.to_owned(),
            subjects: vec![SENDING_SUBJECT.to_owned(), ALL_STATS_SUBJECTS.to_owned()],
            max_age: Duration::from_secs(24 * 60 * 60),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// No stream captures this subject
    NoStream(String),
    /// Ack/nak for a message the consumer does not hold
    NotInFlight(u64),
    UnknownConsumer(String),
    LockPoisoned,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            QueueError::NoStream(ref subject) => write!(f, "no stream for subject {}", subject),
            QueueError::NotInFlight(seq) => write!(f, "message {} is not in flight", seq),
            QueueError::UnknownConsumer(ref name) => write!(f, "unknown consumer {}", name),
            QueueError::LockPoisoned => write!(f, "queue lock poisoned"),
        }
    }
}

impl std::error::Error for QueueError {}

/// A message handed to a consumer. It stays in flight until acked, nak'd or
/// terminated.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub sequence: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    /// How many times this message has been delivered, this one included
    pub delivered: u32,
}

/// Emits messages on a subject. Safe to share between stages.
pub trait Publisher: Send + Sync {
    fn publish(&self, subject: &str, data: &[u8]) -> Result<(), QueueError>;
}

/// A durable pull consumer
pub trait Consumer: Send + Sync {
    /// Wait at most `wait` for up to `max` messages. An empty result is not
    /// an error.
    fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError>;

    fn ack(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Ask for redelivery
    fn nak(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Drop the message without redelivery
    fn term(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

/// Hands out durable consumers on top of a publisher
pub trait Broker: Publisher {
    fn consumer(&self, durable: &str, filter: &str) -> Result<Box<dyn Consumer>, QueueError>;
}

/// Serialize `value` as JSON and publish it
pub fn publish_json<T: Serialize>(
    publisher: &dyn Publisher,
    subject: &str,
    value: &T,
) -> Result<(), Error> {
    let data = serde_json::to_vec(value)?;
    publisher.publish(subject, &data)?;
    Ok(())
}

/// Subject filter matching: `*` matches one token, a trailing `>` matches
/// one or more tokens.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::subject_matches;

    #[test]
    fn wildcards() {
        assert!(subject_matches("kannon.sending", "kannon.sending"));
        assert!(subject_matches("kannon.stats.>", "kannon.stats.delivered"));
        assert!(subject_matches("kannon.*.error", "kannon.stats.error"));
        assert!(!subject_matches("kannon.stats.>", "kannon.stats"));
        assert!(!subject_matches("kannon.stats.error", "kannon.stats.errors"));
        assert!(!subject_matches("kannon.stats", "kannon.stats.error"));
    }
}
