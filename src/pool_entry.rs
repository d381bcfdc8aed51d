use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Where a recipient currently sits in the send pipeline. Delivered, bounced
/// and rejected recipients have no status: their row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Inserted by the submission path, not yet released for validation
    Initializing,
    ToValidate,
    /// Claimed by a validator cycle
    Validating,
    /// Waiting for `scheduled_time`
    Scheduled,
    /// Claimed by a dispatch cycle and handed to the sending queue
    Sending,
}

/// One recipient of one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    /// Store-assigned identifier
    pub id: u64,

    /// Groups all recipients of one logical send
    pub message_id: String,

    /// The sending tenant's domain
    pub domain: String,

    /// The recipient's email address
    pub email: String,

    /// Per-recipient template substitutions
    pub fields: BTreeMap<String, String>,

    pub status: PoolStatus,

    /// Next instant this recipient is eligible to be sent
    pub scheduled_time: DateTime<Utc>,

    /// The instant requested at submission. Never changes.
    pub original_scheduled_time: DateTime<Utc>,

    /// Incremented on every transient failure
    pub send_attempts_count: u32,

    pub created_at: DateTime<Utc>,

    /// Instant of the last status transition
    pub updated_at: DateTime<Utc>,
}

/// A recipient as handed over by the submission path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub fields: BTreeMap<String, String>,
}

impl Recipient {
    pub fn new(email: &str) -> Recipient {
        Recipient {
            email: email.to_owned(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Recipient {
        self.fields.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// A fresh message id in the `msg_<uuid>@<domain>` form used at submission
pub fn new_message_id(domain: &str) -> String {
    format!("msg_{}@{}", Uuid::new_v4().simple(), domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique_per_call() {
        let a = new_message_id("example.com");
        let b = new_message_id("example.com");
        assert_ne!(a, b);
        assert!(a.starts_with("msg_"));
        assert!(a.ends_with("@example.com"));
        assert_eq!(a.len(), "msg_".len() + 32 + "@example.com".len());
    }
}
