use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::PoolConfig;
use crate::pool_entry::{PoolEntry, PoolStatus, Recipient};
use crate::storage::{PoolStorage, PoolStorageError, StuckTtl};

#[derive(Debug)]
pub enum MemoryStorageError {
    NotFound,
}

impl Error for MemoryStorageError {}

impl PoolStorageError for MemoryStorageError {
    fn is_not_found(&self) -> bool {
        matches!(*self, MemoryStorageError::NotFound)
    }
}

impl fmt::Display for MemoryStorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MemoryStorageError::NotFound => write!(f, "Memory Storage Error: pool entry not found"),
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Sending pool kept in process memory
#[derive(Default)]
pub struct MemoryStorage {
    entries: BTreeMap<u64, PoolEntry>,
    index: HashMap<(String, String), u64>,
    next_id: u64,
    config: PoolConfig,
}

impl MemoryStorage {
    pub fn new(config: PoolConfig) -> MemoryStorage {
        MemoryStorage {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 1,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every row, in insertion order
    pub fn entries(&self) -> Vec<PoolEntry> {
        self.entries.values().cloned().collect()
    }

    fn entry_mut(
        &mut self,
        message_id: &str,
        email: &str,
    ) -> Result<&mut PoolEntry, MemoryStorageError> {
        let id = self
            .index
            .get(&(message_id.to_owned(), email.to_owned()))
            .ok_or(MemoryStorageError::NotFound)?;
        self.entries.get_mut(id).ok_or(MemoryStorageError::NotFound)
    }

    fn claim<F>(&mut self, max: usize, to: PoolStatus, eligible: F) -> Vec<PoolEntry>
    where
        F: Fn(&PoolEntry) -> bool,
    {
        let now = Utc::now();
        let mut ids: Vec<(DateTime<Utc>, u64)> = self
            .entries
            .values()
            .filter(|e| eligible(e))
            .map(|e| (e.scheduled_time, e.id))
            .collect();
        ids.sort();
        ids.truncate(max);

        let mut claimed = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.status = to;
                entry.updated_at = now;
                claimed.push(entry.clone());
            }
        }
        claimed
    }
}

impl PoolStorage for MemoryStorage {
    type Error = MemoryStorageError;

    fn add_recipients(
        &mut self,
        message_id: &str,
        domain: &str,
        recipients: Vec<Recipient>,
        scheduled_time: DateTime<Utc>,
    ) -> Result<usize, MemoryStorageError> {
        let now = Utc::now();
        let mut added = 0;
        for recipient in recipients {
            let key = (message_id.to_owned(), recipient.email.clone());
            if self.index.contains_key(&key) {
                debug!("(pool) skipping duplicate recipient {} of {}", recipient.email, message_id);
                continue;
            }
            let id = self.next_id.max(1);
            self.next_id = id + 1;
            self.entries.insert(
                id,
                PoolEntry {
                    id,
                    message_id: message_id.to_owned(),
                    domain: domain.to_owned(),
                    email: recipient.email,
                    fields: recipient.fields,
                    status: PoolStatus::Initializing,
                    scheduled_time,
                    original_scheduled_time: scheduled_time,
                    send_attempts_count: 0,
                    created_at: now,
                    updated_at: now,
                },
            );
            self.index.insert(key, id);
            added += 1;
        }
        Ok(added)
    }

    fn release_message(&mut self, message_id: &str) -> Result<usize, MemoryStorageError> {
        let now = Utc::now();
        let mut released = 0;
        for entry in self.entries.values_mut() {
            if entry.message_id == message_id && entry.status == PoolStatus::Initializing {
                entry.status = PoolStatus::ToValidate;
                entry.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    fn prepare_for_validate(&mut self, max: usize) -> Result<Vec<PoolEntry>, MemoryStorageError> {
        Ok(self.claim(max, PoolStatus::Validating, |e| e.status == PoolStatus::ToValidate))
    }

    fn prepare_for_send(&mut self, max: usize) -> Result<Vec<PoolEntry>, MemoryStorageError> {
        let now = Utc::now();
        Ok(self.claim(max, PoolStatus::Sending, |e| {
            e.status == PoolStatus::Scheduled && e.scheduled_time <= now
        }))
    }

    fn set_scheduled(&mut self, message_id: &str, email: &str) -> Result<(), MemoryStorageError> {
        let entry = self.entry_mut(message_id, email)?;
        entry.status = PoolStatus::Scheduled;
        entry.updated_at = Utc::now();
        Ok(())
    }

    fn clean_email(&mut self, message_id: &str, email: &str) -> Result<(), MemoryStorageError> {
        let id = self
            .index
            .remove(&(message_id.to_owned(), email.to_owned()))
            .ok_or(MemoryStorageError::NotFound)?;
        self.entries.remove(&id);
        Ok(())
    }

    fn reschedule_email(
        &mut self,
        message_id: &str,
        email: &str,
    ) -> Result<PoolEntry, MemoryStorageError> {
        let attempts = self.entry_mut(message_id, email)?.send_attempts_count;
        let delay = chrono_duration(self.config.resend_delay(attempts));

        let now = Utc::now();
        let entry = self.entry_mut(message_id, email)?;
        let mut next = now + delay;
        if next <= entry.scheduled_time {
            next = entry.scheduled_time + chrono::Duration::seconds(1);
        }
        entry.send_attempts_count += 1;
        entry.scheduled_time = next;
        entry.status = PoolStatus::Scheduled;
        entry.updated_at = now;
        Ok(entry.clone())
    }

    fn release_stuck(&mut self, ttl: StuckTtl) -> Result<usize, MemoryStorageError> {
        let now = Utc::now();
        let mut released = 0;
        for entry in self.entries.values_mut() {
            let (back_to, ttl) = match entry.status {
                PoolStatus::Validating => (PoolStatus::ToValidate, ttl.validating),
                PoolStatus::Sending => (PoolStatus::Scheduled, ttl.sending),
                _ => continue,
            };
            if entry.updated_at > now - chrono_duration(ttl) {
                continue;
            }
            warn!(
                "(pool) releasing stuck {:?} entry {} of {}",
                entry.status, entry.email, entry.message_id
            );
            entry.status = back_to;
            entry.updated_at = now;
            released += 1;
        }
        Ok(released)
    }

    fn retrieve(&self, message_id: &str, email: &str) -> Result<PoolEntry, MemoryStorageError> {
        let id = self
            .index
            .get(&(message_id.to_owned(), email.to_owned()))
            .ok_or(MemoryStorageError::NotFound)?;
        self.entries.get(id).cloned().ok_or(MemoryStorageError::NotFound)
    }
}
