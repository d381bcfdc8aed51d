use std::collections::HashMap;
use std::sync::RwLock;

/// A file attached to every recipient's copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// What was submitted for a message, shared by all its recipients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub sender_email: String,
    pub sender_alias: String,
    pub subject: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
}

/// Signing material of a sending domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainKeys {
    pub dkim_selector: String,
    /// PKCS#1 PEM RSA private key. Mail is sent unsigned without one.
    pub dkim_private_key: Option<String>,
}

/// Read access to messages and domains, which are owned by the API side
pub trait MessageStore: Send + Sync {
    fn message(&self, message_id: &str) -> Option<MessageData>;
    fn domain(&self, domain: &str) -> Option<DomainKeys>;
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<String, MessageData>>,
    domains: RwLock<HashMap<String, DomainKeys>>,
}

impl MemoryMessageStore {
    pub fn new() -> MemoryMessageStore {
        MemoryMessageStore::default()
    }

    pub fn add_message(&self, message_id: &str, data: MessageData) {
        if let Ok(mut messages) = self.messages.write() {
            messages.insert(message_id.to_owned(), data);
        }
    }

    pub fn add_domain(&self, domain: &str, keys: DomainKeys) {
        if let Ok(mut domains) = self.domains.write() {
            domains.insert(domain.to_owned(), keys);
        }
    }
}

impl MessageStore for MemoryMessageStore {
    fn message(&self, message_id: &str) -> Option<MessageData> {
        self.messages.read().ok()?.get(message_id).cloned()
    }

    fn domain(&self, domain: &str) -> Option<DomainKeys> {
        self.domains.read().ok()?.get(domain).cloned()
    }
}
