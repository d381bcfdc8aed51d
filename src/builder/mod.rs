//! Turns a pool entry into a rendered, signed [`EmailToSend`].

pub mod store;
pub mod template;

pub use self::store::{Attachment, DomainKeys, MemoryMessageStore, MessageData, MessageStore};

use std::fmt;

use lettre::message::dkim::{DkimConfig, DkimSigningAlgorithm, DkimSigningKey};
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, Message, MultiPart, SinglePart};
use lettre::Address;

use crate::email_id::EmailId;
use crate::pool_entry::PoolEntry;
use crate::prepared_email::EmailToSend;

#[derive(Debug)]
pub enum BuildError {
    MessageNotFound(String),
    DomainNotFound(String),
    Address(String),
    Mime(String),
    Dkim(String),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            BuildError::MessageNotFound(ref id) => write!(f, "message {} not found", id),
            BuildError::DomainNotFound(ref d) => write!(f, "domain {} not found", d),
            BuildError::Address(ref s) => write!(f, "invalid address: {}", s),
            BuildError::Mime(ref s) => write!(f, "cannot build MIME message: {}", s),
            BuildError::Dkim(ref s) => write!(f, "cannot DKIM sign: {}", s),
        }
    }
}

impl std::error::Error for BuildError {}

/// Renders the email for one pool entry
pub trait MailBuilder: Send + Sync {
    fn build_email(&self, entry: &PoolEntry) -> Result<EmailToSend, BuildError>;
}

/// Builds from templates held in a [`MessageStore`]
pub struct TemplateMailBuilder<M: MessageStore> {
    store: M,
    max_send_attempts: u32,
}

fn parse_address(address: &str) -> Result<Address, BuildError> {
    address
        .parse()
        .map_err(|e| BuildError::Address(format!("{:?}: {}", address, e)))
}

impl<M: MessageStore> TemplateMailBuilder<M> {
    pub fn new(store: M, max_send_attempts: u32) -> TemplateMailBuilder<M> {
        TemplateMailBuilder {
            store,
            max_send_attempts,
        }
    }

    pub fn store(&self) -> &M {
        &self.store
    }

    fn sign(
        &self,
        message: &mut Message,
        domain: &str,
        keys: &DomainKeys,
    ) -> Result<(), BuildError> {
        let pem = match keys.dkim_private_key {
            Some(ref pem) => pem,
            None => {
                warn!("(builder) no DKIM key for {}, sending unsigned", domain);
                return Ok(());
            }
        };
        let key = DkimSigningKey::new(pem, DkimSigningAlgorithm::Rsa)
            .map_err(|e| BuildError::Dkim(format!("{:?}", e)))?;
        let config = DkimConfig::default_config(keys.dkim_selector.clone(), domain.to_owned(), key);
        message.sign(&config);
        Ok(())
    }
}

impl<M: MessageStore> MailBuilder for TemplateMailBuilder<M> {
    fn build_email(&self, entry: &PoolEntry) -> Result<EmailToSend, BuildError> {
        let data = self
            .store
            .message(&entry.message_id)
            .ok_or_else(|| BuildError::MessageNotFound(entry.message_id.clone()))?;
        let keys = self
            .store
            .domain(&entry.domain)
            .ok_or_else(|| BuildError::DomainNotFound(entry.domain.clone()))?;

        let email_id = EmailId::new(&entry.email, &entry.message_id, &entry.domain);

        let mut fields = entry.fields.clone();
        fields
            .entry("email".to_owned())
            .or_insert_with(|| entry.email.clone());
        let html = template::render(&data.html, &fields).into_owned();
        let subject = template::render(&data.subject, &fields).into_owned();

        let builder = Message::builder()
            .from(Mailbox::new(
                Some(data.sender_alias.clone()),
                parse_address(&data.sender_email)?,
            ))
            .to(Mailbox::new(None, parse_address(&entry.email)?))
            .subject(subject)
            .message_id(Some(email_id.header_value()))
            .date_now();

        let built = if data.attachments.is_empty() {
            builder.singlepart(SinglePart::html(html))
        } else {
            let mut parts = MultiPart::mixed().singlepart(SinglePart::html(html));
            for attachment in &data.attachments {
                let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                    BuildError::Mime(format!("{}: {}", attachment.filename, e))
                })?;
                parts = parts.singlepart(
                    MimeAttachment::new(attachment.filename.clone())
                        .body(attachment.content.clone(), content_type),
                );
            }
            builder.multipart(parts)
        };
        let mut message = built.map_err(|e| BuildError::Mime(format!("{}", e)))?;

        self.sign(&mut message, &entry.domain, &keys)?;

        Ok(EmailToSend {
            to: entry.email.clone(),
            return_path: data.sender_email.clone(),
            body: message.formatted(),
            email_id: email_id.to_string(),
            should_retry: entry.send_attempts_count + 1 < self.max_send_attempts,
        })
    }
}
