//! Correlation token carried by every queued email.
//!
//! The sender recovers recipient, message and tenant from it without reading
//! the pool. Version 1 layout:
//!
//! ```text
//! v1.<base64url(email)>.<base64url(message_id)>@<domain>
//! ```
//!
//! Base64 is URL-safe without padding, so neither `.` nor `@` can appear
//! inside an encoded part. The token doubles as the Message-ID header, wrapped
//! in angle brackets.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

const VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailId {
    pub email: String,
    pub message_id: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailIdError {
    Malformed(String),
    UnknownVersion(String),
}

impl fmt::Display for EmailIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EmailIdError::Malformed(ref s) => write!(f, "malformed email id: {}", s),
            EmailIdError::UnknownVersion(ref v) => write!(f, "unknown email id version: {}", v),
        }
    }
}

impl std::error::Error for EmailIdError {}

impl EmailId {
    pub fn new(email: &str, message_id: &str, domain: &str) -> EmailId {
        EmailId {
            email: email.to_owned(),
            message_id: message_id.to_owned(),
            domain: domain.to_owned(),
        }
    }

    /// Value for the Message-ID header
    pub fn header_value(&self) -> String {
        format!("<{}>", self)
    }
}

impl fmt::Display for EmailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}@{}",
            VERSION,
            URL_SAFE_NO_PAD.encode(&self.email),
            URL_SAFE_NO_PAD.encode(&self.message_id),
            self.domain
        )
    }
}

fn decode_part(part: &str, token: &str) -> Result<String, EmailIdError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| EmailIdError::Malformed(token.to_owned()))?;
    String::from_utf8(bytes).map_err(|_| EmailIdError::Malformed(token.to_owned()))
}

impl FromStr for EmailId {
    type Err = EmailIdError;

    fn from_str(s: &str) -> Result<EmailId, EmailIdError> {
        let token = s.trim().trim_start_matches('<').trim_end_matches('>');
        let malformed = || EmailIdError::Malformed(token.to_owned());

        let (parts, domain) = token.rsplit_once('@').ok_or_else(malformed)?;
        let mut parts = parts.split('.');
        let next = (parts.next(), parts.next(), parts.next(), parts.next());
        let (version, email, message_id) = match next {
            (Some(v), Some(e), Some(m), None) => (v, e, m),
            _ => return Err(malformed()),
        };
        if version != VERSION {
            return Err(EmailIdError::UnknownVersion(version.to_owned()));
        }
        if domain.is_empty() || email.is_empty() || message_id.is_empty() {
            return Err(malformed());
        }

        Ok(EmailId {
            email: decode_part(email, token)?,
            message_id: decode_part(message_id, token)?,
            domain: domain.to_owned(),
        })
    }
}
