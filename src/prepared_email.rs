use crate::error::Error;

/// An email rendered, signed and ready for delivery to one recipient. This is
/// the payload of `kannon.sending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EmailToSend {
    pub to: String,
    /// Envelope sender
    pub return_path: String,
    /// The complete MIME message
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Encoded [`EmailId`](crate::email_id::EmailId)
    pub email_id: String,
    /// When false, a transient failure is final
    pub should_retry: bool,
}

impl EmailToSend {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<EmailToSend, Error> {
        Ok(serde_json::from_slice(payload)?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(D::Error::custom)
    }
}
