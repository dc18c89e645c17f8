// Wire types shared by the HTTP facade, the WebSocket pump and the client

use crate::hub::registry::Identity;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A recipient list plus an opaque payload.
///
/// On the wire `Data` is standard base64, so arbitrary bytes survive
/// a JSON text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Comma separated recipient identities
    #[serde(rename = "Recipients", default)]
    pub recipients: String,

    /// Payload bytes
    #[serde(rename = "Data", default, with = "base64_data")]
    pub data: Bytes,
}

impl Envelope {
    pub fn new(recipients: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            recipients: recipients.into(),
            data: data.into(),
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Response body of the identity listing endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(rename = "IDs", default)]
    pub ids: Vec<Identity>,
}

mod base64_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
            None => Ok(Bytes::new()),
        }
    }
}
