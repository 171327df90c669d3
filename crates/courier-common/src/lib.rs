// Shared data types for the subscriber and transaction crates.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid subscription path: {0}")]
    InvalidSubscription(String),
    #[error("invalid ack id")]
    EmptyAckId,
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),
}

/// Fully qualified subscription name, e.g. `projects/p/subscriptions/s`.
///
/// ```
/// use courier_common::SubscriptionPath;
///
/// let path = SubscriptionPath::new("projects/test/subscriptions/orders").expect("path");
/// assert_eq!(path.as_str(), "projects/test/subscriptions/orders");
/// assert!(SubscriptionPath::new("orders").is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionPath(Arc<str>);

impl SubscriptionPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        // projects/<project>/subscriptions/<name>
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != 4
            || parts[0] != "projects"
            || parts[2] != "subscriptions"
            || parts[1].is_empty()
            || parts[3].is_empty()
        {
            return Err(Error::InvalidSubscription(path));
        }
        Ok(Self(path.into()))
    }

    pub fn from_parts(project: &str, subscription: &str) -> Result<Self> {
        Self::new(format!("projects/{project}/subscriptions/{subscription}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token naming one delivery attempt of a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckId(Arc<str>);

impl AckId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::EmptyAckId);
        }
        Ok(Self(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable message as produced by the source.
///
/// ```
/// use bytes::Bytes;
/// use courier_common::Message;
///
/// let message = Message::new("m-1", Bytes::from_static(b"hello")).with_attribute("k", "v");
/// assert_eq!(message.data(), &Bytes::from_static(b"hello"));
/// assert_eq!(message.attributes().get("k").map(String::as_str), Some("v"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    message_id: String,
    #[serde(with = "base64_bytes")]
    data: Bytes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
    publish_time: SystemTime,
}

impl Message {
    pub fn new(message_id: impl Into<String>, data: Bytes) -> Self {
        Self {
            message_id: message_id.into(),
            data,
            attributes: BTreeMap::new(),
            publish_time: SystemTime::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_publish_time(mut self, publish_time: SystemTime) -> Self {
        self.publish_time = publish_time;
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn publish_time(&self) -> SystemTime {
        self.publish_time
    }

    /// Size charged against byte-based flow control.
    pub fn size(&self) -> usize {
        self.data.len()
            + self.message_id.len()
            + self
                .attributes
                .iter()
                .map(|(key, value)| key.len() + value.len())
                .sum::<usize>()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Encode)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Decode)
    }
}

/// One element of a streaming pull response batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulledMessage {
    pub ack_id: AckId,
    pub message: Message,
}

/// Initial request sent when a pull stream is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingPullRequest {
    pub subscription: SubscriptionPath,
    pub stream_ack_deadline_seconds: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingPullResponse {
    pub received_messages: Vec<PulledMessage>,
}

impl StreamingPullResponse {
    pub fn new(received_messages: Vec<PulledMessage>) -> Self {
        Self { received_messages }
    }

    pub fn is_empty(&self) -> bool {
        self.received_messages.is_empty()
    }
}

mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::Deserialize;
    use serde::de::Error;

    // Encode payload bytes as a base64 string for JSON.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}
