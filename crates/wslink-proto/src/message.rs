//! Envelope, message ids and error payloads

use crate::{ProtocolError, Value};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Protocol version carried in every envelope
pub const PROTOCOL_VERSION: &str = "1.0";

/// Method name of the handshake request
pub const HELLO_METHOD: &str = "wslink.hello";

/// Method name of the legacy attachment declaration notification
pub const ATTACHMENT_METHOD: &str = "wslink.binary.attachment";

/// Message id class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Request issued by this client
    Rpc,
    /// Server-pushed topic event
    Publish,
    /// Protocol housekeeping (handshake)
    System,
}

impl MessageClass {
    /// Wire name of the class
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Publish => "publish",
            Self::System => "system",
        }
    }
}

/// Parsed `<class>:<token>:<sequence>` message id
///
/// For `rpc` ids the token is the client id and the sequence a per-session
/// counter. For `publish` ids the token is the dot-separated topic and the
/// sequence is assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// Id class
    pub class: MessageClass,
    /// Client id, topic name or system token
    pub token: String,
    /// Sequence number
    pub sequence: u64,
}

impl MessageId {
    /// Create an rpc id
    pub fn rpc(client_id: impl Into<String>, sequence: u64) -> Self {
        Self { class: MessageClass::Rpc, token: client_id.into(), sequence }
    }

    /// Create a publish id
    pub fn publish(topic: impl Into<String>, sequence: u64) -> Self {
        Self { class: MessageClass::Publish, token: topic.into(), sequence }
    }

    /// The reserved handshake id `system:c0:0`
    pub fn handshake() -> Self {
        Self { class: MessageClass::System, token: "c0".to_string(), sequence: 0 }
    }

    /// Check for the reserved handshake id
    pub fn is_handshake(&self) -> bool {
        self.class == MessageClass::System && self.token == "c0" && self.sequence == 0
    }

    /// Topic name, for publish ids
    pub fn topic(&self) -> Option<&str> {
        match self.class {
            MessageClass::Publish => Some(&self.token),
            _ => None,
        }
    }
}

fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.split('.').all(|word| {
            !word.is_empty() && word.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        })
}

impl FromStr for MessageId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidMessageId(s.to_string());

        let mut parts = s.splitn(3, ':');
        let (Some(class), Some(token), Some(sequence)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let class = match class {
            "rpc" => MessageClass::Rpc,
            "publish" => MessageClass::Publish,
            "system" => MessageClass::System,
            _ => return Err(invalid()),
        };

        if !is_valid_token(token) || sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let sequence = sequence.parse().map_err(|_| invalid())?;

        Ok(Self { class, token: token.to_string(), sequence })
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.class.as_str(), self.token, self.sequence)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Structured error carried by a failure reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code
    pub code: i64,
    /// Human-readable error message
    pub message: String,
    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create a new error payload
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    /// Attach error data
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Logical protocol message: request, reply or notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version
    #[serde(rename = "wslink", default = "default_version")]
    pub version: String,
    /// Message id; absent on notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Method name, on requests and notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Positional arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Keyword arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<BTreeMap<String, Value>>,
    /// Success payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Envelope {
    fn empty() -> Self {
        Self {
            version: default_version(),
            id: None,
            method: None,
            args: None,
            kwargs: None,
            result: None,
            error: None,
        }
    }

    /// Create a request envelope
    pub fn request(
        id: MessageId,
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: Some(id),
            method: Some(method.into()),
            args: Some(args),
            kwargs: Some(kwargs),
            ..Self::empty()
        }
    }

    /// Create the handshake request carrying the shared secret
    pub fn hello(secret: &str) -> Self {
        let credentials: Value = [("secret", secret)].into_iter().collect();
        Self::request(MessageId::handshake(), HELLO_METHOD, vec![credentials], BTreeMap::new())
    }

    /// Create a success reply
    pub fn reply(id: MessageId, result: impl Into<Value>) -> Self {
        Self { id: Some(id), result: Some(result.into()), ..Self::empty() }
    }

    /// Create a failure reply
    pub fn error_reply(id: MessageId, error: RpcError) -> Self {
        Self { id: Some(id), error: Some(error), ..Self::empty() }
    }

    /// Create a notification (no id)
    pub fn notification(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self { method: Some(method.into()), args: Some(args), ..Self::empty() }
    }

    /// Create a legacy attachment declaration for the given keys
    pub fn attachment_header<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys.into_iter().map(|k| Value::String(k.into())).collect();
        Self::notification(ATTACHMENT_METHOD, keys)
    }

    /// Check for the legacy attachment declaration notification
    pub fn is_attachment_header(&self) -> bool {
        self.id.is_none() && self.method.as_deref() == Some(ATTACHMENT_METHOD)
    }

    /// Serialize to MessagePack bytes, fields keyed by name
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON text
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
