//! NetCore message model: notifications, payload messages, the reliable wire envelope and
//! what the application handler receives.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NetCoreError;

/// Largest tag that fits in one UDP datagram.
pub const MAX_NOTIFICATION_LEN: usize = 65_507;

/// Tag-only, best-effort message. Travels over the unreliable channel only.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Notification {
    pub type_tag: String,
}

impl Notification {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
        }
    }

    /// Datagram bytes: the raw UTF-8 tag, no envelope.
    pub fn encode(&self) -> Result<&[u8], NetCoreError> {
        check_tag(&self.type_tag)?;
        Ok(self.type_tag.as_bytes())
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, NetCoreError> {
        let tag = std::str::from_utf8(datagram)
            .map_err(|e| NetCoreError::Malformed(format!("notification tag is not UTF-8: {e}")))?;
        check_tag(tag)?;
        Ok(Self::new(tag))
    }
}

fn check_tag(tag: &str) -> Result<(), NetCoreError> {
    if tag.is_empty() {
        return Err(NetCoreError::Malformed("empty type tag".into()));
    }
    if tag.len() > MAX_NOTIFICATION_LEN {
        return Err(NetCoreError::Malformed(format!(
            "type tag of {} bytes exceeds {MAX_NOTIFICATION_LEN}",
            tag.len()
        )));
    }
    Ok(())
}

/// Opaque payload. Both ends agree on what the bytes mean per type tag.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Value(pub Vec<u8>);

impl Value {
    /// Encode any serde value with bincode.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, NetCoreError> {
        Ok(Value(bincode::serialize(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, NetCoreError> {
        Ok(bincode::deserialize(&self.0)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value(bytes)
    }
}

/// Links a synced request to its response. Random v4 UUID, allocated by the caller.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn generate() -> Self {
        CorrelationId(Uuid::new_v4())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Application-level record for reliable traffic.
///
/// `correlation_id` is present only on synced requests and their responses.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PayloadMessage {
    pub type_tag: String,
    pub value: Option<Value>,
    pub correlation_id: Option<CorrelationId>,
    pub is_synced_call: bool,
}

impl PayloadMessage {
    /// Plain fire-and-forget payload.
    pub fn new(type_tag: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            type_tag: type_tag.into(),
            value,
            correlation_id: None,
            is_synced_call: false,
        }
    }

    pub fn validate(&self) -> Result<(), NetCoreError> {
        if self.type_tag.is_empty() {
            return Err(NetCoreError::Malformed("empty type tag".into()));
        }
        if self.is_synced_call && self.correlation_id.is_none() {
            return Err(NetCoreError::MissingCorrelationId);
        }
        Ok(())
    }
}

/// Reliable wire envelope. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Ordinary payload; no response expected.
    Payload {
        type_tag: String,
        value: Option<Value>,
    },
    /// Caller is blocked until a `SyncedResponse` with the same id comes back.
    SyncedRequest {
        correlation_id: CorrelationId,
        type_tag: String,
        value: Option<Value>,
    },
    /// Return value for a `SyncedRequest`; `value` is `None` when the callee set nothing.
    SyncedResponse {
        correlation_id: CorrelationId,
        type_tag: String,
        value: Option<Value>,
    },
}

impl Envelope {
    pub fn type_tag(&self) -> &str {
        match self {
            Envelope::Payload { type_tag, .. }
            | Envelope::SyncedRequest { type_tag, .. }
            | Envelope::SyncedResponse { type_tag, .. } => type_tag,
        }
    }
}

impl TryFrom<PayloadMessage> for Envelope {
    type Error = NetCoreError;

    fn try_from(msg: PayloadMessage) -> Result<Self, Self::Error> {
        msg.validate()?;
        let PayloadMessage {
            type_tag,
            value,
            correlation_id,
            is_synced_call,
        } = msg;
        Ok(match (correlation_id, is_synced_call) {
            (Some(correlation_id), true) => Envelope::SyncedRequest {
                correlation_id,
                type_tag,
                value,
            },
            (Some(correlation_id), false) => Envelope::SyncedResponse {
                correlation_id,
                type_tag,
                value,
            },
            (None, _) => Envelope::Payload { type_tag, value },
        })
    }
}

impl From<Envelope> for PayloadMessage {
    fn from(env: Envelope) -> Self {
        match env {
            Envelope::Payload { type_tag, value } => PayloadMessage::new(type_tag, value),
            Envelope::SyncedRequest {
                correlation_id,
                type_tag,
                value,
            } => PayloadMessage {
                type_tag,
                value,
                correlation_id: Some(correlation_id),
                is_synced_call: true,
            },
            Envelope::SyncedResponse {
                correlation_id,
                type_tag,
                value,
            } => PayloadMessage {
                type_tag,
                value,
                correlation_id: Some(correlation_id),
                is_synced_call: false,
            },
        }
    }
}

/// Incoming synced call. The handler may set the return value once; the channel sends it
/// back when the handler returns.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyncedRequest {
    correlation_id: CorrelationId,
    type_tag: String,
    value: Option<Value>,
    return_value: Option<Value>,
}

impl SyncedRequest {
    pub fn new(correlation_id: CorrelationId, type_tag: String, value: Option<Value>) -> Self {
        Self {
            correlation_id,
            type_tag,
            value,
            return_value: None,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn set_return_value(&mut self, value: Value) -> Result<(), NetCoreError> {
        if self.return_value.is_some() {
            return Err(NetCoreError::ReturnValueAlreadySet);
        }
        self.return_value = Some(value);
        Ok(())
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    /// The response frame that unblocks the remote caller.
    pub fn into_response(self) -> Envelope {
        Envelope::SyncedResponse {
            correlation_id: self.correlation_id,
            type_tag: self.type_tag,
            value: self.return_value,
        }
    }
}

/// What the application handler sees. Dispatched from either channel's listener thread.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Inbound {
    Notification(Notification),
    Payload {
        type_tag: String,
        value: Option<Value>,
    },
    SyncedRequest(SyncedRequest),
}

impl Inbound {
    pub fn type_tag(&self) -> &str {
        match self {
            Inbound::Notification(n) => &n.type_tag,
            Inbound::Payload { type_tag, .. } => type_tag,
            Inbound::SyncedRequest(req) => req.type_tag(),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Inbound::Notification(_) => None,
            Inbound::Payload { value, .. } => value.as_ref(),
            Inbound::SyncedRequest(req) => req.value(),
        }
    }

    /// Decode the value with bincode; `None` if the message carries none.
    pub fn decode_value<T: DeserializeOwned>(&self) -> Result<Option<T>, NetCoreError> {
        self.value().map(|v| v.decode::<T>()).transpose()
    }

    pub fn is_synced_request(&self) -> bool {
        matches!(self, Inbound::SyncedRequest(_))
    }

    /// Only valid for synced requests, and only once.
    pub fn set_return_value(&mut self, value: Value) -> Result<(), NetCoreError> {
        match self {
            Inbound::SyncedRequest(req) => req.set_return_value(value),
            _ => Err(NetCoreError::NotSyncedRequest),
        }
    }
}
