//! Window protocol codec — the envelopes placed on the broadcast window and
//! the frames exchanged over private ports.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::InstanceId;

/// Prefix shared by every protocol tag so that other protocols (or other
/// versions of this one) on the same window cannot collide with ours.
pub const TAG_PREFIX: &str = "@bridge/messaging/window";

pub const REQUEST_TYPE: &str = "@bridge/messaging/window";
pub const RESPONSE_TYPE: &str = "@bridge/messaging/window/response";
pub const HANDSHAKE_START_TYPE: &str = "@bridge/messaging/window/handshake-start";
pub const HANDSHAKE_COMPLETE_TYPE: &str = "@bridge/messaging/window/handshake-complete";
pub const TRANSFER_PORT_START_TYPE: &str = "@bridge/messaging/window/transfer-port-start";
pub const TRANSFER_PORT_COMPLETE_TYPE: &str = "@bridge/messaging/window/transfer-port-complete";

/// The protocol-level kind of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    #[serde(rename = "@bridge/messaging/window")]
    Request,
    #[serde(rename = "@bridge/messaging/window/response")]
    Response,
    #[serde(rename = "@bridge/messaging/window/handshake-start")]
    HandshakeStart,
    #[serde(rename = "@bridge/messaging/window/handshake-complete")]
    HandshakeComplete,
    #[serde(rename = "@bridge/messaging/window/transfer-port-start")]
    TransferPortStart,
    #[serde(rename = "@bridge/messaging/window/transfer-port-complete")]
    TransferPortComplete,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 6] = [
        Self::Request,
        Self::Response,
        Self::HandshakeStart,
        Self::HandshakeComplete,
        Self::TransferPortStart,
        Self::TransferPortComplete,
    ];

    /// The literal tag carried in the `type` field.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Request => REQUEST_TYPE,
            Self::Response => RESPONSE_TYPE,
            Self::HandshakeStart => HANDSHAKE_START_TYPE,
            Self::HandshakeComplete => HANDSHAKE_COMPLETE_TYPE,
            Self::TransferPortStart => TRANSFER_PORT_START_TYPE,
            Self::TransferPortComplete => TRANSFER_PORT_COMPLETE_TYPE,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

/// The caller-visible unit of an RPC call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessage {
    /// Per-messenger call counter, for log correlation only.
    pub id: u64,
    /// Message kind; selects both the remote handler and the private channel.
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl LogicalMessage {
    pub fn new(id: u64, kind: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// The only shape ever placed on the broadcast window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub protocol_kind: ProtocolKind,
    pub message: LogicalMessage,
    pub namespace: String,
    pub instance_id: InstanceId,
    /// Informational only; never used for access control.
    pub sender_origin: String,
}

impl Envelope {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode an envelope from raw window data. Anything that is not a
    /// well-formed envelope of this protocol yields `None`.
    pub fn decode(data: &Value) -> Option<Self> {
        Self::deserialize(data).ok()
    }
}

/// Identity stamped onto every envelope a messenger produces.
#[derive(Debug, Clone)]
pub struct EnvelopeStamp {
    pub namespace: String,
    pub instance_id: InstanceId,
    pub sender_origin: String,
}

impl EnvelopeStamp {
    pub fn envelope(&self, protocol_kind: ProtocolKind, message: &LogicalMessage) -> Envelope {
        Envelope {
            protocol_kind,
            message: message.clone(),
            namespace: self.namespace.clone(),
            instance_id: self.instance_id.clone(),
            sender_origin: self.sender_origin.clone(),
        }
    }

    /// Whether `envelope` was produced by this very messenger.
    pub fn is_own(&self, envelope: &Envelope) -> bool {
        envelope.instance_id == self.instance_id
    }

    /// Same namespace and a different instance: a genuine remote envelope.
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        envelope.namespace == self.namespace && !self.is_own(envelope)
    }
}

/// The response leg, posted on a private port only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "type")]
    pub protocol_kind: ProtocolKind,
    pub response: Value,
}

impl ResponseFrame {
    pub fn new(response: Option<Value>) -> Self {
        Self {
            protocol_kind: ProtocolKind::Response,
            response: response.unwrap_or(Value::Null),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Traffic arriving on a private port, classified by its tag.
#[derive(Debug, Clone, PartialEq)]
pub enum PortFrame {
    Request(Envelope),
    Response(Value),
    TransferPortComplete(Envelope),
}

impl PortFrame {
    pub fn decode(data: &Value) -> Option<Self> {
        let tag = data.get("type")?.as_str()?;
        match ProtocolKind::from_tag(tag)? {
            ProtocolKind::Request => Envelope::decode(data).map(Self::Request),
            ProtocolKind::TransferPortComplete => {
                Envelope::decode(data).map(Self::TransferPortComplete)
            }
            ProtocolKind::Response => ResponseFrame::deserialize(data)
                .ok()
                .map(|frame| Self::Response(frame.response)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
