//! Binary protocol between sync clients and the authority.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬──────────┬───────────┬──────────┐
//! │ msg_type │ request_id │ doc_id   │ client_id │ payload  │
//! │ 1 byte   │ varint     │ string   │ 16 bytes  │ variable │
//! └──────────┴────────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! Requests on the sync socket carry a caller-chosen `request_id`; every
//! response echoes it. Pokes and pings on the poke socket use id 0.

use mapsync_core::{FeatureCollectionDocument, Mutation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Request the current authoritative document
    Pull = 1,
    /// Submit pending mutations, payload is a [`PushRequest`]
    Push = 2,
    /// Response to `Pull`, payload is a [`FeatureCollectionDocument`]
    Snapshot = 3,
    /// Response to `Push`, payload is a [`PushAck`]
    PushAck = 4,
    /// Failed request, payload is an [`ErrorPayload`]
    Error = 5,
    /// Content-free "pull latest state" notification
    Poke = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub mutations: Vec<Mutation>,
}

/// Result of one pushed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationStatus {
    Applied,
    /// Already applied by an earlier delivery; nothing changed.
    Duplicate,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub mutation_id: Uuid,
    pub status: MutationStatus,
}

/// Authority's answer to a push.
///
/// `base_version` is the document version the push was applied on top of;
/// `version` is the version after it. A client whose base is still at
/// `base_version` can fold the applied mutations in without pulling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    pub base_version: u64,
    pub version: u64,
    pub outcomes: Vec<MutationOutcome>,
}

impl PushAck {
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == MutationStatus::Applied)
            .count()
    }

    pub fn status_of(&self, mutation_id: Uuid) -> Option<&MutationStatus> {
        self.outcomes
            .iter()
            .find(|o| o.mutation_id == mutation_id)
            .map(|o| &o.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Correlates a response with its request; 0 for unsolicited frames
    pub request_id: u64,
    /// Document the frame refers to; empty for heartbeats
    pub doc_id: String,
    /// Sender of a request (nil for frames sent by the authority)
    pub client_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, request_id: u64, doc_id: impl Into<String>, client_id: Uuid) -> Self {
        Self {
            msg_type,
            request_id,
            doc_id: doc_id.into(),
            client_id,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, ProtocolError> {
        self.payload = encode_payload(payload)?;
        Ok(self)
    }

    pub fn pull(request_id: u64, doc_id: impl Into<String>, client_id: Uuid) -> Self {
        Self::new(MessageType::Pull, request_id, doc_id, client_id)
    }

    pub fn push(
        request_id: u64,
        doc_id: impl Into<String>,
        client_id: Uuid,
        request: &PushRequest,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Push, request_id, doc_id, client_id).with_payload(request)
    }

    pub fn snapshot(request_id: u64, doc: &FeatureCollectionDocument) -> Result<Self, ProtocolError> {
        Self::new(MessageType::Snapshot, request_id, doc.id.as_str(), Uuid::nil()).with_payload(doc)
    }

    pub fn push_ack(
        request_id: u64,
        doc_id: impl Into<String>,
        ack: &PushAck,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::PushAck, request_id, doc_id, Uuid::nil()).with_payload(ack)
    }

    pub fn error(request_id: u64, doc_id: impl Into<String>, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            message: message.into(),
        };
        let msg = Self::new(MessageType::Error, request_id, doc_id, Uuid::nil());
        // An ErrorPayload is a single string; encoding it cannot fail.
        let bytes = encode_payload(&payload).unwrap_or_default();
        Self { payload: bytes, ..msg }
    }

    pub fn poke(doc_id: impl Into<String>) -> Self {
        Self::new(MessageType::Poke, 0, doc_id, Uuid::nil())
    }

    pub fn ping(request_id: u64, client_id: Uuid) -> Self {
        Self::new(MessageType::Ping, request_id, "", client_id)
    }

    pub fn pong(request_id: u64) -> Self {
        Self::new(MessageType::Pong, request_id, "", Uuid::nil())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn typed_payload<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedMessage {
                expected,
                actual: self.msg_type,
            });
        }
        decode_payload(&self.payload)
    }

    pub fn push_request(&self) -> Result<PushRequest, ProtocolError> {
        self.typed_payload(MessageType::Push)
    }

    pub fn document(&self) -> Result<FeatureCollectionDocument, ProtocolError> {
        self.typed_payload(MessageType::Snapshot)
    }

    pub fn ack(&self) -> Result<PushAck, ProtocolError> {
        self.typed_payload(MessageType::PushAck)
    }

    pub fn error_message(&self) -> Result<String, ProtocolError> {
        self.typed_payload::<ErrorPayload>(MessageType::Error)
            .map(|p| p.message)
    }
}

fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(payload, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {actual:?}")]
    UnexpectedMessage {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
}
