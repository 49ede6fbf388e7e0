//! Session-level and invoke-level message types carried inside envelopes.
//!
//! A session message is `{"type": "stream"|"end"|"error"|"invoke", "data": ...}`.
//! Handlers produce [`InvokeMessage`]s, which travel as the `data` of `stream`
//! session messages. The `type` tag of an invoke message alone decides the
//! shape of its `message` payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::BlobChunk;
use crate::error::{ErrorCode, InvocationError};

/// Kind of a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMessageType {
    Stream,
    End,
    Error,
    Invoke,
}

/// Payload of a `session` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    #[serde(rename = "type")]
    pub kind: SessionMessageType,
    #[serde(default)]
    pub data: Value,
}

impl SessionMessage {
    pub fn new(kind: SessionMessageType, data: Value) -> Self {
        Self { kind, data }
    }

    pub fn stream(data: Value) -> Self {
        Self::new(SessionMessageType::Stream, data)
    }

    pub fn end() -> Self {
        Self::new(SessionMessageType::End, Value::Object(Default::default()))
    }

    pub fn error(err: &InvocationError) -> Self {
        let payload = ErrorPayload {
            code: err.code,
            message: err.message.clone(),
        };
        Self::new(
            SessionMessageType::Error,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    pub fn invoke(data: Value) -> Self {
        Self::new(SessionMessageType::Invoke, data)
    }

    /// `end` and `error` close a session; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, SessionMessageType::End | SessionMessageType::Error)
    }
}

/// Body of a session `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonMessage {
    pub json_object: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMessage {
    #[serde(with = "base64_bytes")]
    pub blob: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableMessage {
    pub variable_name: String,
    pub variable_value: Value,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Start,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub data: Value,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieverResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieverResourceMessage {
    pub retriever_resources: Vec<RetrieverResource>,
    pub context: String,
}

/// Output unit of a capability invocation, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum InvokeMessage {
    Text(TextMessage),
    Json(JsonMessage),
    Blob(BlobMessage),
    BlobChunk(BlobChunk),
    Link(TextMessage),
    Image(TextMessage),
    ImageLink(TextMessage),
    Variable(VariableMessage),
    Log(LogMessage),
    RetrieverResources(RetrieverResourceMessage),
}

impl InvokeMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextMessage { text: text.into() })
    }

    pub fn json(value: Value) -> Self {
        Self::Json(JsonMessage { json_object: value })
    }

    pub fn blob(blob: Vec<u8>) -> Self {
        Self::Blob(BlobMessage { blob, meta: None })
    }

    pub fn link(link: impl Into<String>) -> Self {
        Self::Link(TextMessage { text: link.into() })
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::Image(TextMessage { text: url.into() })
    }

    pub fn variable(name: impl Into<String>, value: Value, stream: bool) -> Self {
        Self::Variable(VariableMessage {
            variable_name: name.into(),
            variable_value: value,
            stream,
        })
    }

    pub fn log(label: impl Into<String>, data: Value, status: LogStatus) -> Self {
        Self::Log(LogMessage {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            data,
            status,
            parent_id: None,
            metadata: None,
        })
    }

    pub fn retriever_resources(resources: Vec<RetrieverResource>, context: impl Into<String>) -> Self {
        Self::RetrieverResources(RetrieverResourceMessage {
            retriever_resources: resources,
            context: context.into(),
        })
    }
}

/// Serde adapter storing binary payloads as base64 strings on the wire.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
