//! The framing shared by every backend message.

use crate::error::ProtocolError;
use crate::MessageType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

fn nil_body() -> rmpv::Value {
    rmpv::Value::Nil
}

fn is_zero(value: &u8) -> bool {
    *value == 0
}

/// W3C-style causal trace context attached to an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TraceContext {
    /// 32 hex characters.
    pub trace_id: String,
    /// 16 hex characters.
    pub span_id: String,
    pub trace_flags: u8,
    pub session_id: String,
    pub user_id: String,
}

impl TraceContext {
    /// Creates a fresh, sampled root context.
    pub fn generate() -> Self {
        let trace_id = uuid::Uuid::new_v4().simple().to_string();
        let span_id = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        Self {
            trace_id,
            span_id,
            trace_flags: 0x01,
            ..Default::default()
        }
    }

    /// A context is usable only when both IDs are present.
    pub fn is_valid(&self) -> bool {
        !self.trace_id.is_empty() && !self.span_id.is_empty()
    }

    /// Renders the `traceparent` header value.
    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id, self.span_id, self.trace_flags
        )
    }
}

/// One frame on the backend connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(
        rename = "conversationId",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub conversation_id: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(default = "nil_body")]
    pub body: rmpv::Value,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub span_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub trace_flags: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
}

impl Envelope {
    /// Wraps a typed body.
    ///
    /// The body is converted through named MessagePack so struct fields stay
    /// keyed by name on the wire.
    pub fn new<T: Serialize>(
        conversation_id: impl Into<String>,
        message_type: MessageType,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let bytes = rmp_serde::to_vec_named(body)?;
        let body = rmpv::decode::read_value(&mut bytes.as_slice())
            .map_err(|e| ProtocolError::Body(e.to_string()))?;

        Ok(Self {
            conversation_id: conversation_id.into(),
            message_type,
            body,
            trace_id: String::new(),
            span_id: String::new(),
            trace_flags: 0,
            session_id: String::new(),
            user_id: String::new(),
        })
    }

    /// Copies the trace context into the envelope's trace fields.
    pub fn with_trace(mut self, trace: &TraceContext) -> Self {
        self.trace_id = trace.trace_id.clone();
        self.span_id = trace.span_id.clone();
        self.trace_flags = trace.trace_flags;
        if !trace.session_id.is_empty() {
            self.session_id = trace.session_id.clone();
        }
        if !trace.user_id.is_empty() {
            self.user_id = trace.user_id.clone();
        }
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Returns the trace context if both trace and span IDs are present.
    pub fn trace_context(&self) -> Option<TraceContext> {
        let trace = TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            trace_flags: self.trace_flags,
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
        };
        trace.is_valid().then_some(trace)
    }

    /// Decodes the body into the type selected by the tag.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &self.body)
            .map_err(|e| ProtocolError::Body(e.to_string()))?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
