//! Invocation wire format.
//!
//! Invocations travel as a JSON object `{id, task, args, kwargs, eta?, expires?}`
//! tagged `application/json`. Workers refuse content types outside the
//! configured accept list.

use crate::message::{Envelope, CONTENT_TYPE_JSON};
use crate::{Result, TaskError, TaskId, TaskInvocation};
use serde::Deserialize;

/// Serializer names understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerKind {
    Json,
}

impl SerializerKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "json" | CONTENT_TYPE_JSON => Ok(SerializerKind::Json),
            other => Err(TaskError::Config(format!("unsupported serializer: {}", other))),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SerializerKind::Json => CONTENT_TYPE_JSON,
        }
    }
}

/// Encodes invocations for publishing and decodes deliveries on the worker side
#[derive(Debug, Clone)]
pub struct InvocationCodec {
    serializer: SerializerKind,
    accept: Vec<String>,
}

impl Default for InvocationCodec {
    fn default() -> Self {
        InvocationCodec {
            serializer: SerializerKind::Json,
            accept: vec![CONTENT_TYPE_JSON.to_string()],
        }
    }
}

impl InvocationCodec {
    /// Build from a serializer name and an accept-content list (`json` or MIME names).
    pub fn new(serializer: &str, accept: &[String]) -> Result<Self> {
        let serializer = SerializerKind::from_name(serializer)?;
        let accept = accept
            .iter()
            .map(|name| SerializerKind::from_name(name).map(|k| k.content_type().to_string()))
            .collect::<Result<Vec<_>>>()?;

        if !accept.iter().any(|ct| ct == serializer.content_type()) {
            return Err(TaskError::Config(format!(
                "serializer {} is not in accept_content",
                serializer.content_type()
            )));
        }

        Ok(InvocationCodec { serializer, accept })
    }

    pub fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }

    pub fn encode(&self, invocation: &TaskInvocation) -> Result<Envelope> {
        invocation.arguments().validate()?;
        let payload = match self.serializer {
            SerializerKind::Json => serde_json::to_vec(invocation)?,
        };
        Ok(Envelope {
            content_type: self.content_type().to_string(),
            payload,
            eta: invocation.eta,
        })
    }

    pub fn decode(&self, envelope: &Envelope) -> Result<TaskInvocation> {
        if !self.accepts(&envelope.content_type) {
            return Err(TaskError::ContentRejected(envelope.content_type.clone()));
        }
        let invocation: TaskInvocation = serde_json::from_slice(&envelope.payload)?;
        invocation.arguments().validate()?;
        Ok(invocation)
    }

    pub fn accepts(&self, content_type: &str) -> bool {
        self.accept.iter().any(|ct| ct == content_type)
    }
}

/// Best-effort extraction of the invocation id from an undecodable payload,
/// so a poison message can still get a FAILURE record.
pub fn peek_id(payload: &[u8]) -> Option<TaskId> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: TaskId,
    }

    serde_json::from_slice::<IdOnly>(payload).ok().map(|p| p.id)
}
