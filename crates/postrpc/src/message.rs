//! # Protocol Messages
//!
//! Defines the envelope shared by both directions of a channel.
//!
//! ## Invariants
//! - **Fixed Shape**: A message is always a five element sequence, never more, never less.
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on foreign data.
//! - **Shared Call Ids**: A dispatch and the resolve/reject answering it carry the same call id.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;

/// Identifies a pending call in the issuing peer's call table.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Identifies a live instance in the serving peer's instance table.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl InstanceId {
    /// The reserved slot holding every peer's built-in system service.
    pub const SYSTEM: InstanceId = InstanceId(0);

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// The tag in the first slot of every message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Dispatch = 0,
    Resolve = 1,
    Reject = 2,
}

impl Kind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Resolve),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Invoke `method` on `instance_id` with `args`.
    Dispatch {
        call_id: CallId,
        instance_id: InstanceId,
        method: String,
        args: Vec<Value>,
    },
    /// The call `call_id` produced `value`.
    Resolve {
        call_id: CallId,
        instance_id: InstanceId,
        value: Value,
    },
    /// The call `call_id` failed with `reason`.
    Reject {
        call_id: CallId,
        instance_id: InstanceId,
        reason: String,
    },
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Dispatch { .. } => Kind::Dispatch,
            Self::Resolve { .. } => Kind::Resolve,
            Self::Reject { .. } => Kind::Reject,
        }
    }

    pub fn call_id(&self) -> CallId {
        match self {
            Self::Dispatch { call_id, .. } | Self::Resolve { call_id, .. } | Self::Reject { call_id, .. } => *call_id,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        match self {
            Self::Dispatch { instance_id, .. }
            | Self::Resolve { instance_id, .. }
            | Self::Reject { instance_id, .. } => *instance_id,
        }
    }

    /// Encodes the message as a JSON sequence of five elements.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let kind = self.kind().code();
        let bytes = match self {
            Self::Dispatch { call_id, instance_id, method, args } => {
                serde_json::to_vec(&(kind, call_id, instance_id, Some(method), args))?
            }
            Self::Resolve { call_id, instance_id, value } => {
                serde_json::to_vec(&(kind, call_id, instance_id, None::<&str>, value))?
            }
            Self::Reject { call_id, instance_id, reason } => {
                serde_json::to_vec(&(kind, call_id, instance_id, None::<&str>, reason))?
            }
        };
        Ok(bytes)
    }

    /// Decodes a message from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Validates an already parsed value against the message shape.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(fields) = value else {
            return Err(Error::NotASequence { found: shape(&value) });
        };

        let [kind, call_id, instance_id, method, payload] =
            <[Value; 5]>::try_from(fields).map_err(|fields| Error::WrongArity(fields.len()))?;

        let kind = kind
            .as_u64()
            .and_then(Kind::from_code)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        let call_id = CallId(read_id("callId", &call_id)?);
        let instance_id = InstanceId(read_id("instanceId", &instance_id)?);

        match kind {
            Kind::Dispatch => {
                let Value::String(method) = method else {
                    return Err(invalid("methodName", "a string for dispatch", &method));
                };
                let Value::Array(args) = payload else {
                    return Err(invalid("payload", "an argument sequence for dispatch", &payload));
                };
                Ok(Self::Dispatch { call_id, instance_id, method, args })
            }
            Kind::Resolve => {
                expect_null_method(&method)?;
                Ok(Self::Resolve { call_id, instance_id, value: payload })
            }
            Kind::Reject => {
                expect_null_method(&method)?;
                let reason = match payload {
                    Value::String(reason) => reason,
                    other => other.to_string(),
                };
                Ok(Self::Reject { call_id, instance_id, reason })
            }
        }
    }
}

fn read_id(field: &'static str, value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| invalid(field, "a non-negative integer", value))
}

fn expect_null_method(method: &Value) -> Result<()> {
    match method {
        Value::Null => Ok(()),
        other => Err(invalid("methodName", "null for resolve and reject", other)),
    }
}

fn invalid(field: &'static str, expected: &'static str, found: &Value) -> Error {
    Error::InvalidField { field, expected, found: shape(found) }
}

/// Names the JSON shape of a value, without leaking its contents into logs.
fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_u64() => "a non-negative integer",
        Value::Number(n) if n.is_i64() => "a negative integer",
        Value::Number(_) => "a float",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a map",
    }
}
