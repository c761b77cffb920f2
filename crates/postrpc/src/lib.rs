//! # PostRPC
//!
//! The wire protocol spoken between two channel peers.
//!
//! ## Architecture
//!
//! Every interaction is one of three messages, each a fixed five element
//! sequence `[kind, callId, instanceId, methodName, payload]`:
//!
//! - **Dispatch** (`0`): invoke `methodName` on `instanceId` with the `payload` argument list.
//! - **Resolve** (`1`): the call `callId` succeeded with `payload`.
//! - **Reject** (`2`): the call `callId` failed, `payload` is the failure text.
//!
//! Payloads are plain JSON values. The protocol knows nothing about services,
//! proxies, or transports; it only fixes the shape of a message and rejects
//! anything else.

mod error;
mod message;

pub use error::Error;
pub use error::Result;
pub use message::CallId;
pub use message::InstanceId;
pub use message::Kind;
pub use message::Message;

pub use serde_json::Value;
