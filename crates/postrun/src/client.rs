//! # RPC Client
//!
//! The calling half of a peer. Every outbound call, whether issued through a
//! proxy, through `connect`/`disconnect`/`import_scripts`, or directly, funnels
//! into `Client::call`: allocate a call id, send a dispatch, await the matching
//! resolve or reject routed back by the peer's pump.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use postrpc::CallId;
use postrpc::InstanceId;
use postrpc::Message;
use serde_json::Value;

use crate::pending::PendingCalls;
use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Transport(transport::Error),
    Protocol(postrpc::Error),
    /// The counterpart rejected the call; carries the failure's message.
    Remote(String),
    /// A reply named a call id with no outstanding entry.
    UnknownCall(CallId),
    /// The proxy does not expose this method; nothing was sent.
    UnknownMethod { instance: InstanceId, method: String },
    /// The proxy was issued by a different peer.
    ForeignProxy(InstanceId),
    /// A system reply did not have the expected shape.
    InvalidReply(String),
    /// A result could not be deserialized into the requested type.
    Decode(String),
    Timeout(CallId),
    ChannelClosed,
    Terminated,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Remote(msg) => f.write_str(msg),
            Self::UnknownCall(id) => write!(f, "Protocol error: no outstanding call {}", id),
            Self::UnknownMethod { instance, method } => write!(f, "{} does not expose '{}'", instance, method),
            Self::ForeignProxy(id) => write!(f, "proxy for {} was not issued by this peer", id),
            Self::InvalidReply(msg) => write!(f, "Invalid reply: {}", msg),
            Self::Decode(msg) => write!(f, "Decode error: {}", msg),
            Self::Timeout(id) => write!(f, "Request {} timed out", id),
            Self::ChannelClosed => write!(f, "Response channel closed"),
            Self::Terminated => write!(f, "Peer terminated"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<postrpc::Error> for Error {
    fn from(e: postrpc::Error) -> Self {
        Self::Protocol(e)
    }
}

impl Error {
    /// The counterpart's failure message, if this is a remote rejection.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote(msg) => Some(msg),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Cheaply cloneable handle for issuing calls over one transport.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    peer_name: String,
    transport: Arc<dyn Transport>,
    pending: PendingCalls,
    call_timeout: Option<Duration>,
    terminated: AtomicBool,
}

impl Client {
    pub(crate) fn new(peer_name: String, transport: Arc<dyn Transport>, call_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer_name,
                transport,
                pending: PendingCalls::new(),
                call_timeout,
                terminated: AtomicBool::new(false),
            }),
        }
    }

    pub fn peer_name(&self) -> &str {
        &self.inner.peer_name
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    /// True if both handles issue calls over the same channel.
    pub(crate) fn same_channel(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Refuses new calls and fails every outstanding one with `error`.
    /// Returns how many calls were failed.
    pub(crate) fn shutdown(&self, error: Error) -> usize {
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.inner.pending.fail_all(error)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Invokes `method` on the counterpart's `instance_id` and awaits its reply.
    pub async fn call(&self, instance_id: InstanceId, method: &str, args: Vec<Value>) -> Result<Value> {
        self.issue(instance_id, method, args, false).await
    }

    /// Like `call`, for requests whose reply grants an instance. If the call
    /// times out, a reply arriving later is handed back to the peer so the
    /// granted instance can be released instead of leaking.
    pub(crate) async fn call_for_grant(
        &self,
        instance_id: InstanceId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.issue(instance_id, method, args, true).await
    }

    async fn issue(&self, instance_id: InstanceId, method: &str, args: Vec<Value>, grant: bool) -> Result<Value> {
        if self.is_terminated() {
            return Err(Error::Terminated);
        }

        let (call_id, rx) = self.inner.pending.issue();
        if self.is_terminated() {
            self.inner.pending.cancel(call_id);
            return Err(Error::Terminated);
        }

        let message = Message::Dispatch {
            call_id,
            instance_id,
            method: method.to_string(),
            args,
        };
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.inner.pending.cancel(call_id);
                return Err(e.into());
            }
        };

        tracing::debug!(
            peer = %self.inner.peer_name,
            call = %call_id,
            instance = %instance_id,
            method,
            "dispatch"
        );

        if let Err(e) = self.inner.transport.send(&payload).await {
            self.inner.pending.cancel(call_id);
            return Err(e.into());
        }

        let reply = match self.inner.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    if grant {
                        self.inner.pending.abandon(call_id);
                    } else {
                        self.inner.pending.cancel(call_id);
                    }
                    tracing::warn!(peer = %self.inner.peer_name, call = %call_id, method, "call timed out");
                    return Err(Error::Timeout(call_id));
                }
            },
            None => rx.await,
        };

        reply.unwrap_or(Err(Error::ChannelClosed))
    }
}
