//! # Channel Peer with Async Pump
//!
//! A peer is one side of a channel. It serves the services registered on it
//! and holds proxies to services the counterpart serves. Both sides run the
//! same code; which one is "client" depends only on who calls `connect`.
//!
//! The peer spawns a background pump that is the only reader of the
//! transport. Dispatches are resolved against the instance table in arrival
//! order and their replies are sent when the method completes; resolves and
//! rejects settle the matching entry of the pending-call table.
//!
//! A peer is constructed, then runs until `terminate`, drop, or the transport
//! closing. After that, every outstanding call has failed, no further
//! messages are processed and methods still running for the counterpart are
//! cancelled without replying. Terminating also closes the transport, so the
//! counterpart observes the channel ending instead of waiting on a silent peer.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use postrpc::CallId;
use postrpc::InstanceId;
use postrpc::Message;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;

use crate::builder::PeerBuilder;
use crate::client::Client;
use crate::client::Error;
use crate::client::Result;
use crate::instance;
use crate::pending::Outcome;
use crate::proxy::Proxy;
use crate::service;
use crate::service::Args;
use crate::service::Fault;
use crate::service::Service;
use crate::system::Host;
use crate::system::ScriptLoader;
use crate::transport;
use crate::transport::Transport;

/// One side of a bidirectional RPC channel.
///
/// Wrap in `Arc` to share between tasks.
pub struct Peer {
    client: Client,
    host: Arc<Host>,
    violations: Arc<AtomicU64>,
    pump: JoinHandle<()>,
}

impl Peer {
    pub fn builder(name: impl Into<String>) -> PeerBuilder {
        PeerBuilder::new(name)
    }

    /// Creates a peer with default configuration and starts its pump.
    pub fn new(name: impl Into<String>, transport: impl Transport) -> Self {
        Self::builder(name).build(transport)
    }

    pub(crate) fn start(
        name: String,
        transport: Arc<dyn Transport>,
        call_timeout: Option<Duration>,
        loader: Option<Arc<dyn ScriptLoader>>,
    ) -> Self {
        tracing::info!(peer = %name, ?call_timeout, "peer started");

        let client = Client::new(name, transport, call_timeout);
        let host = Host::new(loader);
        let violations = Arc::new(AtomicU64::new(0));
        let pump = tokio::spawn(Self::pump(client.clone(), host.clone(), violations.clone()));

        Self {
            client,
            host,
            violations,
            pump,
        }
    }

    pub fn name(&self) -> &str {
        self.client.peer_name()
    }

    /// Makes `service` available to the counterpart under `name`.
    ///
    /// Purely local; nothing is sent.
    pub fn register(&self, name: impl Into<String>, service: Service) -> service::Result<()> {
        self.host.registry.register(name, service)
    }

    /// Asks the counterpart to instantiate its service `name` with `args` and
    /// returns a proxy to the new instance.
    pub async fn connect(&self, name: &str, args: Vec<Value>) -> Result<Proxy> {
        let reply = self
            .client
            .call_for_grant(InstanceId::SYSTEM, "connect", vec![Value::from(name), Value::Array(args)])
            .await?;

        let (instance_id, methods): (InstanceId, Vec<String>) =
            serde_json::from_value(reply).map_err(|e| Error::InvalidReply(format!("connect: {}", e)))?;
        if instance_id.is_system() {
            return Err(Error::InvalidReply("connect granted the system instance".into()));
        }

        tracing::info!(peer = %self.name(), service = name, instance = %instance_id, "connected");
        Ok(Proxy::new(self.client.clone(), instance_id, methods))
    }

    /// Asks the counterpart to release the instance behind `proxy`.
    pub async fn disconnect(&self, proxy: &Proxy) -> Result<()> {
        let instance_id = proxy.instance_id();
        if !proxy.client().same_channel(&self.client) {
            return Err(Error::ForeignProxy(instance_id));
        }

        self.client
            .call(InstanceId::SYSTEM, "disconnect", vec![serde_json::json!(instance_id)])
            .await?;

        tracing::info!(peer = %self.name(), instance = %instance_id, "disconnected");
        Ok(())
    }

    /// Asks the counterpart to load `scripts` through its script loader.
    pub async fn import_scripts<I, S>(&self, scripts: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scripts: Vec<Value> = scripts.into_iter().map(|s| Value::String(s.into())).collect();
        self.client
            .call(InstanceId::SYSTEM, "importScripts", vec![Value::Array(scripts)])
            .await?;
        Ok(())
    }

    /// Invokes `method` on the counterpart's `instance_id` directly.
    ///
    /// This is the primitive every proxy call is built on.
    pub async fn call(&self, instance_id: InstanceId, method: &str, args: Vec<Value>) -> Result<Value> {
        self.client.call(instance_id, method, args).await
    }

    /// Destroys an instance this peer granted to the counterpart.
    ///
    /// The counterpart is not notified; its proxy's next call fails with
    /// `invalid instance`.
    pub fn revoke(&self, instance_id: InstanceId) -> instance::Result<()> {
        self.host.instances.destroy(instance_id)?;
        tracing::info!(peer = %self.name(), instance = %instance_id, "revoked instance");
        Ok(())
    }

    /// Names of the services registered on this peer, sorted.
    pub fn services(&self) -> Vec<String> {
        self.host.registry.names()
    }

    /// Instances this peer currently hosts for the counterpart.
    pub fn live_instances(&self) -> usize {
        self.host.instances.len()
    }

    /// Calls this peer has issued that are still awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.client.pending().len()
    }

    /// Inbound messages dropped as malformed or unsolicited.
    pub fn protocol_violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    pub fn is_terminated(&self) -> bool {
        self.client.is_terminated()
    }

    /// Stops processing messages and fails every outstanding call.
    ///
    /// Closes the transport and cancels methods still running on behalf of
    /// the counterpart; their replies are never sent.
    pub fn terminate(&self) {
        let failed = self.shut_down();
        tracing::info!(peer = %self.name(), failed, "peer terminated");
    }

    fn shut_down(&self) -> usize {
        self.pump.abort();
        let failed = self.client.shutdown(Error::Terminated);
        self.client.transport().close();
        failed
    }

    /// Dropping the pump drops `running`, which aborts every method still in
    /// flight for the counterpart.
    async fn pump(client: Client, host: Arc<Host>, violations: Arc<AtomicU64>) {
        let mut running = JoinSet::new();
        let error = loop {
            match client.transport().recv().await {
                Ok(Some(bytes)) => {
                    Self::route(&client, &host, &violations, &mut running, &bytes);
                    while running.try_join_next().is_some() {}
                }
                Ok(None) => {
                    tracing::debug!(peer = %client.peer_name(), "transport closed");
                    break Error::Transport(transport::Error::ConnectionLost("stream closed".into()));
                }
                Err(e) => {
                    tracing::error!(peer = %client.peer_name(), error = %e, "transport failed");
                    break Error::Transport(e);
                }
            }
        };

        // Notify all pending requests with the error
        let failed = client.shutdown(error);
        if failed > 0 {
            tracing::warn!(peer = %client.peer_name(), failed, "failed outstanding calls on shutdown");
        }
    }

    fn route(
        client: &Client,
        host: &Arc<Host>,
        violations: &AtomicU64,
        running: &mut JoinSet<()>,
        bytes: &[u8],
    ) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                violations.fetch_add(1, Ordering::Relaxed);
                tracing::error!(peer = %client.peer_name(), error = %e, "dropping malformed message");
                return;
            }
        };

        match message {
            Message::Dispatch { call_id, instance_id, method, args } => {
                tracing::debug!(
                    peer = %client.peer_name(),
                    call = %call_id,
                    instance = %instance_id,
                    method = %method,
                    "serving"
                );
                let started = host.instances.dispatch(instance_id, &method, Args::new(args));
                let client = client.clone();

                running.spawn(async move {
                    let outcome = match started {
                        Ok(pending) => pending.await,
                        Err(e) => Err(Fault::from(e)),
                    };
                    let reply = match outcome {
                        Ok(value) => Message::Resolve { call_id, instance_id, value },
                        Err(fault) => {
                            tracing::debug!(peer = %client.peer_name(), call = %call_id, reason = %fault, "rejecting");
                            Message::Reject { call_id, instance_id, reason: fault.into_message() }
                        }
                    };
                    Self::reply(&client, reply).await;
                });
            }
            Message::Resolve { call_id, value, .. } => {
                Self::settle(client, violations, running, call_id, Ok(value))
            }
            Message::Reject { call_id, reason, .. } => {
                Self::settle(client, violations, running, call_id, Err(Error::Remote(reason)))
            }
        }
    }

    fn settle(
        client: &Client,
        violations: &AtomicU64,
        running: &mut JoinSet<()>,
        call_id: CallId,
        outcome: Outcome,
    ) {
        if client.pending().reclaim(call_id) {
            Self::release_late_grant(client, running, call_id, outcome);
            return;
        }
        if let Err(e) = client.pending().settle(call_id, outcome) {
            violations.fetch_add(1, Ordering::Relaxed);
            tracing::error!(peer = %client.peer_name(), error = %e, "reply does not match any outstanding call");
        }
    }

    /// Gives back an instance granted by a `connect` whose caller already
    /// timed out; nobody else holds its id.
    fn release_late_grant(client: &Client, running: &mut JoinSet<()>, call_id: CallId, outcome: Outcome) {
        let instance_id = match outcome.map(serde_json::from_value::<(InstanceId, Vec<String>)>) {
            Ok(Ok((instance_id, _))) if !instance_id.is_system() => instance_id,
            _ => {
                tracing::debug!(peer = %client.peer_name(), call = %call_id, "late connect reply granted nothing");
                return;
            }
        };

        tracing::warn!(
            peer = %client.peer_name(),
            call = %call_id,
            instance = %instance_id,
            "releasing instance granted after connect timed out"
        );
        let client = client.clone();
        running.spawn(async move {
            let released = client
                .call(InstanceId::SYSTEM, "disconnect", vec![serde_json::json!(instance_id)])
                .await;
            if let Err(e) = released {
                tracing::warn!(peer = %client.peer_name(), instance = %instance_id, error = %e, "failed to release late grant");
            }
        });
    }

    async fn reply(client: &Client, message: Message) {
        let call_id = message.call_id();
        if client.is_terminated() {
            tracing::debug!(peer = %client.peer_name(), call = %call_id, "peer terminated, dropping reply");
            return;
        }

        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(peer = %client.peer_name(), call = %call_id, error = %e, "failed to encode reply");
                return;
            }
        };

        if let Err(e) = client.transport().send(&payload).await {
            tracing::warn!(peer = %client.peer_name(), call = %call_id, error = %e, "reply undeliverable");
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shut_down();
    }
}
