//! # Remote Instance Proxy
//!
//! A local stand-in for one instance hosted by the counterpart. The proxy only
//! knows the instance id and the method names the counterpart declared when
//! granting it; every call becomes a dispatch through the owning peer's client.
//!
//! ## Invariants
//!
//! - Only declared methods are reachable. Anything else fails locally and
//!   nothing is sent.
//! - Forwarders are created on first use and memoized per method name.
//! - Dropping a proxy does not release the remote instance; use `Peer::disconnect`.

use std::sync::Arc;

use dashmap::DashMap;
use postrpc::InstanceId;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::Client;
use crate::client::Error;
use crate::client::Result;

/// Handle to an instance hosted by the counterpart.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    client: Client,
    instance_id: InstanceId,
    methods: Vec<String>,
    forwarders: DashMap<String, RemoteMethod>,
}

impl Proxy {
    pub(crate) fn new(client: Client, instance_id: InstanceId, methods: Vec<String>) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                client,
                instance_id,
                methods,
                forwarders: DashMap::new(),
            }),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    /// Method names declared by the remote service.
    pub fn methods(&self) -> &[String] {
        &self.inner.methods
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.iter().any(|m| m == name)
    }

    /// The forwarder for `name`, or `None` if the service does not expose it.
    pub fn method(&self, name: &str) -> Option<RemoteMethod> {
        if let Some(forwarder) = self.inner.forwarders.get(name) {
            return Some(forwarder.value().clone());
        }
        if !self.has_method(name) {
            return None;
        }

        let forwarder = self
            .inner
            .forwarders
            .entry(name.to_string())
            .or_insert_with(|| RemoteMethod {
                client: self.inner.client.clone(),
                instance_id: self.inner.instance_id,
                name: Arc::from(name),
            });
        Some(forwarder.value().clone())
    }

    /// Calls `name` with `args` and returns the raw result.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let method = self.method(name).ok_or_else(|| Error::UnknownMethod {
            instance: self.inner.instance_id,
            method: name.to_string(),
        })?;
        method.call(args).await
    }

    /// Calls `name` and deserializes the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, name: &str, args: Vec<Value>) -> Result<T> {
        decode(self.call(name, args).await?)
    }

    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("instance_id", &self.inner.instance_id)
            .field("methods", &self.inner.methods)
            .finish()
    }
}

/// A callable bound to one method of one remote instance.
#[derive(Clone)]
pub struct RemoteMethod {
    client: Client,
    instance_id: InstanceId,
    name: Arc<str>,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.client.call(self.instance_id, &self.name, args).await
    }

    pub async fn call_as<T: DeserializeOwned>(&self, args: Vec<Value>) -> Result<T> {
        decode(self.call(args).await?)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Decode(e.to_string()))
}
