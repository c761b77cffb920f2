//! # System Service
//!
//! Every peer hosts a built-in service at instance 0 exposing `connect`,
//! `disconnect` and `importScripts`. It is dispatched exactly like a user
//! service, so system traffic is indistinguishable on the wire from user
//! traffic.
//!
//! The system methods do all of their work synchronously, which is what lets
//! a `disconnect` followed by a call in the same burst see the instance gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use futures::future;
use postrpc::InstanceId;
use serde_json::Value;

use crate::instance::InstanceTable;
use crate::service;
use crate::service::Args;
use crate::service::Descriptor;
use crate::service::Fault;
use crate::service::Registry;
use crate::service::Service;

/// Loads additional code into a peer on request of its counterpart.
///
/// What a "script" is belongs to the host environment; a loader typically
/// registers further services into the registry it is handed.
pub trait ScriptLoader: Send + Sync + 'static {
    fn load(&self, script: &str, registry: &Registry) -> Result<(), Fault>;
}

type Script = Box<dyn Fn(&Registry) -> service::Result<()> + Send + Sync>;

/// A loader backed by a fixed table of named registration functions.
#[derive(Default)]
pub struct StaticLoader {
    scripts: HashMap<String, Script>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `name` loadable; loading it runs `install` against the registry.
    pub fn script<F>(mut self, name: impl Into<String>, install: F) -> Self
    where
        F: Fn(&Registry) -> service::Result<()> + Send + Sync + 'static,
    {
        self.scripts.insert(name.into(), Box::new(install));
        self
    }
}

impl ScriptLoader for StaticLoader {
    fn load(&self, script: &str, registry: &Registry) -> Result<(), Fault> {
        let install = self
            .scripts
            .get(script)
            .ok_or_else(|| Fault::new(format!("unknown script: {}", script)))?;
        install(registry).map_err(|e| Fault::new(e.to_string()))
    }
}

/// The serving half of a peer: what it offers and what it has handed out.
pub(crate) struct Host {
    pub(crate) registry: Registry,
    pub(crate) instances: InstanceTable,
    loader: Option<Arc<dyn ScriptLoader>>,
}

impl Host {
    pub(crate) fn new(loader: Option<Arc<dyn ScriptLoader>>) -> Arc<Self> {
        Arc::new_cyclic(|host| {
            let system = Arc::new(System { host: host.clone() });
            Self {
                registry: Registry::new(),
                instances: InstanceTable::new(system, descriptor()),
                loader,
            }
        })
    }
}

struct System {
    host: Weak<Host>,
}

impl System {
    fn host(&self) -> Result<Arc<Host>, Fault> {
        self.host.upgrade().ok_or_else(|| Fault::new("peer is shutting down"))
    }

    fn connect(&self, args: Args) -> Result<(InstanceId, Vec<String>), Fault> {
        let host = self.host()?;
        let name: String = args.get(0)?;
        let construction: Vec<Value> = args.opt(1)?.unwrap_or_default();

        let descriptor = host
            .registry
            .get(&name)
            .ok_or_else(|| Fault::new(format!("unknown service: {}", name)))?;
        let (id, methods) = host.instances.create(descriptor, Args::new(construction))?;

        tracing::info!(service = %name, instance = %id, "granted instance");
        Ok((id, methods))
    }

    fn disconnect(&self, args: Args) -> Result<(), Fault> {
        let host = self.host()?;
        let id: InstanceId = args.get(0)?;
        host.instances.destroy(id)?;

        tracing::info!(instance = %id, "released instance");
        Ok(())
    }

    fn import_scripts(&self, args: Args) -> Result<(), Fault> {
        let host = self.host()?;
        let scripts: Vec<String> = args.get(0)?;
        let loader = host
            .loader
            .as_ref()
            .ok_or_else(|| Fault::new("script loading is not available"))?;

        for script in &scripts {
            loader.load(script, &host.registry)?;
            tracing::debug!(script = %script, "script loaded");
        }
        Ok(())
    }
}

fn descriptor() -> Descriptor {
    let service = Service::builder(|_| Err::<System, _>(Fault::new("the system service is not constructible")))
        .method("connect", |system: Arc<System>, args| future::ready(system.connect(args)))
        .method("disconnect", |system: Arc<System>, args| future::ready(system.disconnect(args)))
        .method("importScripts", |system: Arc<System>, args| future::ready(system.import_scripts(args)))
        .build();

    Descriptor::assemble("system".into(), service)
}
