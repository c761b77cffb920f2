//! # Instance Table
//!
//! Live server-side objects created on behalf of the counterpart, keyed by
//! instance id. Slot 0 is filled at construction with the peer's system
//! service and can never be destroyed; user instances are allocated from 1
//! upwards and ids are never reused.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use postrpc::InstanceId;

use crate::service::Args;
use crate::service::Descriptor;
use crate::service::Fault;
use crate::service::MethodFuture;
use crate::service::Object;

/// Lookup failures, reported to the issuer as a reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No live instance occupies this slot.
    InvalidInstance(InstanceId),
    /// The instance's service does not expose this method.
    InvalidMethod { instance: InstanceId, method: String },
    /// Slot 0 hosts the system service and is never destroyed.
    SystemInstance,
    /// The service constructor failed.
    Construction { service: String, fault: Fault },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInstance(id) => write!(f, "invalid instance: {}", id),
            Self::InvalidMethod { instance, method } => write!(f, "invalid method: {} on {}", method, instance),
            Self::SystemInstance => write!(f, "the system instance cannot be disconnected"),
            Self::Construction { service, fault } => write!(f, "failed to construct {}: {}", service, fault),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        Fault::new(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
struct Entry {
    object: Object,
    descriptor: Arc<Descriptor>,
}

pub struct InstanceTable {
    entries: DashMap<InstanceId, Entry>,
    next_id: AtomicU64,
}

impl InstanceTable {
    /// Creates a table whose slot 0 holds `system`.
    pub(crate) fn new(system: Object, descriptor: Descriptor) -> Self {
        let entries = DashMap::new();
        entries.insert(InstanceId::SYSTEM, Entry {
            object: system,
            descriptor: Arc::new(descriptor),
        });

        Self {
            entries,
            next_id: AtomicU64::new(1),
        }
    }

    /// Instantiates `descriptor` and stores it under a fresh id.
    ///
    /// Returns the id together with the declared method names, which is all
    /// the counterpart needs to build a proxy.
    pub fn create(&self, descriptor: Arc<Descriptor>, args: Args) -> Result<(InstanceId, Vec<String>)> {
        let object = descriptor.instantiate(args).map_err(|fault| Error::Construction {
            service: descriptor.name().to_string(),
            fault,
        })?;

        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let methods = descriptor.method_names().to_vec();
        tracing::debug!(service = %descriptor.name(), instance = %id, "instance created");

        self.entries.insert(id, Entry { object, descriptor });
        Ok((id, methods))
    }

    /// Clears the slot of a user instance.
    pub fn destroy(&self, id: InstanceId) -> Result<()> {
        if id.is_system() {
            return Err(Error::SystemInstance);
        }

        let (_, entry) = self.entries.remove(&id).ok_or(Error::InvalidInstance(id))?;
        tracing::debug!(service = %entry.descriptor.name(), instance = %id, "instance destroyed");
        Ok(())
    }

    /// Resolves `id` and `method` and starts the call.
    ///
    /// Lookup, and whatever the method's closure does before handing back its
    /// future, happen before this returns and therefore in dispatch order.
    /// The body of an `async move` block does not run until the future is
    /// polled, so only methods that act eagerly (as the system methods do)
    /// take effect in dispatch order.
    pub fn dispatch(&self, id: InstanceId, method: &str, args: Args) -> Result<MethodFuture> {
        // Clone out of the map so no shard lock is held while the method runs;
        // system methods insert into and remove from this same table.
        let entry = self
            .entries
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(Error::InvalidInstance(id))?;

        entry
            .descriptor
            .invoke(entry.object, method, args)
            .ok_or_else(|| Error::InvalidMethod {
                instance: id,
                method: method.to_string(),
            })
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live user instances, excluding the system service.
    pub fn len(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
