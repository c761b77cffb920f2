//! # Service Registry
//!
//! Services are declared explicitly: a constructor plus a map from method name
//! to callable. Nothing is discovered by inspecting a type, so the method list
//! sent to a connecting peer is exactly what was declared here.
//!
//! ## Philosophy
//!
//! - **Registration-Time Validation**: A bad declaration is refused by `register`
//!   and leaves the registry untouched.
//! - **Type Erasure at the Edge**: Instances are stored as `Arc<dyn Any>` and every
//!   method is a boxed closure from JSON arguments to a JSON result. The typed
//!   service never leaks past its builder.
//! - **Failures Are Text**: Whatever goes wrong inside a constructor or method
//!   (an error or a panic) becomes a `Fault` carrying only its message.

use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Registration errors, reported synchronously to the caller of `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Services must have a non-empty name.
    EmptyName,
    /// A service with this name is already registered on this peer.
    AlreadyRegistered(String),
    /// The service declares no methods.
    NoMethods(String),
    /// A declared method has an empty name.
    InvalidMethodName { service: String },
    /// The same method name was declared twice.
    DuplicateMethod { service: String, method: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "service name must not be empty"),
            Self::AlreadyRegistered(name) => write!(f, "service '{}' is already registered", name),
            Self::NoMethods(name) => write!(f, "service '{}' exposes no methods", name),
            Self::InvalidMethodName { service } => write!(f, "service '{}' declares a method with an empty name", service),
            Self::DuplicateMethod { service, method } => {
                write!(f, "service '{}' declares method '{}' more than once", service, method)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A failure that crosses the channel as the text of a reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault(String);

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }

    pub fn into_message(self) -> String {
        self.0
    }

    /// Recovers the message of a caught panic.
    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        if let Some(msg) = payload.downcast_ref::<&str>() {
            Self::new(*msg)
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            Self::new(msg.clone())
        } else {
            Self::new("service panicked")
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Fault {}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for Fault {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Positional call or construction arguments, as received from the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The untyped argument at `index`, if present.
    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Deserializes the argument at `index`, failing if it is missing or mistyped.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, Fault> {
        let value = self
            .0
            .get(index)
            .ok_or_else(|| Fault::new(format!("missing argument {}", index)))?;
        T::deserialize(value).map_err(|e| Fault::new(format!("argument {}: {}", index, e)))
    }

    /// Like `get`, but a missing or null argument yields `None`.
    pub fn opt<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<Option<T>, Fault> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|e| Fault::new(format!("argument {}: {}", index, e))),
        }
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

pub(crate) type Object = Arc<dyn Any + Send + Sync>;
/// The running part of a method call.
pub type MethodFuture = BoxFuture<'static, std::result::Result<Value, Fault>>;
type Constructor = Arc<dyn Fn(Args) -> std::result::Result<Object, Fault> + Send + Sync>;
type Method = Arc<dyn Fn(Object, Args) -> MethodFuture + Send + Sync>;

/// An unregistered service declaration. Built with `Service::builder`.
pub struct Service {
    constructor: Constructor,
    methods: Vec<(String, Method)>,
}

impl Service {
    /// Starts a declaration whose instances are built by `construct` from the
    /// client-supplied construction arguments.
    pub fn builder<S, F>(construct: F) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
        F: Fn(Args) -> std::result::Result<S, Fault> + Send + Sync + 'static,
    {
        let constructor: Constructor = Arc::new(move |args: Args| -> std::result::Result<Object, Fault> {
            let object = construct(args)?;
            Ok(Arc::new(object) as Object)
        });

        ServiceBuilder {
            constructor,
            methods: Vec::new(),
            _service: PhantomData,
        }
    }

    /// Declared method names, in declaration order.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(name, _)| name.as_str())
    }
}

/// Fluent builder collecting the methods a service exposes.
pub struct ServiceBuilder<S> {
    constructor: Constructor,
    methods: Vec<(String, Method)>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// Exposes `name`, invoking `method` on the instance with the call arguments.
    ///
    /// The returned value is serialized to JSON for the reply; an `Err` becomes
    /// a reject carrying the fault's message.
    pub fn method<F, Fut, R>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Arc<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, Fault>> + Send + 'static,
        R: Serialize + 'static,
    {
        let erased: Method = Arc::new(move |object: Object, args: Args| {
            let Ok(this) = object.downcast::<S>() else {
                return future::ready(Err(Fault::new("instance does not match its service"))).boxed();
            };
            method(this, args)
                .map(|result| result.and_then(|value| serde_json::to_value(value).map_err(Fault::from)))
                .boxed()
        });

        self.methods.push((name.into(), erased));
        self
    }

    pub fn build(self) -> Service {
        Service {
            constructor: self.constructor,
            methods: self.methods,
        }
    }
}

/// A validated, immutable service registration.
pub struct Descriptor {
    name: String,
    constructor: Constructor,
    methods: HashMap<String, Method>,
    method_names: Vec<String>,
}

impl Descriptor {
    fn new(name: String, service: Service) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        if service.methods.is_empty() {
            return Err(Error::NoMethods(name));
        }

        let mut seen = HashSet::new();
        for method in service.method_names() {
            if method.is_empty() {
                return Err(Error::InvalidMethodName { service: name });
            }
            if !seen.insert(method) {
                return Err(Error::DuplicateMethod { service: name, method: method.to_string() });
            }
        }

        Ok(Self::assemble(name, service))
    }

    /// Builds a descriptor from a declaration known to be valid.
    pub(crate) fn assemble(name: String, service: Service) -> Self {
        let method_names = service.method_names().map(str::to_string).collect();
        let methods = service.methods.into_iter().collect();

        Self {
            name,
            constructor: service.constructor,
            methods,
            method_names,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exposed method names, in declaration order.
    pub fn method_names(&self) -> &[String] {
        &self.method_names
    }

    pub fn exposes(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub(crate) fn instantiate(&self, args: Args) -> std::result::Result<Object, Fault> {
        std::panic::catch_unwind(AssertUnwindSafe(|| (self.constructor)(args)))
            .unwrap_or_else(|payload| Err(Fault::panicked(payload)))
    }

    /// Starts `method` on `object`. Returns `None` if the method is not exposed.
    ///
    /// The method's closure is called before this returns, but an `async`
    /// body it hands back only runs once the future is polled. Panics while
    /// calling the closure or polling the future surface as faults.
    pub(crate) fn invoke(&self, object: Object, method: &str, args: Args) -> Option<MethodFuture> {
        let method = self.methods.get(method)?;

        let pending = match std::panic::catch_unwind(AssertUnwindSafe(|| method(object, args))) {
            Ok(pending) => pending,
            Err(payload) => return Some(future::ready(Err(Fault::panicked(payload))).boxed()),
        };

        let guarded = AssertUnwindSafe(pending)
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|payload| Err(Fault::panicked(payload))));

        Some(guarded.boxed())
    }
}

/// Named services this peer can serve to its counterpart.
#[derive(Default)]
pub struct Registry {
    services: DashMap<String, Arc<Descriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a service under `name`.
    pub fn register(&self, name: impl Into<String>, service: Service) -> Result<()> {
        let descriptor = Descriptor::new(name.into(), service)?;

        match self.services.entry(descriptor.name.clone()) {
            Entry::Occupied(entry) => Err(Error::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::info!(
                    service = %descriptor.name,
                    methods = ?descriptor.method_names,
                    "service registered"
                );
                entry.insert(Arc::new(descriptor));
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Descriptor>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
