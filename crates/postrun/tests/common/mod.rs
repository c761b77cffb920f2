//! Shared fixtures for the postrun integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use postrun::Args;
use postrun::DuplexTransport;
use postrun::Fault;
use postrun::Peer;
use postrun::Service;
use postrun::service;
use postrun::service::Registry;
use tracing_subscriber::EnvFilter;

/// Routes peer logs through the test harness. Set `RUST_LOG=postrun=debug`
/// to see the traffic of a failing test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A controller peer and a worker peer wired to each other in memory.
pub fn peers() -> (Peer, Peer) {
    init_tracing();
    let (a, b) = DuplexTransport::pair();
    (Peer::new("controller", a), Peer::new("worker", b))
}

pub struct Speak {
    prefix: String,
}

/// `speak(prefix)` with a single method `concat(text) -> prefix + text`.
pub fn speak() -> Service {
    Service::builder(|args: Args| Ok(Speak { prefix: args.get(0)? }))
        .method("concat", |this: Arc<Speak>, args: Args| async move {
            Ok(format!("{}{}", this.prefix, args.get::<String>(0)?))
        })
        .build()
}

pub fn install_speak(registry: &Registry) -> service::Result<()> {
    registry.register("speak", speak())
}

pub struct Counter {
    value: AtomicI64,
}

/// `counter(start?)` exposing `add(n)`, `get()` and `fail(message)`.
pub fn counter() -> Service {
    Service::builder(|args: Args| {
        Ok(Counter {
            value: AtomicI64::new(args.opt(0)?.unwrap_or(0)),
        })
    })
    .method("add", |this: Arc<Counter>, args: Args| async move {
        let n: i64 = args.get(0)?;
        Ok(this.value.fetch_add(n, Ordering::SeqCst) + n)
    })
    .method("get", |this: Arc<Counter>, _args: Args| async move {
        Ok(this.value.load(Ordering::SeqCst))
    })
    .method("fail", |_this: Arc<Counter>, args: Args| async move {
        let message: String = args.get(0)?;
        Err::<(), _>(Fault::new(message))
    })
    .build()
}
