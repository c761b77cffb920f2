//! Services the demo peers offer each other, and the typed wrappers the
//! calling side uses to reach them.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use postrun::Args;
use postrun::Fault;
use postrun::Peer;
use postrun::Proxy;
use postrun::Service;
use postrun::service;
use postrun::service::Registry;
use serde_json::json;

pub struct Speak {
    prefix: String,
}

pub fn speak() -> Service {
    Service::builder(|args: Args| Ok(Speak { prefix: args.get(0)? }))
        .method("concat", |this: Arc<Speak>, args: Args| async move {
            Ok(format!("{}{}", this.prefix, args.get::<String>(0)?))
        })
        .build()
}

pub struct Notes {
    entries: Mutex<Vec<String>>,
}

impl Notes {
    fn entries(&self) -> Result<std::sync::MutexGuard<'_, Vec<String>>, Fault> {
        self.entries.lock().map_err(|_| Fault::new("notes are poisoned"))
    }
}

/// Loaded on demand through `importScripts("notes.js")`.
pub fn install_notes(registry: &Registry) -> service::Result<()> {
    let notes = Service::builder(|_args: Args| Ok(Notes { entries: Mutex::new(Vec::new()) }))
        .method("add", |this: Arc<Notes>, args: Args| async move {
            let text: String = args.get(0)?;
            if text.is_empty() {
                return Err(Fault::new("a note needs some text"));
            }
            let mut entries = this.entries()?;
            entries.push(text);
            Ok(entries.len())
        })
        .method("list", |this: Arc<Notes>, _args: Args| async move { Ok(this.entries()?.clone()) })
        .build();
    registry.register("notes", notes)
}

pub struct Clock {
    started: Instant,
}

/// Served by the controller so the worker has something to call back.
pub fn clock() -> Service {
    Service::builder(|_args: Args| Ok(Clock { started: Instant::now() }))
        .method("uptimeMillis", |this: Arc<Clock>, _args: Args| async move {
            Ok(this.started.elapsed().as_millis() as u64)
        })
        .build()
}

pub struct SpeakClient {
    proxy: Proxy,
}

impl SpeakClient {
    pub async fn connect(peer: &Peer, prefix: &str) -> postrun::client::Result<Self> {
        let proxy = peer.connect("speak", vec![json!(prefix)]).await?;
        Ok(Self { proxy })
    }

    pub async fn concat(&self, text: &str) -> postrun::client::Result<String> {
        self.proxy.call_as("concat", vec![json!(text)]).await
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}

pub struct NotesClient {
    proxy: Proxy,
}

impl NotesClient {
    pub async fn connect(peer: &Peer) -> postrun::client::Result<Self> {
        let proxy = peer.connect("notes", vec![]).await?;
        Ok(Self { proxy })
    }

    pub async fn add(&self, text: &str) -> postrun::client::Result<usize> {
        self.proxy.call_as("add", vec![json!(text)]).await
    }

    pub async fn list(&self) -> postrun::client::Result<Vec<String>> {
        self.proxy.call_as("list", vec![]).await
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}
