//! # postrun
//!
//! Bidirectional RPC between two isolated contexts that share nothing but an
//! asynchronous, order-preserving message channel.
//!
//! Each context runs a [`Peer`]. A peer serves the services registered on it
//! and connects to services registered on its counterpart:
//!
//! ```ignore
//! // worker side
//! worker.register("speak", Service::builder(|args: Args| Ok(Speak { prefix: args.get(0)? }))
//!     .method("concat", |this: Arc<Speak>, args: Args| async move {
//!         Ok(format!("{}{}", this.prefix, args.get::<String>(0)?))
//!     })
//!     .build())?;
//!
//! // controller side
//! let speak = controller.connect("speak", vec![json!("Hello, ")]).await?;
//! let greeting: String = speak.call_as("concat", vec![json!("World")]).await?;
//! ```

pub mod builder;
pub mod client;
pub mod duplex;
pub mod instance;
pub mod peer;
pub mod pending;
pub mod proxy;
pub mod service;
pub mod system;
pub mod transport;

pub use builder::PeerBuilder;
pub use client::Error;
pub use duplex::DuplexTransport;
pub use peer::Peer;
pub use postrpc::CallId;
pub use postrpc::InstanceId;
pub use proxy::Proxy;
pub use proxy::RemoteMethod;
pub use serde_json::Value;
pub use service::Args;
pub use service::Fault;
pub use service::Service;
pub use system::ScriptLoader;
pub use system::StaticLoader;
pub use transport::Transport;
