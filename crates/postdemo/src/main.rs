//! Controller/worker demo
//!
//! Runs two peers in one process, joined by an in-memory channel:
//! - the worker serves `speak` and can load `notes` on request
//! - the controller serves `clock`, which the worker calls back
//!
//! Usage:
//!   RUST_LOG=postrun=debug cargo run -p postdemo

mod services;

use std::time::Duration;

use anyhow::Context;
use postrun::DuplexTransport;
use postrun::Peer;
use postrun::StaticLoader;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::services::NotesClient;
use crate::services::SpeakClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (controller_end, worker_end) = DuplexTransport::pair();

    let worker = Peer::builder("worker")
        .call_timeout(Duration::from_secs(5))
        .script_loader(StaticLoader::new().script("notes.js", services::install_notes))
        .build(worker_end);
    worker.register("speak", services::speak())?;

    let controller = Peer::builder("controller").call_timeout(Duration::from_secs(5)).build(controller_end);
    controller.register("clock", services::clock())?;

    // controller -> worker
    let speak = SpeakClient::connect(&controller, "Hello, ").await.context("connecting to speak")?;
    println!("{}", speak.concat("World").await?);
    println!("speak exposes {:?}", speak.proxy().methods());

    match controller.connect("missing", vec![]).await {
        Ok(_) => anyhow::bail!("connecting to an unregistered service succeeded"),
        Err(e) => println!("connect(missing) failed: {}", e),
    }

    controller.import_scripts(["notes.js"]).await.context("importing notes.js")?;
    let notes = NotesClient::connect(&controller).await?;
    notes.add("buy milk").await?;
    notes.add("call home").await?;
    if let Err(e) = notes.add("").await {
        println!("empty note refused: {}", e);
    }
    println!("notes: {:?}", notes.list().await?);

    // worker -> controller
    let clock = worker.connect("clock", vec![]).await.context("connecting to clock")?;
    let uptime: u64 = clock.call_as("uptimeMillis", vec![]).await?;
    println!("controller clock has been up for {}ms", uptime);

    controller.disconnect(speak.proxy()).await?;
    controller.disconnect(notes.proxy()).await?;
    worker.disconnect(&clock).await?;
    if let Err(e) = speak.concat("again").await {
        println!("after disconnect: {}", e);
    }

    tracing::info!(
        worker_instances = worker.live_instances(),
        controller_instances = controller.live_instances(),
        violations = worker.protocol_violations() + controller.protocol_violations(),
        "demo finished"
    );

    controller.terminate();
    worker.terminate();
    Ok(())
}
