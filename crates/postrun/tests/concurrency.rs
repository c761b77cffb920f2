//! Tests for many calls in flight over one channel

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::peers;
use futures::future::join;
use futures::future::join_all;
use postrun::Args;
use postrun::Service;
use rand::Rng;
use serde_json::json;

struct Echo;

/// `echo.delayed(ms, tag)` answers `tag` after sleeping `ms` milliseconds.
fn echo() -> Service {
    Service::builder(|_args: Args| Ok(Echo))
        .method("delayed", |_this: Arc<Echo>, args: Args| async move {
            let ms: u64 = args.get(0)?;
            let tag: u64 = args.get(1)?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(tag)
        })
        .build()
}

/// Replies arriving in any order reach the right callers
#[tokio::test]
async fn test_concurrent_calls_match_replies() {
    let (controller, worker) = peers();
    worker.register("echo", echo()).expect("register echo");
    let proxy = controller.connect("echo", vec![]).await.expect("connect");

    let delays: Vec<u64> = {
        let mut rng = rand::thread_rng();
        (0..64).map(|_| rng.gen_range(0..40)).collect()
    };

    let calls = delays.iter().enumerate().map(|(tag, ms)| {
        let proxy = proxy.clone();
        let ms = *ms;
        async move { proxy.call_as::<u64>("delayed", vec![json!(ms), json!(tag)]).await }
    });
    let results = join_all(calls).await;

    for (tag, result) in results.into_iter().enumerate() {
        assert_eq!(result.expect("delayed"), tag as u64);
    }
    assert_eq!(controller.pending_calls(), 0);
}

/// A fast call issued after a slow one is not held up by it
#[tokio::test]
async fn test_fast_call_overtakes_slow_call() {
    let (controller, worker) = peers();
    worker.register("echo", echo()).expect("register echo");
    let proxy = controller.connect("echo", vec![]).await.expect("connect");

    let slow = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.call_as::<u64>("delayed", vec![json!(300), json!(1)]).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.pending_calls(), 1);

    let fast: u64 = proxy.call_as("delayed", vec![json!(0), json!(2)]).await.expect("fast");
    assert_eq!(fast, 2);
    assert!(!slow.is_finished());

    assert_eq!(slow.await.expect("join").expect("slow"), 1);
}

/// Calls through different proxies and both directions interleave freely
#[tokio::test]
async fn test_interleaved_directions() {
    let (controller, worker) = peers();
    let controller = Arc::new(controller);
    let worker = Arc::new(worker);
    controller.register("echo", echo()).expect("register on controller");
    worker.register("echo", echo()).expect("register on worker");

    let tasks = (0..16u64).map(|i| {
        let (caller, label) = if i % 2 == 0 { (controller.clone(), "c") } else { (worker.clone(), "w") };
        tokio::spawn(async move {
            let proxy = caller.connect("echo", vec![]).await.expect("connect");
            let value: u64 = proxy.call_as("delayed", vec![json!(i % 5), json!(i)]).await.expect("delayed");
            caller.disconnect(&proxy).await.expect("disconnect");
            (label, value)
        })
    });

    for (i, joined) in join_all(tasks).await.into_iter().enumerate() {
        let (label, value) = joined.expect("task");
        assert_eq!(value, i as u64);
        assert_eq!(label, if i % 2 == 0 { "c" } else { "w" });
    }

    assert_eq!(controller.live_instances(), 0);
    assert_eq!(worker.live_instances(), 0);
    assert_eq!(controller.pending_calls(), 0);
    assert_eq!(worker.pending_calls(), 0);
}

/// A disconnect followed immediately by a call sees the instance gone
#[tokio::test]
async fn test_disconnect_then_call_in_one_burst() {
    let (controller, worker) = peers();
    worker.register("echo", echo()).expect("register echo");
    let proxy = controller.connect("echo", vec![]).await.expect("connect");

    // join polls in order, so the disconnect is sent first
    let (released, late) = join(
        controller.disconnect(&proxy),
        proxy.call("delayed", vec![json!(0), json!(9)]),
    )
    .await;

    released.expect("disconnect");
    let err = late.unwrap_err();
    assert!(err.remote_message().is_some_and(|m| m.starts_with("invalid instance")));
}
