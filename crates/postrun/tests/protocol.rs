//! Tests driving a peer from a raw transport end: malformed and unsolicited
//! traffic, timeouts and channel teardown

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::init_tracing;
use common::peers;
use common::speak;
use postrun::Args;
use postrun::CallId;
use postrun::DuplexTransport;
use postrun::Error;
use postrun::InstanceId;
use postrun::Peer;
use postrun::Service;
use postrun::Transport;
use postrun::transport;
use postrpc::Message;
use serde_json::json;

/// A peer whose counterpart is driven by hand.
fn raw_peer(name: &str) -> (Peer, DuplexTransport) {
    init_tracing();
    let (ours, theirs) = DuplexTransport::pair();
    (Peer::new(name, ours), theirs)
}

async fn next_message(raw: &DuplexTransport) -> Message {
    let bytes = tokio::time::timeout(Duration::from_secs(5), raw.recv())
        .await
        .expect("no message within 5s")
        .expect("recv failed")
        .expect("channel closed");
    Message::decode(&bytes).expect("peer sent a malformed message")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Dispatches written by hand are answered with the same call and instance id
#[tokio::test]
async fn test_serves_raw_dispatch() {
    let (worker, raw) = raw_peer("worker");
    worker.register("speak", speak()).expect("register speak");

    raw.send(br#"[0,41,0,"connect",["speak",["Hello, "]]]"#).await.expect("send");
    let Message::Resolve { call_id, instance_id, value } = next_message(&raw).await else {
        panic!("expected a resolve");
    };
    assert_eq!(call_id, CallId(41));
    assert_eq!(instance_id, InstanceId::SYSTEM);
    assert_eq!(value, json!([1, ["concat"]]));

    raw.send(br#"[0,42,1,"concat",["World"]]"#).await.expect("send");
    let reply = next_message(&raw).await;
    assert_eq!(reply.encode().expect("encode"), br#"[1,42,1,null,"Hello, World"]"#.to_vec());
}

/// Unknown instances and methods are rejected with lookup errors
#[tokio::test]
async fn test_rejects_lookup_failures() {
    let (worker, raw) = raw_peer("worker");
    worker.register("speak", speak()).expect("register speak");

    raw.send(br#"[0,1,7,"concat",["x"]]"#).await.expect("send");
    let Message::Reject { call_id, reason, .. } = next_message(&raw).await else {
        panic!("expected a reject");
    };
    assert_eq!(call_id, CallId(1));
    assert_eq!(reason, "invalid instance: instance-7");

    raw.send(br#"[0,2,0,"connect",["speak",["p"]]]"#).await.expect("send");
    next_message(&raw).await;

    raw.send(br#"[0,3,1,"shout",[]]"#).await.expect("send");
    let Message::Reject { reason, .. } = next_message(&raw).await else {
        panic!("expected a reject");
    };
    assert_eq!(reason, "invalid method: shout on instance-1");
}

/// Malformed messages are dropped and counted; the peer keeps serving
#[tokio::test]
async fn test_malformed_messages_are_dropped() {
    let (worker, raw) = raw_peer("worker");
    worker.register("speak", speak()).expect("register speak");

    let garbage: [&[u8]; 5] = [
        b"not json",
        br#"{"kind":0}"#,
        br#"[0,1,0,"connect"]"#,
        br#"[9,1,0,null,null]"#,
        br#"[0,-1,0,"connect",[]]"#,
    ];
    for bytes in garbage {
        raw.send(bytes).await.expect("send");
    }

    raw.send(br#"[0,5,0,"connect",["speak",["ok "]]]"#).await.expect("send");
    let reply = next_message(&raw).await;

    assert_eq!(reply.call_id(), CallId(5));
    assert!(matches!(reply, Message::Resolve { .. }));
    assert_eq!(worker.protocol_violations(), 5);
}

/// Replies with no outstanding call are violations and are otherwise ignored
#[tokio::test]
async fn test_unsolicited_replies_are_violations() {
    let (controller, raw) = raw_peer("controller");

    raw.send(br#"[1,99,0,null,"surprise"]"#).await.expect("send");
    raw.send(br#"[2,100,0,null,"nobody asked"]"#).await.expect("send");
    settle().await;

    assert_eq!(controller.protocol_violations(), 2);
    assert_eq!(controller.pending_calls(), 0);
    assert!(!controller.is_terminated());
}

/// A reply settles its call exactly once; a duplicate is a violation
#[tokio::test]
async fn test_duplicate_reply_is_ignored() {
    let (controller, raw) = raw_peer("controller");

    let call = tokio::spawn(async move {
        let result = controller.call(InstanceId(3), "ping", vec![]).await;
        (controller, result)
    });

    let dispatch = next_message(&raw).await;
    let call_id = dispatch.call_id();
    let resolve = Message::Resolve { call_id, instance_id: InstanceId(3), value: json!("pong") };
    let bytes = resolve.encode().expect("encode");
    raw.send(&bytes).await.expect("send");
    raw.send(&bytes).await.expect("send");

    let (controller, result) = call.await.expect("join");
    assert_eq!(result.expect("ping"), json!("pong"));
    settle().await;
    assert_eq!(controller.protocol_violations(), 1);
}

/// A reply that never comes fails the call after the configured timeout
#[tokio::test]
async fn test_call_timeout() {
    init_tracing();
    let (ours, raw) = DuplexTransport::pair();
    let controller = Peer::builder("controller").call_timeout(Duration::from_millis(50)).build(ours);

    let err = controller.call(InstanceId(1), "slow", vec![]).await.unwrap_err();
    let dispatch = next_message(&raw).await;

    assert_eq!(err, Error::Timeout(dispatch.call_id()));
    assert_eq!(controller.pending_calls(), 0);

    // the late reply no longer matches anything
    let late = Message::Resolve { call_id: dispatch.call_id(), instance_id: InstanceId(1), value: json!(1) };
    raw.send(&late.encode().expect("encode")).await.expect("send");
    settle().await;
    assert_eq!(controller.protocol_violations(), 1);
}

/// The counterpart closing the channel fails every outstanding call
#[tokio::test]
async fn test_transport_close_fails_pending_calls() {
    let (controller, raw) = raw_peer("controller");

    let first = controller.call(InstanceId(1), "a", vec![]);
    let second = controller.call(InstanceId(1), "b", vec![]);
    let closer = async {
        next_message(&raw).await;
        next_message(&raw).await;
        raw.close();
    };

    let (first, second, ()) = tokio::join!(first, second, closer);

    assert!(matches!(first, Err(Error::Transport(transport::Error::ConnectionLost(_)))));
    assert!(matches!(second, Err(Error::Transport(transport::Error::ConnectionLost(_)))));
    assert!(controller.is_terminated());
    assert_eq!(controller.pending_calls(), 0);

    let err = controller.call(InstanceId(1), "c", vec![]).await.unwrap_err();
    assert_eq!(err, Error::Terminated);
}

/// Terminating fails outstanding calls and refuses new ones
#[tokio::test]
async fn test_terminate() {
    let (controller, raw) = raw_peer("controller");

    let (result, ()) = tokio::join!(controller.call(InstanceId(1), "wait", vec![]), async {
        next_message(&raw).await;
        controller.terminate();
    });

    assert_eq!(result.unwrap_err(), Error::Terminated);
    assert!(controller.is_terminated());
    assert_eq!(controller.pending_calls(), 0);

    let err = controller.connect("speak", vec![]).await.unwrap_err();
    assert_eq!(err, Error::Terminated);

    // the channel is torn down: nothing further arrives, the stream just ends
    let rest = tokio::time::timeout(Duration::from_secs(1), raw.recv()).await;
    assert_eq!(rest.expect("stream did not end").expect("recv"), None);
}

/// The counterpart of a terminated peer sees the channel end instead of waiting
#[tokio::test]
async fn test_terminate_tears_down_channel() {
    let (controller, worker) = peers();
    worker.register("speak", speak()).expect("register speak");

    worker.terminate();

    let result = tokio::time::timeout(Duration::from_secs(1), controller.connect("speak", vec![json!("")]))
        .await
        .expect("connect hung on a terminated counterpart");
    assert!(matches!(result, Err(Error::Transport(_)) | Err(Error::Terminated)));

    settle().await;
    assert!(controller.is_terminated());
    assert_eq!(controller.pending_calls(), 0);
}

struct Slow {
    finished: Arc<AtomicBool>,
}

/// Methods still running when their peer terminates are cancelled and never reply
#[tokio::test]
async fn test_terminate_cancels_running_methods() {
    let (controller, worker) = peers();
    let finished = Arc::new(AtomicBool::new(false));
    let service = Service::builder({
        let finished = finished.clone();
        move |_args: Args| Ok(Slow { finished: finished.clone() })
    })
    .method("wait", |this: Arc<Slow>, _args: Args| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        this.finished.store(true, Ordering::SeqCst);
        Ok("late")
    })
    .build();
    worker.register("slow", service).expect("register slow");
    let proxy = controller.connect("slow", vec![]).await.expect("connect");

    let (result, ()) = tokio::join!(proxy.call("wait", vec![]), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.terminate();
    });

    assert!(matches!(result, Err(Error::Transport(_))), "unexpected outcome: {:?}", result);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!finished.load(Ordering::SeqCst));
}

/// Dropping a peer terminates it: its proxies fail and the counterpart sees the channel end
#[tokio::test]
async fn test_drop_terminates_peer() {
    let (controller, worker) = peers();
    worker.register("speak", speak()).expect("register speak");
    let proxy = controller.connect("speak", vec![json!("")]).await.expect("connect");

    drop(controller);

    let err = proxy.call("concat", vec![json!("after drop")]).await.unwrap_err();
    assert_eq!(err, Error::Terminated);

    settle().await;
    assert!(worker.is_terminated());
}

/// An instance granted after its connect timed out is released again
#[tokio::test]
async fn test_late_connect_grant_is_released() {
    init_tracing();
    let (ours, raw) = DuplexTransport::pair();
    let controller = Peer::builder("controller").call_timeout(Duration::from_millis(50)).build(ours);

    let err = controller.connect("speak", vec![]).await.unwrap_err();
    let connect = next_message(&raw).await;
    assert_eq!(err, Error::Timeout(connect.call_id()));

    let grant = Message::Resolve {
        call_id: connect.call_id(),
        instance_id: InstanceId::SYSTEM,
        value: json!([5, ["concat"]]),
    };
    raw.send(&grant.encode().expect("encode")).await.expect("send");

    let Message::Dispatch { instance_id, method, args, .. } = next_message(&raw).await else {
        panic!("expected a dispatch");
    };
    assert_eq!(instance_id, InstanceId::SYSTEM);
    assert_eq!(method, "disconnect");
    assert_eq!(args, vec![json!(5)]);
    assert_eq!(controller.protocol_violations(), 0);
}

/// A connect reply naming the system instance is refused
#[tokio::test]
async fn test_connect_rejects_system_grant() {
    let (controller, raw) = raw_peer("controller");

    let (result, ()) = tokio::join!(controller.connect("speak", vec![]), async {
        let dispatch = next_message(&raw).await;
        let forged = Message::Resolve {
            call_id: dispatch.call_id(),
            instance_id: InstanceId::SYSTEM,
            value: json!([0, ["concat"]]),
        };
        raw.send(&forged.encode().expect("encode")).await.expect("send");
    });

    assert!(matches!(result, Err(Error::InvalidReply(_))));
}

/// A connect reply of the wrong shape is refused
#[tokio::test]
async fn test_connect_rejects_malformed_grant() {
    let (controller, raw) = raw_peer("controller");

    let (result, ()) = tokio::join!(controller.connect("speak", vec![]), async {
        let dispatch = next_message(&raw).await;
        let forged = Message::Resolve {
            call_id: dispatch.call_id(),
            instance_id: InstanceId::SYSTEM,
            value: json!({ "id": 4 }),
        };
        raw.send(&forged.encode().expect("encode")).await.expect("send");
    });

    assert!(matches!(result, Err(Error::InvalidReply(_))));
}
