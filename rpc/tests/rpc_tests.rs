use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use strand_broker::{Address, MemoryBroker};
use strand_rpc::{
    Client, Connection, Context, Dispatcher, HandlerError, Message, Pool,
    Replies, Reply, Request, RemoteErrorKind, RpcConfig, RpcError, RpcHandler,
    Version,
};

fn test_config(broker: &str) -> RpcConfig {
    RpcConfig {
        broker_url: format!("memory://{}", broker),
        reconnect_interval_min: 10,
        reconnect_interval_max: 50,
        consume_timeout_ms: 100,
        response_timeout_ms: 5_000,
        ..Default::default()
    }
}

struct TestHandler {
    version: Version,
    hits: Arc<AtomicU32>,
}

impl TestHandler {
    fn boxed(major: u32, minor: u32) -> (Box<Self>, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let handler = Box::new(Self {
            version: Version::new(major, minor),
            hits: hits.clone(),
        });
        (handler, hits)
    }
}

#[async_trait]
impl RpcHandler for TestHandler {
    fn version(&self) -> Version {
        self.version
    }

    async fn execute(
        &self,
        _ctx: &Context,
        method: &str,
        args: &serde_json::Map<String, Value>,
    ) -> Result<Replies, HandlerError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        match method {
            "echo" => Ok(Replies::One(
                args.get("value").cloned().unwrap_or(Value::Null),
            )),
            "bump" => Ok(Replies::One(Value::Null)),
            "many" => Ok(Replies::Many(vec![
                serde_json::json!(1),
                serde_json::json!(2),
                serde_json::json!(3),
            ])),
            "boom" => Err(HandlerError::application("kaboom")),
            _ => Err(HandlerError::NoSuchMethod),
        }
    }
}

async fn start_server(
    conf: &RpcConfig,
    topic: &str,
    fanout: bool,
) -> (strand_rpc::ConsumerThread, Arc<AtomicU32>) {
    let mut dispatcher = Dispatcher::new();
    let (handler, hits) = TestHandler::boxed(1, 0);
    dispatcher.register(handler).unwrap();
    let mut conn = Connection::open(conf.clone()).await.unwrap();
    conn.create_consumer(topic, Arc::new(dispatcher), fanout)
        .await
        .unwrap();
    (conn.consume_in_thread(), hits)
}

async fn wait_for(hits: &AtomicU32, expected: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while hits.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "timed out waiting for dispatches");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn call_round_trip() {
    let conf = test_config("call_round_trip");
    let (server, _) = start_server(&conf, "compute", false).await;

    let client = Client::new(Pool::new(conf));
    let request = Request::new("echo").arg("value", serde_json::json!("hi"));
    let result = client
        .call(&Context::new(), "compute", request, None)
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!("hi"));

    server.cancel().await.unwrap();
}

#[tokio::test]
async fn unsupported_version_is_relayed() {
    let conf = test_config("unsupported_version");
    let (_server, _) = start_server(&conf, "compute", false).await;

    let client = Client::new(Pool::new(conf));
    let request = Request::new("echo").versioned("9.0");
    let err = client
        .call(&Context::new(), "compute", request, None)
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(info) => {
            assert_eq!(info.kind, RemoteErrorKind::UnsupportedVersion)
        }
        other => panic!("unexpected error {}", other),
    }
}

#[tokio::test]
async fn unknown_method_is_relayed() {
    let conf = test_config("unknown_method");
    let (_server, _) = start_server(&conf, "compute", false).await;

    let client = Client::new(Pool::new(conf));
    let err = client
        .call(&Context::new(), "compute", Request::new("vanish"), None)
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(info) => {
            assert_eq!(info.kind, RemoteErrorKind::NoSuchMethod)
        }
        other => panic!("unexpected error {}", other),
    }
}

#[tokio::test]
async fn casts_load_share_across_topic_consumers() {
    let conf = test_config("cast_load_share");
    let (_s1, hits1) = start_server(&conf, "workers", false).await;
    let (_s2, hits2) = start_server(&conf, "workers", false).await;

    let client = Client::new(Pool::new(conf));
    let ctx = Context::new();
    for _ in 0..10 {
        client
            .cast(&ctx, "workers", Request::new("bump"))
            .await
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let total =
            hits1.load(Ordering::SeqCst) + hits2.load(Ordering::SeqCst);
        if total == 10 {
            break;
        }
        assert!(total < 10, "message delivered more than once");
        assert!(Instant::now() < deadline, "casts not delivered in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Settle and recheck: still exactly ten dispatches in total.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        hits1.load(Ordering::SeqCst) + hits2.load(Ordering::SeqCst),
        10
    );
}

#[tokio::test]
async fn fanout_cast_reaches_every_consumer() {
    let conf = test_config("fanout_cast");
    let (_s1, hits1) = start_server(&conf, "events", true).await;
    let (_s2, hits2) = start_server(&conf, "events", true).await;

    let client = Client::new(Pool::new(conf));
    client
        .fanout_cast(&Context::new(), "events", Request::new("bump"))
        .await
        .unwrap();

    wait_for(&hits1, 1).await;
    wait_for(&hits2, 1).await;
}

#[tokio::test]
async fn notify_is_dispatched() {
    let conf = test_config("notify");
    let (_server, hits) = start_server(&conf, "notifications", false).await;

    let client = Client::new(Pool::new(conf));
    client
        .notify(&Context::new(), "notifications", Request::new("bump"))
        .await
        .unwrap();
    wait_for(&hits, 1).await;
}

#[tokio::test]
async fn multicall_streams_results_in_order() {
    let conf = test_config("multicall_order");
    let (_server, _) = start_server(&conf, "compute", false).await;

    let client = Client::new(Pool::new(conf));
    let mut stream = client
        .multicall(&Context::new(), "compute", Request::new("many"), None)
        .await
        .unwrap();

    let mut got = Vec::new();
    while let Some(value) = stream.next().await {
        got.push(value.unwrap());
    }
    assert_eq!(
        got,
        vec![
            serde_json::json!(1),
            serde_json::json!(2),
            serde_json::json!(3)
        ]
    );
    // The stream stays ended after the ending marker.
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn handler_failure_does_not_wedge_the_consumer() {
    let conf = test_config("handler_failure");
    let (_server, _) = start_server(&conf, "compute", false).await;

    let client = Client::new(Pool::new(conf));
    let ctx = Context::new();
    let err = client
        .call(&ctx, "compute", Request::new("boom"), None)
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(info) => {
            assert_eq!(info.kind, RemoteErrorKind::Application);
            assert_eq!(info.message, "kaboom");
        }
        other => panic!("unexpected error {}", other),
    }

    // The same consumer loop keeps serving.
    let request = Request::new("echo").arg("value", serde_json::json!(7));
    let result = client.call(&ctx, "compute", request, None).await.unwrap();
    assert_eq!(result, serde_json::json!(7));
}

#[tokio::test]
async fn call_times_out_without_a_server() {
    let conf = test_config("call_timeout");
    let client = Client::new(Pool::new(conf));
    let start = Instant::now();
    let err = client
        .call(
            &Context::new(),
            "nobody",
            Request::new("echo"),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));
    // The deadline fires close to when asked, not eventually.
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn transient_failures_are_retried_until_declare_succeeds() {
    let conf = test_config("reconnect_attempts");
    let broker = MemoryBroker::get("reconnect_attempts");
    let mut conn = Connection::open(conf).await.unwrap();

    broker.fail_next(2);
    let before = broker.declare_attempts();
    conn.declare_queue(&Address::direct("resilient")).await.unwrap();
    // Two injected failures cost exactly two extra attempts.
    assert_eq!(broker.declare_attempts() - before, 3);
}

#[tokio::test]
async fn multicall_timeout_restarts_per_fetch() {
    let conf = test_config("per_fetch_timeout");
    let client = Client::new(Pool::new(conf.clone()));

    let mut stream = client
        .multicall(
            &Context::new(),
            "slow",
            Request::new("trickle"),
            Some(Duration::from_millis(350)),
        )
        .await
        .unwrap();

    // Stand-in for a slow server: pull the request off the topic queue and
    // drip replies with gaps under the timeout but a total well over it.
    let server_conf = conf.clone();
    tokio::spawn(async move {
        let mut conn = Connection::open(server_conf).await.unwrap();
        let topic = Address::topic("strand", "slow");
        conn.declare_queue(&topic).await.unwrap();
        let delivery = conn
            .consume_raw(&topic.queue, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let msg = Message::decode(&delivery.body).unwrap();
        let msg_id = msg.msg_id.unwrap();
        let reply_addr = Address::direct(&msg_id);
        for i in 0..3 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let reply = Reply::result(&msg_id, serde_json::json!(i));
            conn.publish(&reply_addr, &reply.encode().unwrap())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let reply = Reply::ending(&msg_id);
        conn.publish(&reply_addr, &reply.encode().unwrap())
            .await
            .unwrap();
    });

    let start = Instant::now();
    let mut got = Vec::new();
    while let Some(value) = stream.next().await {
        got.push(value.unwrap());
    }
    assert_eq!(got.len(), 3);
    // Four 200ms gaps total 800ms, past the 350ms window. Only a clock
    // that restarts on every fetch gets all three results through.
    assert!(start.elapsed() >= Duration::from_millis(700));
}

#[tokio::test]
async fn reply_queue_is_removed_when_the_stream_ends() {
    let conf = test_config("reply_queue_cleanup");
    let broker = MemoryBroker::get("reply_queue_cleanup");
    let client = Client::new(Pool::new(conf.clone()));

    let mut stream = client
        .multicall(
            &Context::new(),
            "cleanup",
            Request::new("noop"),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let mut conn = Connection::open(conf).await.unwrap();
    let topic = Address::topic("strand", "cleanup");
    conn.declare_queue(&topic).await.unwrap();
    let delivery = conn
        .consume_raw(&topic.queue, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    let msg = Message::decode(&delivery.body).unwrap();
    let msg_id = msg.msg_id.unwrap();
    assert!(broker.core().queue(&msg_id).is_some());

    let reply = Reply::ending(&msg_id);
    conn.publish(&Address::direct(&msg_id), &reply.encode().unwrap())
        .await
        .unwrap();

    assert!(stream.next().await.is_none());
    // The per-call reply queue is gone once the stream has ended.
    assert!(broker.core().queue(&msg_id).is_none());
}

#[tokio::test]
async fn replies_with_foreign_correlation_ids_are_dropped() {
    let conf = test_config("foreign_replies");
    let client = Client::new(Pool::new(conf.clone()));

    let mut stream = client
        .multicall(
            &Context::new(),
            "strict",
            Request::new("echo"),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let server_conf = conf.clone();
    tokio::spawn(async move {
        let mut conn = Connection::open(server_conf).await.unwrap();
        let topic = Address::topic("strand", "strict");
        conn.declare_queue(&topic).await.unwrap();
        let delivery = conn
            .consume_raw(&topic.queue, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let msg = Message::decode(&delivery.body).unwrap();
        let msg_id = msg.msg_id.unwrap();
        let reply_addr = Address::direct(&msg_id);
        // A reply correlated to someone else lands in the queue first.
        let stray = Reply::result("someone-else", serde_json::json!("bogus"));
        conn.publish(&reply_addr, &stray.encode().unwrap())
            .await
            .unwrap();
        let real = Reply::result(&msg_id, serde_json::json!("real"));
        conn.publish(&reply_addr, &real.encode().unwrap())
            .await
            .unwrap();
        let end = Reply::ending(&msg_id);
        conn.publish(&reply_addr, &end.encode().unwrap())
            .await
            .unwrap();
    });

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, serde_json::json!("real"));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn bare_encoding_interoperates() {
    let mut conf = test_config("bare_encoding");
    conf.envelope = false;
    let (_server, _) = start_server(&conf, "compute", false).await;

    let client = Client::new(Pool::new(conf));
    let request = Request::new("echo").arg("value", serde_json::json!(true));
    let result = client
        .call(&Context::new(), "compute", request, None)
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!(true));
}
