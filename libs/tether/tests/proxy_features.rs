//! Oneway, batch, future, stream and reconnect behavior of the proxy

mod common;

use common::{start, test_config, wait_until, Calculator, Recorder, Thermostat};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::{args, Daemon, Endpoint, Error, Proxy, Target, Value};

#[test_log::test(tokio::test)]
async fn oneway_calls_return_immediately() {
    let (daemon, _task) = start(test_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let uri = daemon
        .register(Target::instance(Recorder { calls: calls.clone() }), None)
        .unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    proxy.bind().await.unwrap();

    let started = Instant::now();
    assert_eq!(proxy.call("record", args![]).await.unwrap(), Value::Null);
    assert!(started.elapsed() < Duration::from_millis(400));

    // The connection keeps serving while the oneway call runs
    assert_eq!(proxy.call("calls", args![]).await.unwrap(), Value::Int(0));
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1).await);
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn client_side_oneway_marking() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    proxy.set_oneway("sleep", true);

    let started = Instant::now();
    assert_eq!(proxy.call("sleep", args![500]).await.unwrap(), Value::Null);
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(proxy.call("add", args![1, 2]).await.unwrap(), Value::Int(3));
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn batch_uses_one_round_trip() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    proxy.bind().await.unwrap();

    let mut batch = proxy.batch();
    batch.add("add", args![1, 2]);
    batch.add("echo", args!["x"]);
    let third = batch.add("add", args![10, 20]);
    assert_eq!(third, 2);

    let results = batch.execute().await.unwrap();
    assert_eq!(proxy.stats().round_trips, 1);
    assert!(results.is_complete());
    assert_eq!(
        results.into_values().unwrap(),
        vec![Value::Int(3), Value::from("x"), Value::Int(30)]
    );
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn batch_stops_at_first_error() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let mut batch = proxy.batch();
    batch.add("add", args![1, 1]);
    batch.add("div", args![1, 0]);
    batch.add("add", args![2, 2]);
    let results = batch.execute().await.unwrap();

    assert_eq!(results.submitted(), 3);
    assert_eq!(results.len(), 2);
    assert!(!results.is_complete());
    assert_eq!(results.get(0).unwrap().as_ref().unwrap(), &Value::Int(2));
    let err = results.get(1).unwrap().as_ref().unwrap_err();
    assert_eq!(err.remote_kind(), Some("ZeroDivisionError"));

    assert!(proxy.batch().execute().await.is_err());
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn futures_resolve_and_chain() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let sum = proxy.future("add").call(args![1, 2]);
    let chained = sum.then("add", args![10]);
    assert_eq!(sum.value().await.unwrap(), Value::Int(3));
    assert!(sum.ready());
    assert_eq!(chained.value().await.unwrap(), Value::Int(13));

    let slow = proxy.future("sleep").call(args![1000]);
    assert!(!slow.wait(Some(Duration::from_millis(50))).await);
    assert!(slow.wait(None).await);
    assert_eq!(slow.value().await.unwrap(), Value::Null);

    let failed = proxy.future("div").call(args![1, 0]);
    let after = failed.then("add", args![1]);
    assert!(after.value().await.is_err());

    // Futures run on their own connections
    assert!(!proxy.is_connected().await);
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn streams_deliver_items_in_order() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let stream = proxy.call_stream("count", args![4]).await.unwrap();
    let items = stream.collect().await.unwrap();
    assert_eq!(items, (1..=4).map(Value::Int).collect::<Vec<_>>());
    assert!(wait_until(|| daemon.stream_count() == 0).await);

    let mut stream = proxy.call_stream("count", args![100]).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), Value::Int(1));
    assert_eq!(daemon.stream_count(), 1);
    stream.close().await.unwrap();
    assert!(wait_until(|| daemon.stream_count() == 0).await);

    let err = proxy.call("count", args![3]).await.unwrap_err();
    assert!(matches!(err, Error::Usage { .. }), "got {:?}", err);
    assert!(wait_until(|| daemon.stream_count() == 0).await);
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn streams_end_with_the_connection() {
    let (daemon, _task) = start(test_config().with_stream_limits(0.0, 0.0)).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let mut stream = proxy.call_stream("count", args![10]).await.unwrap();
    stream.next().await.unwrap().unwrap();
    drop(stream);
    assert_eq!(daemon.stream_count(), 1);

    proxy.release().await;
    assert!(wait_until(|| daemon.stream_count() == 0).await);
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn stream_failure_arrives_on_the_stream() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let mut stream = proxy.call_stream("count_then_fail", args![2]).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), Value::Int(1));
    assert_eq!(stream.next().await.unwrap().unwrap(), Value::Int(2));
    // The error reply answers under the stream's correlation id
    match stream.next().await.unwrap().unwrap_err() {
        Error::Remote(remote) => {
            assert_eq!(remote.kind, "ValueError");
            assert_eq!(remote.message, "ran dry");
        }
        other => panic!("expected the remote failure, got {:?}", other),
    }
    assert!(stream.is_finished());
    assert!(stream.next().await.is_none());
    assert_eq!(daemon.stream_count(), 0);

    assert_eq!(proxy.call("add", args![1, 2]).await.unwrap(), Value::Int(3));
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn streaming_can_be_disabled() {
    let (daemon, _task) = start(test_config().with_iter_streaming(false)).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let err = proxy.call_stream("count", args![3]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "got {:?}", err);
    assert_eq!(daemon.stream_count(), 0);
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn call_timeout() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    proxy.set_timeout(Some(Duration::from_millis(200)));

    let err = proxy.call("sleep", args![2000]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {:?}", err);
    assert!(err.is_communication());

    // A late reply must not be taken for the next call's
    proxy.set_timeout(Some(Duration::from_secs(5)));
    assert_eq!(proxy.call("add", args![4, 4]).await.unwrap(), Value::Int(8));
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn autoreconnect_after_daemon_restart() {
    let (first, first_task) = start(test_config().with_max_retries(1)).await;
    let uri = first.register(Target::instance(Calculator), Some("calc")).unwrap();
    let port = match first.location() {
        Endpoint::Tcp { port, .. } => *port,
        other => panic!("expected a tcp location, got {}", other),
    };

    let proxy = Proxy::new(uri, first.config().clone()).unwrap();
    proxy.set_autoreconnect(true);
    assert_eq!(proxy.call("add", args![1, 1]).await.unwrap(), Value::Int(2));

    first.shutdown().await;
    first_task.await.unwrap().unwrap();

    let mut config = test_config();
    config.port = port;
    let second = Daemon::bind(config).await.unwrap();
    second.register(Target::instance(Calculator), Some("calc")).unwrap();
    let _second_task = second.spawn();

    assert_eq!(proxy.call("add", args![2, 2]).await.unwrap(), Value::Int(4));
    let stats = proxy.stats();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.connects, 2);
    second.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn autoreconnect_respects_a_zero_retry_budget() {
    let (first, first_task) = start(test_config()).await;
    let uri = first.register(Target::instance(Calculator), Some("calc")).unwrap();
    let port = match first.location() {
        Endpoint::Tcp { port, .. } => *port,
        other => panic!("expected a tcp location, got {}", other),
    };

    let proxy = Proxy::new(uri, first.config().clone()).unwrap();
    proxy.set_autoreconnect(true);
    assert_eq!(proxy.call("add", args![1, 1]).await.unwrap(), Value::Int(2));

    first.shutdown().await;
    first_task.await.unwrap().unwrap();

    let mut config = test_config();
    config.port = port;
    let second = Daemon::bind(config).await.unwrap();
    second.register(Target::instance(Calculator), Some("calc")).unwrap();
    let _second_task = second.spawn();

    let err = proxy.call("add", args![2, 2]).await.unwrap_err();
    assert!(err.is_communication(), "got {:?}", err);
    assert_eq!(proxy.stats().reconnects, 0);

    // The dropped connection is discarded, so the next call connects afresh
    assert_eq!(proxy.call("add", args![2, 2]).await.unwrap(), Value::Int(4));
    second.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn without_autoreconnect_a_lost_connection_fails() {
    let (first, first_task) = start(test_config()).await;
    let uri = first.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, first.config().clone()).unwrap();
    proxy.ping().await.unwrap();

    first.shutdown().await;
    first_task.await.unwrap().unwrap();
    let err = proxy.call("add", args![1, 1]).await.unwrap_err();
    assert!(err.is_communication(), "got {:?}", err);
}

#[test_log::test(tokio::test)]
async fn unknown_names_fail_before_the_wire() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon
        .register(Target::instance(Thermostat { level: Arc::new(AtomicI64::new(0)) }), None)
        .unwrap();
    let proxy = Proxy::new(uri.clone(), daemon.config().clone()).unwrap();

    proxy.call("reset", args![]).await.unwrap();
    assert_eq!(proxy.stats().round_trips, 1);

    let err = proxy.call("explode", args![]).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("AttributeError"));
    assert!(err.to_string().contains("no exposed method 'explode'"), "got {}", err);
    let err = proxy.get_attr("humidity").await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("AttributeError"));
    assert!(proxy.call_stream("level", args![]).await.is_err());
    assert_eq!(proxy.stats().round_trips, 1);

    // Without metadata the daemon does the refusing
    let mut config = daemon.config().as_ref().clone();
    config.metadata = false;
    let blind = Proxy::new(uri, config).unwrap();
    let err = blind.call("explode", args![]).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("AttributeError"));
    assert_eq!(blind.stats().round_trips, 1);
    daemon.shutdown().await;
}
