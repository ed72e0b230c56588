//! Daemon dispatch, instance modes and per-connection cleanup over real sockets

mod common;

use common::{start, test_config, wait_until, Calculator, Identity, ResourceOwner, Thermostat};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tether::{args, Error, InstanceMode, Proxy, Target, Value};

#[test_log::test(tokio::test)]
async fn calls_reach_registered_object() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon
        .register(Target::instance(Calculator), Some("calculator"))
        .unwrap();
    assert_eq!(uri.object(), "calculator");

    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    assert_eq!(proxy.call("add", args![2, 3]).await.unwrap(), Value::Int(5));
    assert_eq!(
        proxy.call("echo", args!["round trip"]).await.unwrap(),
        Value::from("round trip")
    );

    let meta = proxy.metadata().await.expect("metadata sent on connect");
    assert!(meta.methods.contains("add"));
    assert!(!meta.methods.contains("missing"));

    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn remote_exceptions_keep_kind_and_traceback() {
    let (daemon, _task) = start(test_config().with_detailed_traceback(true)).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let err = proxy.call("div", args![1, 0]).await.unwrap_err();
    match &err {
        Error::Remote(remote) => {
            assert_eq!(remote.kind, "ZeroDivisionError");
            assert_eq!(remote.message, "division by zero");
            assert!(remote.traceback.len() >= 2);
            assert!(remote.traceback[0].contains("div"));
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    // The connection survives an exception
    assert_eq!(proxy.call("div", args![9, 3]).await.unwrap(), Value::Int(3));
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn dispatch_rejects_unknown_targets() {
    let mut config = test_config();
    config.metadata = false;
    let (daemon, _task) = start(config).await;
    let uri = daemon.register(Target::instance(Calculator), Some("calc")).unwrap();

    let proxy = Proxy::new(uri.clone(), daemon.config().clone()).unwrap();
    let err = proxy.call("missing", args![]).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("AttributeError"));

    let err = proxy.call("secret", args![]).await.unwrap_err();
    assert!(matches!(err, Error::Daemon { .. }), "got {:?}", err);

    let ghost = tether::Uri::direct("ghost", daemon.location().clone());
    let proxy = Proxy::new(ghost, daemon.config().clone()).unwrap();
    let err = proxy.call("add", args![1, 1]).await.unwrap_err();
    assert!(matches!(err, Error::Daemon { .. }), "got {:?}", err);

    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn unknown_object_fails_handshake_with_metadata() {
    let (daemon, _task) = start(test_config()).await;
    let ghost = tether::Uri::direct("ghost", daemon.location().clone());
    let proxy = Proxy::new(ghost, daemon.config().clone()).unwrap();

    let err = proxy.call("add", args![1, 1]).await.unwrap_err();
    assert!(matches!(err, Error::Communication { .. }), "got {:?}", err);
    assert!(err.to_string().contains("unknown object"));
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn unregister_and_daemon_object() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), Some("calc")).unwrap();
    assert!(daemon.registered().contains(&"calc".to_string()));
    assert!(daemon.register(Target::instance(Calculator), Some("calc")).is_err());

    let control = daemon.proxy_for(tether::DAEMON_OBJECT_ID).unwrap();
    control.call("ping", args![]).await.unwrap();
    let listed = control.call("registered", args![]).await.unwrap();
    assert!(listed
        .as_list()
        .unwrap()
        .iter()
        .any(|id| id.as_str() == Some("calc")));

    assert!(daemon.unregister("calc").unwrap());
    assert!(!daemon.unregister("calc").unwrap());
    assert!(daemon.unregister(tether::DAEMON_OBJECT_ID).is_err());

    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    assert!(proxy.call("add", args![1, 2]).await.is_err());
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn instance_modes() {
    let (daemon, _task) = start(test_config()).await;
    let single = daemon
        .register(Target::class(InstanceMode::Single, Identity::new), Some("single"))
        .unwrap();
    let session = daemon
        .register(Target::class(InstanceMode::Session, Identity::new), Some("session"))
        .unwrap();
    let percall = daemon
        .register(Target::class(InstanceMode::PerCall, Identity::new), Some("percall"))
        .unwrap();
    let config = daemon.config().clone();

    let a = Proxy::new(single.clone(), config.clone()).unwrap();
    let b = Proxy::new(single, config.clone()).unwrap();
    assert_eq!(
        a.call("identity", args![]).await.unwrap(),
        b.call("identity", args![]).await.unwrap()
    );

    let a = Proxy::new(session.clone(), config.clone()).unwrap();
    let b = Proxy::new(session, config.clone()).unwrap();
    let first = a.call("identity", args![]).await.unwrap();
    assert_eq!(first, a.call("identity", args![]).await.unwrap());
    assert_ne!(first, b.call("identity", args![]).await.unwrap());

    let a = Proxy::new(percall, config).unwrap();
    assert_ne!(
        a.call("identity", args![]).await.unwrap(),
        a.call("identity", args![]).await.unwrap()
    );
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn resources_close_once_per_connection() {
    let (daemon, _task) = start(test_config()).await;
    let closes = Arc::new(AtomicUsize::new(0));
    let uri = daemon
        .register(
            Target::instance(ResourceOwner {
                closes: closes.clone(),
            }),
            None,
        )
        .unwrap();

    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    assert_eq!(proxy.call("open", args![false]).await.unwrap(), Value::Int(1));
    assert_eq!(proxy.call("open", args![true]).await.unwrap(), Value::Int(1));
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    proxy.release().await;
    assert!(wait_until(|| closes.load(Ordering::SeqCst) == 2).await);
    assert!(wait_until(|| daemon.connection_count() == 0).await);

    daemon.shutdown().await;
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn resources_opened_after_disconnect_still_close() {
    let (daemon, _task) = start(test_config()).await;
    let closes = Arc::new(AtomicUsize::new(0));
    let uri = daemon
        .register(
            Target::instance(ResourceOwner {
                closes: closes.clone(),
            }),
            None,
        )
        .unwrap();

    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    assert_eq!(proxy.call("open_later", args![300]).await.unwrap(), Value::Null);
    proxy.release().await;
    assert!(wait_until(|| daemon.connection_count() == 0).await);
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    // The oneway call tracks its resource after teardown
    assert!(wait_until(|| closes.load(Ordering::SeqCst) == 1).await);
    daemon.shutdown().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn oversized_messages_are_refused() {
    let (daemon, _task) = start(test_config().with_max_message_size(2048)).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let err = proxy.call("echo", args![vec![7u8; 4096]]).await.unwrap_err();
    assert!(matches!(err, Error::MessageTooLarge { .. }), "got {:?}", err);

    let err = proxy.call("blob", args![4096]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "got {:?}", err);

    // Both sides still talk after the refusals
    assert_eq!(proxy.call("add", args![1, 1]).await.unwrap(), Value::Int(2));
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn shutdown_ends_the_loop() {
    let (daemon, task) = start(test_config()).await;
    let uri = daemon.register(Target::instance(Calculator), None).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    proxy.ping().await.unwrap();

    daemon.shutdown().await;
    task.await.unwrap().unwrap();
    assert!(daemon.is_shutdown());
    assert_eq!(daemon.registered(), vec![tether::DAEMON_OBJECT_ID.to_string()]);
    assert!(proxy.call("add", args![1, 1]).await.is_err());
}

#[test_log::test(tokio::test)]
async fn exposed_attributes_read_and_write() {
    let (daemon, _task) = start(test_config()).await;
    let level = Arc::new(AtomicI64::new(21));
    let uri = daemon
        .register(Target::instance(Thermostat { level: level.clone() }), Some("thermo"))
        .unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    assert_eq!(proxy.get_attr("level").await.unwrap(), Value::Int(21));
    proxy.set_attr("level", 25).await.unwrap();
    assert_eq!(level.load(Ordering::SeqCst), 25);
    assert_eq!(proxy.get_attr("version").await.unwrap(), Value::from("2.1"));

    let err = proxy.set_attr("version", "3.0").await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("AttributeError"));
    assert!(err.to_string().contains("read-only"), "got {}", err);

    let err = proxy.set_attr("level", "hot").await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("TypeError"));
    assert_eq!(level.load(Ordering::SeqCst), 25);

    let meta = proxy.metadata().await.unwrap();
    assert!(meta.attrs.contains("level") && meta.attrs.contains("version"));
    assert!(!meta.methods.contains("level"));
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn attribute_table_is_enforced_by_the_daemon() {
    let mut config = test_config();
    config.metadata = false;
    let (daemon, _task) = start(config).await;
    let uri = daemon
        .register(Target::instance(Thermostat { level: Arc::new(AtomicI64::new(0)) }), None)
        .unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    // Methods are not attributes and attributes are not methods
    let err = proxy.get_attr("reset").await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("AttributeError"));
    let err = proxy.call("level", args![]).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("AttributeError"));

    let calc = daemon.register(Target::instance(Calculator), None).unwrap();
    let calc = Proxy::new(calc, daemon.config().clone()).unwrap();
    let err = calc.get_attr("anything").await.unwrap_err();
    assert_eq!(err.remote_kind(), Some("AttributeError"));
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn registered_objects_in_replies_become_proxies() {
    let (daemon, _task) = start(test_config()).await;
    let uri = daemon
        .register(Target::instance(Thermostat { level: Arc::new(AtomicI64::new(0)) }), Some("thermo"))
        .unwrap();
    daemon.register(Target::instance(Calculator), Some("calc")).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    let reference = proxy.call("twin", args!["calc"]).await.unwrap();
    assert_eq!(reference.as_proxy(), Some(daemon.uri_for("calc").unwrap().to_string().as_str()));
    let calc = Proxy::from_value(&reference, daemon.config().clone()).unwrap();
    assert_eq!(calc.call("add", args![1, 2]).await.unwrap(), Value::Int(3));

    // Nested references are rewritten; unknown ids and full URIs pass through
    let elsewhere = "DIRECT:remote@10.0.0.1:9000";
    let refs = proxy
        .call("twins", args![args!["calc", "ghost", elsewhere]])
        .await
        .unwrap();
    let refs = refs.as_list().unwrap();
    assert_eq!(refs[0], reference);
    assert_eq!(refs[1], Value::Proxy("ghost".into()));
    assert_eq!(refs[2], Value::Proxy(elsewhere.into()));
    let err = Proxy::from_value(&refs[1], daemon.config().clone()).unwrap_err();
    assert!(matches!(err, Error::MalformedUri { .. }), "got {:?}", err);
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn autoproxy_can_be_disabled() {
    let (daemon, _task) = start(test_config().with_autoproxy(false)).await;
    let uri = daemon
        .register(Target::instance(Thermostat { level: Arc::new(AtomicI64::new(0)) }), None)
        .unwrap();
    daemon.register(Target::instance(Calculator), Some("calc")).unwrap();
    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();

    assert_eq!(proxy.call("twin", args!["calc"]).await.unwrap(), Value::Proxy("calc".into()));
    daemon.shutdown().await;
}
