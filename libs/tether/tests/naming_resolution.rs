//! Name server and the three indirect URI schemes

mod common;

use common::{start, test_config, Calculator};
use std::collections::BTreeSet;
use std::sync::Arc;
use tether::{
    args, locate_ns, start_ns_on, Endpoint, Error, MemoryStorage, NameServerClient, NameServerHandle,
    ProtocolConfig, Proxy, Resolver, Target, Uri, Value,
};

async fn name_server() -> (NameServerHandle, ProtocolConfig) {
    let handle = start_ns_on(
        test_config(),
        Endpoint::tcp("127.0.0.1", 0),
        Arc::new(MemoryStorage::new()),
    )
    .await
    .unwrap();
    let port = match handle.location() {
        Endpoint::Tcp { port, .. } => *port,
        other => panic!("expected a tcp location, got {}", other),
    };
    let config = test_config().with_name_server("127.0.0.1", port);
    (handle, config)
}

fn tags(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test_log::test(tokio::test)]
async fn name_uri_resolves_through_the_name_server() {
    let (ns, config) = name_server().await;
    let (daemon, _task) = start(config.clone()).await;
    let direct = daemon.register(Target::instance(Calculator), None).unwrap();

    let client = locate_ns(Arc::new(config.clone()), None).await.unwrap();
    client.register("example.calculator", &direct, false).await.unwrap();
    assert_eq!(client.lookup("example.calculator").await.unwrap(), direct);

    let proxy = Proxy::new(Uri::name("example.calculator", None), config.clone()).unwrap();
    assert_eq!(proxy.call("add", args![5, 6]).await.unwrap(), Value::Int(11));
    assert_eq!(proxy.resolved_uri().await, Some(direct));

    let missing = Proxy::new(Uri::name("example.missing", None), config).unwrap();
    let err = missing.call("add", args![1, 1]).await.unwrap_err();
    assert!(matches!(err, Error::Naming { .. }), "got {:?}", err);

    client.release().await;
    daemon.shutdown().await;
    ns.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn name_server_registry_operations() {
    let (ns, config) = name_server().await;
    let client = NameServerClient::new(ns.location().clone(), Arc::new(config)).unwrap();
    let target = Uri::direct("obj_1", Endpoint::tcp("127.0.0.1", 4000));

    client.register("app.one", &target, false).await.unwrap();
    client.register("app.two", &target, false).await.unwrap();
    client.register("other.three", &target, false).await.unwrap();
    assert_eq!(client.count().await.unwrap(), 4);

    // Safe registration refuses to overwrite
    let err = client.register("app.one", &target, true).await.unwrap_err();
    assert!(matches!(err, Error::Naming { .. }), "got {:?}", err);

    let listed = client.list(Some("app.")).await.unwrap();
    assert_eq!(listed.keys().cloned().collect::<Vec<_>>(), vec!["app.one", "app.two"]);

    let indirect = Uri::name("app.one", None);
    assert!(client.register("app.bad", &indirect, false).await.is_err());

    assert_eq!(client.remove_prefix("app.").await.unwrap(), 2);
    assert!(client.remove("other.three").await.unwrap());
    assert!(!client.remove("other.three").await.unwrap());
    assert!(!client.remove(tether::NAMESERVER_NAME).await.unwrap());
    assert_eq!(client.count().await.unwrap(), 1);

    client.release().await;
    ns.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn metadata_uri_picks_the_lowest_matching_name() {
    let (ns, config) = name_server().await;
    let (daemon, _task) = start(config.clone()).await;
    let first = daemon.register(Target::instance(Calculator), Some("first")).unwrap();
    let second = daemon.register(Target::instance(Calculator), Some("second")).unwrap();

    let client = NameServerClient::new(ns.location().clone(), Arc::new(config.clone())).unwrap();
    client
        .register_with_metadata("b.calc", &first, &tags(&["math", "fast"]), false)
        .await
        .unwrap();
    client
        .register_with_metadata("a.calc", &second, &tags(&["math"]), false)
        .await
        .unwrap();

    let by_any = client.list_by_metadata(&tags(&["fast", "slow"]), true).await.unwrap();
    assert_eq!(by_any.len(), 1);

    let resolver = Resolver::new(Arc::new(config.clone()));
    let math = resolver.resolve(&Uri::metadata(["math"], None)).await.unwrap();
    assert_eq!(math, second);
    let fast = resolver.resolve(&Uri::metadata(["math", "fast"], None)).await.unwrap();
    assert_eq!(fast, first);

    let err = resolver
        .resolve(&Uri::metadata(["quantum"], None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Naming { .. }), "got {:?}", err);

    client.set_metadata("a.calc", &tags(&["math", "fast"])).await.unwrap();
    let fast = resolver.resolve(&Uri::metadata(["fast"], None)).await.unwrap();
    assert_eq!(fast, second);

    let proxy = Proxy::new(Uri::metadata(["math"], None), config).unwrap();
    assert_eq!(proxy.call("add", args![1, 2]).await.unwrap(), Value::Int(3));

    client.release().await;
    daemon.shutdown().await;
    ns.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn location_uri_asks_the_daemon() {
    let (daemon, _task) = start(test_config()).await;
    let direct = daemon.register(Target::instance(Calculator), Some("obj_calc")).unwrap();
    daemon.alias("calculator", "obj_calc").unwrap();

    let uri = Uri::local("calculator", daemon.location().clone());
    let resolver = Resolver::new(daemon.config().clone());
    assert_eq!(resolver.resolve(&uri).await.unwrap(), direct);

    let proxy = Proxy::new(uri, daemon.config().clone()).unwrap();
    assert_eq!(proxy.call("add", args![2, 2]).await.unwrap(), Value::Int(4));

    let unknown = Uri::local("nothing", daemon.location().clone());
    let err = resolver.resolve(&unknown).await.unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }), "got {:?}", err);
    daemon.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn direct_uris_resolve_to_themselves() {
    let resolver = Resolver::new(Arc::new(test_config()));
    let uri = Uri::parse("DIRECT:obj_1@localhost:9999").unwrap();
    assert_eq!(resolver.resolve(&uri).await.unwrap(), uri);
}

#[test_log::test(tokio::test)]
async fn locating_an_absent_name_server_fails() {
    let config = test_config().with_name_server("127.0.0.1", 1);
    let err = locate_ns(Arc::new(config), None).await.unwrap_err();
    assert!(matches!(err, Error::Naming { .. }), "got {:?}", err);
}
