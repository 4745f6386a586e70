//! Compose-then-call over an in-memory connection: a host-side factory
//! client talking to the reporting root served on the plugin broker.

mod common;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use relay_loop::broker::{Broker, BrokerConfig, Resource, Server};
use relay_loop::clientconn::{CallTarget, ClientConn, Deps};
use relay_loop::ipc::wire;
use relay_loop::payload::EncodingVersion;
use relay_loop::reporting::{
    ErrorLogServer, HostDeps, ProviderDeps, ReferenceProvider, ReportingPluginConfig,
    ReportingPluginFactory, ReportingPluginFactoryClient, ReportingPluginProvider,
    ReportingPluginServiceClient, ReportingPluginServiceServer, REJECT_SETTING,
};
use relay_loop::service::ServiceLifecycle;
use relay_loop::types::{DialOptions, EncodingConfig, MuxConfig, ServiceHandle};
use relay_loop::Error;

use common::{factory_config, host, pair};

async fn serve_reporting_root(plugin: &Arc<Broker>, returns: EncodingVersion) {
    let mut root = Server::new();
    ReportingPluginServiceServer::new(Arc::downgrade(plugin), Arc::new(ReferenceProvider), returns)
        .register(&mut root)
        .unwrap();
    plugin.serve_root(root).await.unwrap();
}

fn factory_client(
    host_broker: &Arc<Broker>,
    encoding: EncodingConfig,
    config: ReportingPluginConfig,
    deps: HostDeps,
) -> ReportingPluginFactoryClient {
    ReportingPluginServiceClient::new(Arc::new(host_broker.clone()), CancellationToken::new())
        .with_encoding(encoding)
        .new_reporting_plugin_factory(config, deps)
}

#[tokio::test]
async fn test_factory_end_to_end() {
    let (host_broker, plugin) = pair();
    serve_reporting_root(&plugin, EncodingVersion::Cbor).await;
    let fakes = host(vec![]);
    let factory = factory_client(
        &host_broker,
        EncodingConfig::default(),
        factory_config("feeds"),
        fakes.deps.clone(),
    );

    // Nothing is composed until the first call.
    assert!(host_broker.served().await.is_empty());
    assert!(!factory.conn().is_connected().await);

    let observation = factory.observe(7).await.unwrap();
    assert_eq!(observation.round, 7);
    assert_eq!(observation.values["eth-usd"], 3_007);
    assert_eq!(fakes.telemetry.entries().await, vec!["observation"]);

    let served: Vec<String> = host_broker.served().await.into_iter().map(|(_, n)| n).collect();
    assert_eq!(served, vec!["DataSource", "ErrorLog", "Telemetry"]);

    let sum: i64 = factory.query("sum", &vec![1i64, 2, 39]).await.unwrap();
    assert_eq!(sum, 42);

    factory.ready().await.unwrap();
    let health = factory.health_report().await;
    assert_eq!(
        health,
        BTreeMap::from([
            ("ReportingPluginFactory(feeds)".to_string(), None),
            ("ReportingPluginFactoryClient".to_string(), None),
        ])
    );

    factory.close().await.unwrap();
    assert!(host_broker.served().await.is_empty());
    assert_eq!(plugin.served().await, vec![(ServiceHandle::ROOT, "root".to_string())]);
    let err = factory.observe(8).await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
}

#[tokio::test]
async fn test_mixed_encoding_versions() {
    let (host_broker, plugin) = pair();
    serve_reporting_root(&plugin, EncodingVersion::JsonV1).await;
    let fakes = host(vec![]);
    let factory = factory_client(
        &host_broker,
        EncodingConfig {
            params: EncodingVersion::JsonV2,
            returns: EncodingVersion::JsonV1,
        },
        factory_config("mixed"),
        fakes.deps.clone(),
    );

    let echoed: serde_json::Value = factory
        .query("echo", &serde_json::json!({"feed": "eth-usd", "decimals": 8}))
        .await
        .unwrap();
    assert_eq!(echoed["decimals"], 8);
    assert_eq!(factory.observe(1).await.unwrap().round, 1);
    factory.close().await.unwrap();
}

#[tokio::test]
async fn test_data_source_failure_reaches_error_log() {
    let (host_broker, plugin) = pair();
    serve_reporting_root(&plugin, EncodingVersion::Cbor).await;
    let fakes = host(vec![3]);
    let factory = factory_client(
        &host_broker,
        EncodingConfig::default(),
        factory_config("feeds"),
        fakes.deps.clone(),
    );

    let err = factory.observe(3).await.unwrap_err();
    assert_eq!(err.remote_code(), Some("UNAVAILABLE"));
    let logged = fakes.errors.entries().await;
    assert_eq!(logged.len(), 1);
    assert!(logged[0].contains("no data for round 3"));

    // A remote call failure is not a transport failure: the factory stays.
    assert!(factory.conn().is_connected().await);
    let health = factory.health_report().await;
    assert!(health["ReportingPluginFactory(feeds)"].is_some());
    factory.close().await.unwrap();
}

#[tokio::test]
async fn test_provider_failure_rolls_back_everything() {
    let (host_broker, plugin) = pair();
    serve_reporting_root(&plugin, EncodingVersion::Cbor).await;
    let fakes = host(vec![]);
    let mut config = factory_config("rejected");
    config
        .settings
        .insert(REJECT_SETTING.to_string(), "unsupported chain".to_string());
    let factory = factory_client(&host_broker, EncodingConfig::default(), config, fakes.deps.clone());

    let err = factory.observe(1).await.unwrap_err();
    assert_eq!(err.remote_code(), Some("INVALID_ARGUMENT"));
    assert!(err.to_string().contains("unsupported chain"));

    assert!(host_broker.served().await.is_empty());
    assert_eq!(plugin.served().await, vec![(ServiceHandle::ROOT, "root".to_string())]);
    assert!(!factory.conn().is_connected().await);
}

#[derive(Serialize)]
struct RawNewFactory {
    config: ReportingPluginConfig,
    data_source: ServiceHandle,
    error_log: ServiceHandle,
    telemetry: ServiceHandle,
}

#[tokio::test]
async fn test_unknown_dependency_handle_fails_dial() {
    let (host_broker, plugin) = pair();
    serve_reporting_root(&plugin, EncodingVersion::Cbor).await;
    let (data_source, _keep) = host_broker.serve_new("DataSource", |_| Ok(())).await.unwrap();

    let root = host_broker.dial("root", ServiceHandle::ROOT).await.unwrap();
    let body = wire::to_body(&RawNewFactory {
        config: factory_config("broken"),
        data_source,
        error_log: ServiceHandle::new(4_040),
        telemetry: ServiceHandle::new(4_041),
    })
    .unwrap();
    let err = root
        .invoke("ReportingPluginService.NewReportingPluginFactory", body)
        .await
        .unwrap_err();

    assert_eq!(err.remote_code(), Some("UNKNOWN_HANDLE"));
    let message = err.to_string();
    assert!(message.contains("ErrorLog"), "{}", message);
    assert!(message.contains("4040"), "{}", message);
    assert_eq!(plugin.served().await, vec![(ServiceHandle::ROOT, "root".to_string())]);
}

#[tokio::test]
async fn test_failed_dependency_serve_closes_earlier_ones() {
    let (host_broker, _plugin) = pair();
    let conn = ClientConn::new("pair", Arc::new(host_broker.clone()), |deps: Deps| async move {
        deps.serve_new("A", |s| {
            s.register("A", ErrorLogServer::new(Arc::new(common::Recorder::default())))
        })
        .await?;
        deps.serve_new("B", |_| Err(Error::validation("B refuses to start")))
            .await?;
        Ok::<_, Error>(ServiceHandle::new(1))
    });

    let err = conn.connect().await.unwrap_err();
    match &err {
        Error::Serve { name, source } => {
            assert_eq!(name, "B");
            assert!(matches!(**source, Error::Validation(_)));
        }
        other => panic!("expected serve error, got {:?}", other),
    }
    assert!(host_broker.served().await.is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_rollback_close_failure_is_logged_not_returned() {
    let (host_broker, _plugin) = pair();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let conn = ClientConn::new("leaky", Arc::new(host_broker.clone()), move |deps: Deps| {
        let counter = counter.clone();
        async move {
            deps.add(Resource::new("flaky-dep", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::internal("disk gone"))
            }))
            .await;
            deps.serve("ok-dep", Server::new()).await?;
            Err::<ServiceHandle, Error>(Error::validation("remote factory refused"))
        }
    });

    let err = conn.invoke("Any.Method", wire::empty()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(ref m) if m == "remote factory refused"));
    assert!(host_broker.served().await.is_empty());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(logs_contain("rollback close failed"));
    assert!(logs_contain("flaky-dep"));
}

/// Composes `n` dependencies where the `k`-th refuses to start. Returns the
/// error plus which steps were attempted and which were closed, in order.
async fn compose_with_failing_step(n: usize, k: usize) -> (Error, Vec<usize>, Vec<usize>, Arc<Broker>) {
    let (host_broker, _plugin) = pair();
    let attempted = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(Vec::new()));
    let (tried, released) = (attempted.clone(), closed.clone());

    let conn = ClientConn::new("steps", Arc::new(host_broker.clone()), move |deps: Deps| {
        let (tried, released) = (tried.clone(), released.clone());
        async move {
            for step in 1..=n {
                let released = released.clone();
                tried.lock().unwrap().push(step);
                deps.serve_new(&format!("dep-{}", step), |server| {
                    if step == k {
                        return Err(Error::validation(format!("dep-{} refuses to start", step)));
                    }
                    server.attach(Resource::new(format!("dep-{}-state", step), move || async move {
                        released.lock().unwrap().push(step);
                        Ok(())
                    }));
                    Ok(())
                })
                .await?;
            }
            Ok::<_, Error>(ServiceHandle::new(1))
        }
    });

    let err = conn.connect().await.unwrap_err();
    let attempted = attempted.lock().unwrap().clone();
    let closed = closed.lock().unwrap().clone();
    (err, attempted, closed, host_broker)
}

#[tokio::test]
async fn test_rollback_closes_exactly_the_earlier_steps() {
    for n in 1..=4 {
        for k in 1..=n {
            let (err, attempted, closed, host_broker) = compose_with_failing_step(n, k).await;

            match &err {
                Error::Serve { name, source } => {
                    assert_eq!(name, &format!("dep-{}", k), "n={} k={}", n, k);
                    assert!(matches!(**source, Error::Validation(_)));
                }
                other => panic!("n={} k={}: expected serve error, got {:?}", n, k, other),
            }
            assert_eq!(attempted, (1..=k).collect::<Vec<_>>(), "n={} k={}", n, k);
            assert_eq!(closed, (1..k).rev().collect::<Vec<_>>(), "n={} k={}", n, k);
            assert!(host_broker.served().await.is_empty(), "n={} k={}", n, k);
        }
    }
}

#[tokio::test]
async fn test_factory_client_runs_on_spawned_tasks() {
    let (host_broker, plugin) = pair();
    serve_reporting_root(&plugin, EncodingVersion::Cbor).await;
    let fakes = host(vec![]);
    let factory = Arc::new(factory_client(
        &host_broker,
        EncodingConfig::default(),
        factory_config("spawned"),
        fakes.deps.clone(),
    ));

    let worker = factory.clone();
    let observation = tokio::spawn(async move { worker.observe(5).await })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observation.round, 5);

    let closer = factory.clone();
    tokio::spawn(async move {
        assert!(closer.conn().is_connected().await);
        closer.close().await
    })
    .await
    .unwrap()
    .unwrap();
    assert!(host_broker.served().await.is_empty());
}

/// Builds reference factories, slowly.
struct SlowProvider(Duration);

#[async_trait]
impl ReportingPluginProvider for SlowProvider {
    async fn new_reporting_plugin_factory(
        &self,
        config: ReportingPluginConfig,
        deps: ProviderDeps,
    ) -> relay_loop::Result<Arc<dyn ReportingPluginFactory>> {
        tokio::time::sleep(self.0).await;
        ReferenceProvider.new_reporting_plugin_factory(config, deps).await
    }
}

#[tokio::test]
async fn test_factory_finished_after_host_gave_up_is_released() {
    let dial = DialOptions {
        call_timeout: Duration::from_millis(100),
        ..DialOptions::default()
    };
    let (host_broker, plugin) = Broker::in_memory_pair(
        BrokerConfig::new("host").with_dial(dial),
        BrokerConfig::new("plugin"),
        MuxConfig::default(),
    );
    let mut root = Server::new();
    ReportingPluginServiceServer::new(
        Arc::downgrade(&plugin),
        Arc::new(SlowProvider(Duration::from_millis(300))),
        EncodingVersion::Cbor,
    )
    .register(&mut root)
    .unwrap();
    plugin.serve_root(root).await.unwrap();

    let fakes = host(vec![]);
    let factory = factory_client(&host_broker, EncodingConfig::default(), factory_config("late"), fakes.deps.clone());
    let err = factory.observe(1).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
    assert!(host_broker.served().await.is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(plugin.served().await, vec![(ServiceHandle::ROOT, "root".to_string())]);
}
