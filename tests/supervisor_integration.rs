//! Supervisor tests against the crate's own `relay-loop-plugin` binary.

mod common;

use pretty_assertions::assert_eq;
use std::time::Duration;

use relay_loop::clientconn::BrokerSource;
use relay_loop::process::{env::ENV_CALL_LIMIT, Handshake, PluginClient, PluginState};
use relay_loop::reporting::{ReportingPluginFactoryClient, ReportingPluginServiceClient};
use relay_loop::service::ServiceLifecycle;
use relay_loop::Error;

use common::{factory_config, host, plugin_config, Host};

const WAIT: Duration = Duration::from_secs(15);

fn factory(client: &PluginClient, fakes: &Host) -> ReportingPluginFactoryClient {
    ReportingPluginServiceClient::from_plugin(client)
        .new_reporting_plugin_factory(factory_config("feeds"), fakes.deps.clone())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_factory_created_right_after_launch() {
    for _ in 0..3 {
        let client = PluginClient::new(plugin_config(Handshake::REPORTING));
        client.start().await.unwrap();

        let fakes = host(vec![]);
        let factory = factory(&client, &fakes);
        assert_eq!(factory.observe(1).await.unwrap().round, 1);

        factory.close().await.unwrap();
        client.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kill_then_keep_alive_relaunches() {
    let client = PluginClient::new(plugin_config(Handshake::REPORTING));
    client.start().await.unwrap();
    assert_eq!(client.state(), PluginState::Connected);
    assert_eq!(client.generation(), 1);

    let fakes = host(vec![]);
    let factory = factory(&client, &fakes);
    let before = factory.observe(11).await.unwrap();
    let health_before = factory.health_report().await;

    client.kill().await.unwrap();
    client.wait_for_state(PluginState::Connected, WAIT).await.unwrap();
    assert_eq!(client.generation(), 2);

    // Same probe, new process: the factory recomposes transparently.
    let after = factory.observe(11).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(factory.health_report().await, health_before);

    factory.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(client.state(), PluginState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_relaunches_before_returning() {
    let client = PluginClient::new(plugin_config(Handshake::REPORTING));
    client.start().await.unwrap();

    let fakes = host(vec![]);
    let factory = factory(&client, &fakes);
    let before: i64 = factory.query("sum", &vec![20i64, 22]).await.unwrap();

    client.reset().await.unwrap();
    assert_eq!(client.state(), PluginState::Connected);
    assert_eq!(client.generation(), 2);

    let after: i64 = factory.query("sum", &vec![20i64, 22]).await.unwrap();
    assert_eq!(before, after);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_handshake_is_fatal() {
    let client = PluginClient::new(plugin_config(Handshake::MEDIAN));
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, Error::Handshake(_)), "{:?}", err);
    assert_eq!(client.state(), PluginState::Closed);

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
    assert!(matches!(client.broker().await, Err(Error::Closed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_limit_exit_is_recovered() {
    let mut config = plugin_config(Handshake::REPORTING);
    config.launch = config.launch.with_env(ENV_CALL_LIMIT, "20");
    let client = PluginClient::new(config);
    client.start().await.unwrap();

    let fakes = host(vec![]);
    let factory = factory(&client, &fakes);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let mut succeeded_after_relaunch = false;
    let mut round = 0;
    while tokio::time::Instant::now() < deadline {
        round += 1;
        match factory.observe(round).await {
            Ok(observation) => {
                assert_eq!(observation.round, round);
                if client.generation() >= 2 {
                    succeeded_after_relaunch = true;
                    break;
                }
            }
            // The connection can drop at any point of a composition.
            Err(e) => assert!(!matches!(e, Error::Closed(_)), "{:?}", e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(succeeded_after_relaunch, "generation {}", client.generation());
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_is_terminal() {
    let client = PluginClient::new(plugin_config(Handshake::REPORTING));
    client.start().await.unwrap();
    ServiceLifecycle::ready(&client).await.unwrap();

    let fakes = host(vec![]);
    let factory = factory(&client, &fakes);
    factory.observe(1).await.unwrap();

    client.close().await.unwrap();
    assert_eq!(client.state(), PluginState::Closed);
    assert!(matches!(client.broker().await, Err(Error::Closed(_))));
    assert!(factory.observe(2).await.is_err());
    assert!(matches!(client.reset().await, Err(Error::Closed(_))));

    let health = ServiceLifecycle::health_report(&client).await;
    assert!(health["reporting"].is_some());
}
