//! Host-side fakes shared by the integration suites.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use relay_loop::broker::{Broker, BrokerConfig};
use relay_loop::process::{Handshake, LaunchConfig, PluginConfig};
use relay_loop::reporting::{DataSource, ErrorLog, HostDeps, Observation, ReportingPluginConfig, Telemetry};
use relay_loop::types::{MuxConfig, SupervisorConfig};
use relay_loop::{Error, Result};

/// Answers every round except the ones listed in `failing`.
#[derive(Default)]
pub struct FakeSource {
    pub failing: Vec<u64>,
}

#[async_trait]
impl DataSource for FakeSource {
    async fn observe(&self, round: u64) -> Result<Observation> {
        if self.failing.contains(&round) {
            return Err(Error::unavailable(format!("no data for round {}", round)));
        }
        let observed_at = Utc
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| Error::internal("bad timestamp"))?;
        Ok(Observation {
            round,
            values: BTreeMap::from([("eth-usd".to_string(), 3_000 + round as i64)]),
            observed_at,
        })
    }
}

#[derive(Default)]
pub struct Recorder {
    pub entries: Mutex<Vec<String>>,
}

impl Recorder {
    pub async fn entries(&self) -> Vec<String> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl ErrorLog for Recorder {
    async fn save_error(&self, message: &str) -> Result<()> {
        self.entries.lock().await.push(message.to_string());
        Ok(())
    }
}

#[async_trait]
impl Telemetry for Recorder {
    async fn send(&self, kind: &str, _payload: Bytes) -> Result<()> {
        self.entries.lock().await.push(kind.to_string());
        Ok(())
    }
}

pub struct Host {
    pub deps: HostDeps,
    pub errors: Arc<Recorder>,
    pub telemetry: Arc<Recorder>,
}

pub fn host(failing: Vec<u64>) -> Host {
    let errors = Arc::new(Recorder::default());
    let telemetry = Arc::new(Recorder::default());
    Host {
        deps: HostDeps {
            data_source: Arc::new(FakeSource { failing }),
            error_log: errors.clone(),
            telemetry: telemetry.clone(),
        },
        errors,
        telemetry,
    }
}

pub fn factory_config(name: &str) -> ReportingPluginConfig {
    ReportingPluginConfig {
        name: name.to_string(),
        settings: BTreeMap::new(),
    }
}

pub fn pair() -> (Arc<Broker>, Arc<Broker>) {
    Broker::in_memory_pair(
        BrokerConfig::new("host"),
        BrokerConfig::new("plugin"),
        MuxConfig::default(),
    )
}

/// Supervised `relay-loop-plugin` with a fast keep-alive tick.
pub fn plugin_config(handshake: Handshake) -> PluginConfig {
    let launch = LaunchConfig::new(env!("CARGO_BIN_EXE_relay-loop-plugin"))
        .with_env("RUST_LOG", "relay_loop=debug");
    PluginConfig::new("reporting", handshake, launch).with_supervisor(SupervisorConfig {
        keep_alive_interval: Duration::from_millis(100),
        start_timeout: Duration::from_secs(10),
        close_timeout: Duration::from_secs(5),
    })
}
