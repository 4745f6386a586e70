//! Built-in reporting provider served by the `relay-loop-plugin` binary.
//!
//! Each observation is fetched from the host's data source and forwarded to
//! telemetry. Data-source failures are written to the host's error log and
//! surface in the factory's health report until the next good round.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Observation, ProviderDeps, ReportingPluginConfig, ReportingPluginFactory, ReportingPluginProvider};
use crate::payload::registry::HandlerRegistry;
use crate::payload::{self, EncodingVersion};
use crate::service::{HealthReport, ServiceLifecycle};
use crate::types::{Error, Result};

/// Setting that makes factory construction fail. Used to exercise rollback.
pub const REJECT_SETTING: &str = "reject";

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceProvider;

#[async_trait]
impl ReportingPluginProvider for ReferenceProvider {
    async fn new_reporting_plugin_factory(
        &self,
        config: ReportingPluginConfig,
        deps: ProviderDeps,
    ) -> Result<Arc<dyn ReportingPluginFactory>> {
        if config.name.is_empty() {
            return Err(Error::validation("factory name is required"));
        }
        if let Some(reason) = config.settings.get(REJECT_SETTING) {
            return Err(Error::validation(format!("factory rejected: {}", reason)));
        }
        Ok(Arc::new(ReferenceFactory::new(config, deps)?))
    }
}

struct ReferenceFactory {
    name: String,
    deps: ProviderDeps,
    queries: HandlerRegistry,
    rounds: AtomicU64,
    last_error: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl ReferenceFactory {
    fn new(config: ReportingPluginConfig, deps: ProviderDeps) -> Result<Self> {
        let mut queries = HandlerRegistry::new();
        queries.register("sum", |values: Vec<i64>| async move {
            Ok::<_, Error>(values.iter().sum::<i64>())
        })?;
        queries.register("echo", |value: serde_json::Value| async move { Ok::<_, Error>(value) })?;
        let settings = Arc::new(config.settings);
        queries.register("setting", move |key: String| {
            let settings = settings.clone();
            async move { Ok::<_, Error>(settings.get(&key).cloned()) }
        })?;

        Ok(Self {
            name: format!("ReportingPluginFactory({})", config.name),
            deps,
            queries,
            rounds: AtomicU64::new(0),
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceLifecycle for ReferenceFactory {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(factory = %self.name, rounds = self.rounds.load(Ordering::SeqCst), "factory closed");
        }
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn health_report(&self) -> HealthReport {
        let status = if self.closed.load(Ordering::SeqCst) {
            Some("closed".to_string())
        } else {
            self.last_error.lock().await.clone()
        };
        BTreeMap::from([(self.name.clone(), status)])
    }
}

#[async_trait]
impl ReportingPluginFactory for ReferenceFactory {
    async fn observe(&self, round: u64) -> Result<Observation> {
        self.ensure_open()?;

        let observation = match self.deps.data_source.observe(round).await {
            Ok(observation) => observation,
            Err(e) => {
                let message = format!("round {}: {}", round, e);
                if let Err(log_err) = self.deps.error_log.save_error(&message).await {
                    tracing::warn!(factory = %self.name, "saving error failed: {}", log_err);
                }
                *self.last_error.lock().await = Some(message);
                return Err(e);
            }
        };

        let encoded = payload::encode(&observation, EncodingVersion::Cbor)?;
        self.deps.telemetry.send("observation", encoded.data).await?;
        self.rounds.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().await = None;
        Ok(observation)
    }

    fn queries(&self) -> &HandlerRegistry {
        &self.queries
    }
}
