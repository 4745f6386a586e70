//! Generic reporting-plugin family.
//!
//! The host asks the plugin's root `ReportingPluginService` for a new
//! factory, handing over three dependencies it serves itself: a
//! [`DataSource`], an [`ErrorLog`] and a [`Telemetry`] sink. The plugin dials
//! them, builds the factory through its [`ReportingPluginProvider`] and serves
//! it under a fresh handle. On the host that handle is wrapped in a
//! [`ReportingPluginFactoryClient`] built on a compose-then-call
//! [`crate::clientconn::ClientConn`].
//!
//! Wire surface:
//! - `ReportingPluginService.NewReportingPluginFactory(config, handles) -> factory handle`
//! - `ReportingPluginFactory.Observe(round) -> VersionedPayload<Observation>`
//! - `ReportingPluginFactory.Query(item_type, params, returns) -> VersionedPayload`
//! - the lifecycle methods under `Service`

mod client;
mod deps;
mod reference;
mod server;

pub use client::{HostDeps, ReportingPluginFactoryClient, ReportingPluginServiceClient};
pub use deps::{
    DataSource, DataSourceClient, DataSourceServer, ErrorLog, ErrorLogClient, ErrorLogServer,
    Telemetry, TelemetryClient, TelemetryServer,
};
pub use reference::{ReferenceProvider, REJECT_SETTING};
pub use server::{ReportingPluginFactoryServer, ReportingPluginServiceServer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::payload::registry::HandlerRegistry;
use crate::payload::VersionedPayload;
use crate::service::ServiceLifecycle;
use crate::types::{Result, ServiceHandle};

pub const ROOT_SERVICE: &str = "ReportingPluginService";
pub const FACTORY_SERVICE: &str = "ReportingPluginFactory";
pub const DATA_SOURCE_SERVICE: &str = "DataSource";
pub const ERROR_LOG_SERVICE: &str = "ErrorLog";
pub const TELEMETRY_SERVICE: &str = "Telemetry";

/// Settings for one factory instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingPluginConfig {
    pub name: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// One round's observed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub round: u64,
    pub values: BTreeMap<String, i64>,
    pub observed_at: DateTime<Utc>,
}

/// Dependencies handed to a provider, already dialed.
#[derive(Clone)]
pub struct ProviderDeps {
    pub data_source: Arc<dyn DataSource>,
    pub error_log: Arc<dyn ErrorLog>,
    pub telemetry: Arc<dyn Telemetry>,
}

impl std::fmt::Debug for ProviderDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDeps").finish_non_exhaustive()
    }
}

/// A constructed reporting-plugin factory (plugin side).
#[async_trait]
pub trait ReportingPluginFactory: ServiceLifecycle {
    async fn observe(&self, round: u64) -> Result<Observation>;

    /// Generic queries, keyed by item type.
    fn queries(&self) -> &HandlerRegistry;
}

/// Builds factories inside the plugin process.
#[async_trait]
pub trait ReportingPluginProvider: Send + Sync {
    async fn new_reporting_plugin_factory(
        &self,
        config: ReportingPluginConfig,
        deps: ProviderDeps,
    ) -> Result<Arc<dyn ReportingPluginFactory>>;
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct NewFactoryRequest {
    pub config: ReportingPluginConfig,
    pub data_source: ServiceHandle,
    pub error_log: ServiceHandle,
    pub telemetry: ServiceHandle,
    /// How long the host waits for the reply, in milliseconds.
    #[serde(default)]
    pub budget_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct NewFactoryReply {
    pub factory: ServiceHandle,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct QueryRequest {
    pub item_type: String,
    pub params: VersionedPayload,
    /// Version tag the reply must be encoded with.
    pub returns: u32,
}
