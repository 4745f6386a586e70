use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::deps::{DataSourceServer, ErrorLogServer, ObserveRequest, TelemetryServer};
use super::{
    DataSource, ErrorLog, NewFactoryReply, NewFactoryRequest, Observation, QueryRequest,
    ReportingPluginConfig, Telemetry, DATA_SOURCE_SERVICE, ERROR_LOG_SERVICE, FACTORY_SERVICE,
    ROOT_SERVICE, TELEMETRY_SERVICE,
};
use crate::clientconn::{BrokerSource, CallTarget, ClientConn, Deps};
use crate::ipc::wire;
use crate::payload::{self, EncodingVersion, VersionedPayload};
use crate::process::PluginClient;
use crate::service::{HealthReport, ServiceClient, ServiceLifecycle};
use crate::types::{DialOptions, EncodingConfig, Result, ServiceHandle, SupervisorConfig};

/// Host implementations served to the plugin for each factory.
#[derive(Clone)]
pub struct HostDeps {
    pub data_source: Arc<dyn DataSource>,
    pub error_log: Arc<dyn ErrorLog>,
    pub telemetry: Arc<dyn Telemetry>,
}

impl fmt::Debug for HostDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDeps").finish_non_exhaustive()
    }
}

/// Host-side client of a reporting plugin's root service.
pub struct ReportingPluginServiceClient {
    source: Arc<dyn BrokerSource>,
    stop: CancellationToken,
    encoding: EncodingConfig,
    close_timeout: Duration,
    call_timeout: Duration,
}

impl fmt::Debug for ReportingPluginServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportingPluginServiceClient")
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl ReportingPluginServiceClient {
    pub fn new(source: Arc<dyn BrokerSource>, stop: CancellationToken) -> Self {
        Self {
            source,
            stop,
            encoding: EncodingConfig::default(),
            close_timeout: SupervisorConfig::default().close_timeout,
            call_timeout: DialOptions::default().call_timeout,
        }
    }

    /// Client over a supervised plugin, using its timeouts and stop signal.
    pub fn from_plugin(plugin: &PluginClient) -> Self {
        let config = plugin.config();
        Self {
            close_timeout: config.supervisor.close_timeout,
            call_timeout: config.dial.call_timeout,
            ..Self::new(Arc::new(plugin.clone()), plugin.stop_token())
        }
    }

    pub fn with_encoding(mut self, encoding: EncodingConfig) -> Self {
        self.encoding = encoding;
        self
    }

    /// Factory backed by the plugin. Nothing crosses the boundary until the
    /// first call; after a plugin relaunch the next call builds it again.
    pub fn new_reporting_plugin_factory(
        &self,
        config: ReportingPluginConfig,
        deps: HostDeps,
    ) -> ReportingPluginFactoryClient {
        let returns = self.encoding.returns;
        let conn = ClientConn::new(FACTORY_SERVICE, self.source.clone(), move |d: Deps| {
            compose_factory(d, config.clone(), deps.clone(), returns)
        })
        .with_call_timeout(self.call_timeout);
        ReportingPluginFactoryClient::new(
            Arc::new(conn),
            self.stop.clone(),
            self.encoding,
            self.close_timeout,
        )
    }
}

async fn compose_factory(
    d: Deps,
    config: ReportingPluginConfig,
    deps: HostDeps,
    returns: EncodingVersion,
) -> Result<ServiceHandle> {
    let data_source = d
        .serve_new(DATA_SOURCE_SERVICE, |s| {
            s.register(
                DATA_SOURCE_SERVICE,
                DataSourceServer::new(deps.data_source.clone(), returns),
            )
        })
        .await?;
    let error_log = d
        .serve_new(ERROR_LOG_SERVICE, |s| {
            s.register(ERROR_LOG_SERVICE, ErrorLogServer::new(deps.error_log.clone()))
        })
        .await?;
    let telemetry = d
        .serve_new(TELEMETRY_SERVICE, |s| {
            s.register(TELEMETRY_SERVICE, TelemetryServer::new(deps.telemetry.clone()))
        })
        .await?;

    let root = d.broker().dial(ROOT_SERVICE, ServiceHandle::ROOT).await?;
    let body = wire::to_body(&NewFactoryRequest {
        config,
        data_source,
        error_log,
        telemetry,
        budget_ms: u64::try_from(root.call_timeout().as_millis()).ok(),
    })?;
    let reply = root
        .invoke("ReportingPluginService.NewReportingPluginFactory", body)
        .await?;
    let reply: NewFactoryReply = wire::from_body(&reply)?;
    Ok(reply.factory)
}

/// Host-side forwarding client of one remote factory.
pub struct ReportingPluginFactoryClient {
    conn: Arc<ClientConn>,
    service: ServiceClient<Arc<ClientConn>>,
    encoding: EncodingConfig,
}

impl fmt::Debug for ReportingPluginFactoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportingPluginFactoryClient")
            .field("conn", &self.conn)
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl ReportingPluginFactoryClient {
    fn new(
        conn: Arc<ClientConn>,
        stop: CancellationToken,
        encoding: EncodingConfig,
        close_timeout: Duration,
    ) -> Self {
        let service = ServiceClient::new(
            "ReportingPluginFactoryClient",
            conn.clone(),
            stop,
            close_timeout,
        );
        Self {
            conn,
            service,
            encoding,
        }
    }

    pub fn conn(&self) -> &Arc<ClientConn> {
        &self.conn
    }

    pub async fn observe(&self, round: u64) -> Result<Observation> {
        let reply = self
            .conn
            .invoke(
                "ReportingPluginFactory.Observe",
                wire::to_body(&ObserveRequest { round })?,
            )
            .await?;
        let payload: VersionedPayload = wire::from_body(&reply)?;
        Ok(payload::decode(&payload)?)
    }

    /// Run the plugin's handler for `item_type`. Parameters are written with
    /// the configured params version, the reply with the returns version.
    pub async fn query<P, R>(&self, item_type: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = wire::to_body(&QueryRequest {
            item_type: item_type.to_string(),
            params: payload::encode(params, self.encoding.params)?,
            returns: self.encoding.returns.tag(),
        })?;
        let reply = self
            .conn
            .invoke("ReportingPluginFactory.Query", body)
            .await?;
        let payload: VersionedPayload = wire::from_body(&reply)?;
        Ok(payload::decode(&payload)?)
    }
}

#[async_trait]
impl ServiceLifecycle for ReportingPluginFactoryClient {
    fn name(&self) -> String {
        self.service.name()
    }

    async fn start(&self) -> Result<()> {
        self.service.start().await
    }

    /// Closes the remote factory (if one was ever built) and then every
    /// dependency served for it.
    async fn close(&self) -> Result<()> {
        let remote = if self.conn.is_connected().await {
            self.service.close().await
        } else {
            Ok(())
        };
        let local = self.conn.close().await;
        remote.and(local)
    }

    async fn ready(&self) -> Result<()> {
        self.service.ready().await
    }

    async fn health_report(&self) -> HealthReport {
        self.service.health_report().await
    }
}
