use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::deps::{DataSourceClient, ErrorLogClient, ObserveRequest, TelemetryClient};
use super::{
    NewFactoryReply, NewFactoryRequest, ProviderDeps, QueryRequest, ReportingPluginFactory,
    ReportingPluginProvider, DATA_SOURCE_SERVICE, ERROR_LOG_SERVICE, FACTORY_SERVICE,
    ROOT_SERVICE, TELEMETRY_SERVICE,
};
use crate::broker::{Broker, Resource, ResourceSet, Server, Service};
use crate::ipc::wire;
use crate::payload::{self, EncodingVersion};
use crate::service::{HealthReport, LifecycleServer, ServiceLifecycle};
use crate::types::{Error, Result, ServiceHandle};

/// Root service of a reporting plugin.
pub struct ReportingPluginServiceServer {
    broker: Weak<Broker>,
    provider: Arc<dyn ReportingPluginProvider>,
    returns: EncodingVersion,
}

impl fmt::Debug for ReportingPluginServiceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportingPluginServiceServer")
            .field("broker_alive", &(self.broker.strong_count() > 0))
            .field("returns", &self.returns)
            .finish()
    }
}

impl ReportingPluginServiceServer {
    pub fn new(
        broker: Weak<Broker>,
        provider: Arc<dyn ReportingPluginProvider>,
        returns: EncodingVersion,
    ) -> Self {
        Self {
            broker,
            provider,
            returns,
        }
    }

    pub fn register(self, server: &mut Server) -> Result<()> {
        server.register(ROOT_SERVICE, self)
    }

    async fn new_factory(&self, req: NewFactoryRequest) -> Result<ServiceHandle> {
        let deadline = req
            .budget_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| Error::unavailable("plugin broker is gone"))?;

        let (conns, opened) = broker
            .dial_all(&[
                (DATA_SOURCE_SERVICE, req.data_source),
                (ERROR_LOG_SERVICE, req.error_log),
                (TELEMETRY_SERVICE, req.telemetry),
            ])
            .await?;
        let [data_source, error_log, telemetry]: [_; 3] = match conns.try_into() {
            Ok(conns) => conns,
            Err(_) => {
                broker.close_all(opened).await;
                return Err(Error::internal("dependency count mismatch"));
            }
        };
        let deps = ProviderDeps {
            data_source: Arc::new(DataSourceClient::new(data_source)),
            error_log: Arc::new(ErrorLogClient::new(error_log)),
            telemetry: Arc::new(TelemetryClient::new(telemetry)),
        };

        let name = req.config.name.clone();
        let factory = match self.provider.new_reporting_plugin_factory(req.config, deps).await {
            Ok(factory) => factory,
            Err(e) => {
                broker.close_all(opened).await;
                return Err(e);
            }
        };

        // Nobody would learn the handle: release instead of serving.
        if let Some(e) = undeliverable(&broker, deadline) {
            tracing::warn!(factory = %name, "factory ready too late, releasing: {}", e);
            close_unserved(&name, factory.as_ref()).await;
            broker.close_all(opened).await;
            return Err(e);
        }

        match self.serve_factory(&broker, factory.clone(), opened).await {
            Ok(handle) => {
                tracing::info!(factory = %name, %handle, "reporting plugin factory created");
                Ok(handle)
            }
            Err(e) => {
                close_unserved(&name, factory.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn serve_factory(
        &self,
        broker: &Broker,
        factory: Arc<dyn ReportingPluginFactory>,
        deps: ResourceSet,
    ) -> Result<ServiceHandle> {
        let release = Arc::new(Mutex::new(None));
        let lifecycle = Arc::new(ServedFactory {
            factory: factory.clone(),
            release: release.clone(),
        });

        let mut server = Server::new();
        LifecycleServer::register(lifecycle, &mut server)?;
        server.register(
            FACTORY_SERVICE,
            ReportingPluginFactoryServer::new(factory, self.returns),
        )?;
        server.attach_set(deps);

        let (handle, resource) = broker.serve(FACTORY_SERVICE, server).await?;
        *release.lock().await = Some(resource);
        Ok(handle)
    }
}

fn undeliverable(broker: &Broker, deadline: Option<Instant>) -> Option<Error> {
    if broker.is_closed() {
        return Some(Error::connection_closed("plugin connection closed"));
    }
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            Some(Error::timeout("host stopped waiting for the factory"))
        }
        _ => None,
    }
}

async fn close_unserved(name: &str, factory: &dyn ReportingPluginFactory) {
    if let Err(e) = factory.close().await {
        tracing::warn!(factory = %name, "closing unserved factory failed: {}", e);
    }
}

#[async_trait]
impl Service for ReportingPluginServiceServer {
    async fn call(&self, method: &str, body: Bytes) -> Result<Bytes> {
        match method {
            "NewReportingPluginFactory" => {
                let req: NewFactoryRequest = wire::from_body(&body)?;
                let factory = self.new_factory(req).await?;
                wire::to_body(&NewFactoryReply { factory })
            }
            other => Err(Error::not_found(format!("{}.{}", ROOT_SERVICE, other))),
        }
    }
}

/// Lifecycle of a served factory. Closing it also withdraws its handle and
/// releases the dialed dependencies.
struct ServedFactory {
    factory: Arc<dyn ReportingPluginFactory>,
    release: Arc<Mutex<Option<Resource>>>,
}

#[async_trait]
impl ServiceLifecycle for ServedFactory {
    fn name(&self) -> String {
        self.factory.name()
    }

    async fn start(&self) -> Result<()> {
        self.factory.start().await
    }

    async fn close(&self) -> Result<()> {
        let closed = self.factory.close().await;
        let release = self.release.lock().await.take();
        if let Some(resource) = release {
            resource.close().await?;
        }
        closed
    }

    async fn ready(&self) -> Result<()> {
        self.factory.ready().await
    }

    async fn health_report(&self) -> HealthReport {
        self.factory.health_report().await
    }
}

/// Serves `Observe` and `Query` of one factory.
pub struct ReportingPluginFactoryServer {
    factory: Arc<dyn ReportingPluginFactory>,
    returns: EncodingVersion,
}

impl fmt::Debug for ReportingPluginFactoryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportingPluginFactoryServer")
            .field("factory", &self.factory.name())
            .field("returns", &self.returns)
            .finish()
    }
}

impl ReportingPluginFactoryServer {
    pub fn new(factory: Arc<dyn ReportingPluginFactory>, returns: EncodingVersion) -> Self {
        Self { factory, returns }
    }
}

#[async_trait]
impl Service for ReportingPluginFactoryServer {
    async fn call(&self, method: &str, body: Bytes) -> Result<Bytes> {
        match method {
            "Observe" => {
                let req: ObserveRequest = wire::from_body(&body)?;
                let observation = self.factory.observe(req.round).await?;
                wire::to_body(&payload::encode(&observation, self.returns)?)
            }
            "Query" => {
                let req: QueryRequest = wire::from_body(&body)?;
                let returns = EncodingVersion::try_from(req.returns)?;
                let reply = self
                    .factory
                    .queries()
                    .dispatch(&req.item_type, req.params, returns)
                    .await?;
                wire::to_body(&reply)
            }
            other => Err(Error::not_found(format!("{}.{}", FACTORY_SERVICE, other))),
        }
    }
}
