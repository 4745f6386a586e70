use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use super::{health_to_wire, ServiceLifecycle, LIFECYCLE_SERVICE};
use crate::broker::{Server, Service};
use crate::ipc::wire;
use crate::types::{Error, Result};

/// Serves the lifecycle methods of a local implementation.
#[derive(Clone)]
pub struct LifecycleServer {
    inner: Arc<dyn ServiceLifecycle>,
}

impl std::fmt::Debug for LifecycleServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleServer")
            .field("name", &self.inner.name())
            .finish()
    }
}

impl LifecycleServer {
    pub fn new(inner: Arc<dyn ServiceLifecycle>) -> Self {
        Self { inner }
    }

    /// Register under [`LIFECYCLE_SERVICE`] on `server`.
    pub fn register(inner: Arc<dyn ServiceLifecycle>, server: &mut Server) -> Result<()> {
        server.register(LIFECYCLE_SERVICE, Self::new(inner))
    }
}

#[async_trait]
impl Service for LifecycleServer {
    async fn call(&self, method: &str, _body: Bytes) -> Result<Bytes> {
        match method {
            "Name" => wire::to_body(&self.inner.name()),
            "Start" => {
                self.inner.start().await?;
                Ok(wire::empty())
            }
            "Close" => {
                self.inner.close().await?;
                Ok(wire::empty())
            }
            "Ready" => {
                self.inner.ready().await?;
                Ok(wire::empty())
            }
            "HealthReport" => {
                let report = self.inner.health_report().await;
                wire::to_body(&health_to_wire(&report))
            }
            other => Err(Error::not_found(format!(
                "{}.{} is not a lifecycle method",
                LIFECYCLE_SERVICE, other
            ))),
        }
    }
}
