use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{copy_health, health_from_wire, HealthReport, ServiceLifecycle};
use crate::clientconn::CallTarget;
use crate::ipc::wire;
use crate::types::{Error, Result};

/// Fixed timeout layered on `ready` and `health_report`.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle client for a remote service.
///
/// `start` is a no-op: remote services start themselves. `close`, `ready` and
/// `health_report` return promptly once the stop signal fires.
pub struct ServiceClient<T> {
    name: String,
    target: T,
    stop: CancellationToken,
    close_timeout: Duration,
}

impl<T> fmt::Debug for ServiceClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("name", &self.name)
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}

impl<T: CallTarget> ServiceClient<T> {
    pub fn new(name: impl Into<String>, target: T, stop: CancellationToken, close_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            target,
            stop,
            close_timeout,
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Name reported by the remote implementation.
    pub async fn remote_name(&self) -> Result<String> {
        let body = self.probe("Service.Name").await?;
        wire::from_body(&body)
    }

    async fn probe(&self, method: &str) -> Result<Bytes> {
        self.until_stopped(self.target.invoke_within(method, wire::empty(), PROBE_TIMEOUT))
            .await
    }

    async fn until_stopped<F>(&self, call: F) -> Result<Bytes>
    where
        F: Future<Output = Result<Bytes>> + Send,
    {
        tokio::select! {
            result = call => result,
            _ = self.stop.cancelled() => Err(Error::cancelled(format!("{}: stop signal", self.name))),
        }
    }
}

#[async_trait]
impl<T: CallTarget> ServiceLifecycle for ServiceClient<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let call = self
            .target
            .invoke_within("Service.Close", wire::empty(), self.close_timeout);
        self.until_stopped(call).await.map(|_| ())
    }

    async fn ready(&self) -> Result<()> {
        self.probe("Service.Ready").await.map(|_| ())
    }

    async fn health_report(&self) -> HealthReport {
        let remote = self
            .probe("Service.HealthReport")
            .await
            .and_then(|body| wire::from_body::<BTreeMap<String, String>>(&body));
        match remote {
            Ok(remote) => {
                // A remote entry under our own name keeps its status.
                let mut report = health_from_wire(remote);
                copy_health(&mut report, HealthReport::from([(self.name.clone(), None)]));
                report
            }
            Err(e) => HealthReport::from([(self.name.clone(), Some(e.to_string()))]),
        }
    }
}
