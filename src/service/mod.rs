//! Generic lifecycle contract every cross-process service satisfies.
//!
//! Wire surface (service name `Service`):
//! - `Service.Name() -> string`
//! - `Service.Start() -> ()`
//! - `Service.Close() -> ()`
//! - `Service.Ready() -> ()`
//! - `Service.HealthReport() -> map<string,string>` (empty string = healthy)

mod client;
mod server;

pub use client::{ServiceClient, PROBE_TIMEOUT};
pub use server::LifecycleServer;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::Result;

/// Service name the lifecycle methods are registered under.
pub const LIFECYCLE_SERVICE: &str = "Service";

/// Component name → `None` when healthy, `Some(error)` otherwise.
pub type HealthReport = BTreeMap<String, Option<String>>;

#[async_trait]
pub trait ServiceLifecycle: Send + Sync {
    fn name(&self) -> String;

    async fn start(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn ready(&self) -> Result<()>;

    async fn health_report(&self) -> HealthReport;
}

#[async_trait]
impl<T: ServiceLifecycle + ?Sized> ServiceLifecycle for Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    async fn start(&self) -> Result<()> {
        (**self).start().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    async fn ready(&self) -> Result<()> {
        (**self).ready().await
    }

    async fn health_report(&self) -> HealthReport {
        (**self).health_report().await
    }
}

/// Merge `src` into `dst`. Entries already in `dst` win.
pub fn copy_health(dst: &mut HealthReport, src: HealthReport) {
    for (name, status) in src {
        dst.entry(name).or_insert(status);
    }
}

/// Wire form of a health report.
pub fn health_to_wire(report: &HealthReport) -> BTreeMap<String, String> {
    report
        .iter()
        .map(|(name, status)| (name.clone(), status.clone().unwrap_or_default()))
        .collect()
}

pub fn health_from_wire(wire: BTreeMap<String, String>) -> HealthReport {
    wire.into_iter()
        .map(|(name, status)| {
            let status = if status.is_empty() { None } else { Some(status) };
            (name, status)
        })
        .collect()
}
