//! Host-provided dependencies of a reporting plugin factory.
//!
//! Each dependency is a trait with a server (runs where the implementation
//! lives, normally the host) and a forwarding client (runs in the plugin and
//! implements the same trait over a dialed [`Conn`]).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::{Observation, DATA_SOURCE_SERVICE, ERROR_LOG_SERVICE, TELEMETRY_SERVICE};
use crate::broker::{Conn, Service};
use crate::clientconn::CallTarget;
use crate::ipc::wire;
use crate::payload::{self, EncodingVersion, VersionedPayload};
use crate::types::{Error, Result};

/// Source of per-round observations.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn observe(&self, round: u64) -> Result<Observation>;
}

/// Durable error sink.
#[async_trait]
pub trait ErrorLog: Send + Sync {
    async fn save_error(&self, message: &str) -> Result<()>;
}

/// Telemetry sink.
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn send(&self, kind: &str, payload: Bytes) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ObserveRequest {
    pub round: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SaveErrorRequest {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SendRequest {
    kind: String,
    payload: Bytes,
}

fn unknown(service: &str, method: &str) -> Error {
    Error::not_found(format!("{}.{}", service, method))
}

pub struct DataSourceServer {
    inner: Arc<dyn DataSource>,
    returns: EncodingVersion,
}

impl fmt::Debug for DataSourceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceServer")
            .field("returns", &self.returns)
            .finish()
    }
}

impl DataSourceServer {
    /// Observations are returned encoded with `returns`.
    pub fn new(inner: Arc<dyn DataSource>, returns: EncodingVersion) -> Self {
        Self { inner, returns }
    }
}

#[async_trait]
impl Service for DataSourceServer {
    async fn call(&self, method: &str, body: Bytes) -> Result<Bytes> {
        match method {
            "Observe" => {
                let req: ObserveRequest = wire::from_body(&body)?;
                let observation = self.inner.observe(req.round).await?;
                wire::to_body(&payload::encode(&observation, self.returns)?)
            }
            other => Err(unknown(DATA_SOURCE_SERVICE, other)),
        }
    }
}

#[derive(Debug)]
pub struct DataSourceClient {
    conn: Conn,
}

impl DataSourceClient {
    pub fn new(conn: Conn) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DataSource for DataSourceClient {
    async fn observe(&self, round: u64) -> Result<Observation> {
        let reply = self
            .conn
            .invoke("DataSource.Observe", wire::to_body(&ObserveRequest { round })?)
            .await?;
        let payload: VersionedPayload = wire::from_body(&reply)?;
        Ok(payload::decode(&payload)?)
    }
}

pub struct ErrorLogServer {
    inner: Arc<dyn ErrorLog>,
}

impl fmt::Debug for ErrorLogServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorLogServer")
    }
}

impl ErrorLogServer {
    pub fn new(inner: Arc<dyn ErrorLog>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Service for ErrorLogServer {
    async fn call(&self, method: &str, body: Bytes) -> Result<Bytes> {
        match method {
            "SaveError" => {
                let req: SaveErrorRequest = wire::from_body(&body)?;
                self.inner.save_error(&req.message).await?;
                Ok(wire::empty())
            }
            other => Err(unknown(ERROR_LOG_SERVICE, other)),
        }
    }
}

#[derive(Debug)]
pub struct ErrorLogClient {
    conn: Conn,
}

impl ErrorLogClient {
    pub fn new(conn: Conn) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ErrorLog for ErrorLogClient {
    async fn save_error(&self, message: &str) -> Result<()> {
        let body = wire::to_body(&SaveErrorRequest {
            message: message.to_string(),
        })?;
        self.conn.invoke("ErrorLog.SaveError", body).await?;
        Ok(())
    }
}

pub struct TelemetryServer {
    inner: Arc<dyn Telemetry>,
}

impl fmt::Debug for TelemetryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TelemetryServer")
    }
}

impl TelemetryServer {
    pub fn new(inner: Arc<dyn Telemetry>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Service for TelemetryServer {
    async fn call(&self, method: &str, body: Bytes) -> Result<Bytes> {
        match method {
            "Send" => {
                let req: SendRequest = wire::from_body(&body)?;
                self.inner.send(&req.kind, req.payload).await?;
                Ok(wire::empty())
            }
            other => Err(unknown(TELEMETRY_SERVICE, other)),
        }
    }
}

#[derive(Debug)]
pub struct TelemetryClient {
    conn: Conn,
}

impl TelemetryClient {
    pub fn new(conn: Conn) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Telemetry for TelemetryClient {
    async fn send(&self, kind: &str, payload: Bytes) -> Result<()> {
        let body = wire::to_body(&SendRequest {
            kind: kind.to_string(),
            payload,
        })?;
        self.conn.invoke("Telemetry.Send", body).await?;
        Ok(())
    }
}
