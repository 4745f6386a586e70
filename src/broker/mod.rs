//! Handle broker: one per supervised connection.
//!
//! The broker owns the handle table for its side of a multiplexed connection.
//! Serving a [`Server`] assigns it a fresh [`ServiceHandle`]; the peer dials
//! that handle back into a [`Conn`]. Because calling code only ever deals in
//! handles, a service may live in the host, in this plugin, or be relayed
//! from a third process without the caller noticing.

mod resource;
mod server;

pub use resource::{Resource, ResourceSet};
pub use server::{Server, Service, PING_METHOD};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::clientconn::CallTarget;
use crate::ipc::{wire, Mux};
use crate::types::{DialOptions, Error, MuxConfig, Result, ServiceHandle};
use server::HandleTable;

/// Settings shared by every component opening sub-connections for one
/// supervised client. Immutable once the broker exists.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Label used in logs and error messages.
    pub name: String,
    pub dial: DialOptions,
    /// Stop signal of the owning client.
    pub stop: CancellationToken,
}

impl BrokerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dial: DialOptions::default(),
            stop: CancellationToken::new(),
        }
    }

    pub fn with_dial(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }
}

pub struct Broker {
    config: BrokerConfig,
    mux: Mux,
    table: Arc<HandleTable>,
    next_handle: AtomicU32,
    generation: u64,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.config.name)
            .field("generation", &self.generation)
            .field("mux", &self.mux)
            .finish()
    }
}

impl Broker {
    /// Start a broker over an established stream.
    ///
    /// `generation` identifies the process incarnation the stream belongs to.
    pub fn connect<S>(stream: S, config: BrokerConfig, mux_config: MuxConfig, generation: u64) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let table = Arc::new(HandleTable::default());
        let mux = Mux::start(config.name.clone(), stream, table.clone(), mux_config);
        tracing::debug!(broker = %config.name, generation, "broker connected");
        Arc::new(Self {
            config,
            mux,
            table,
            next_handle: AtomicU32::new(1),
            generation,
        })
    }

    /// Like [`Broker::connect`], with the root service in place before the
    /// first frame is read. Incoming calls are held until the returned broker
    /// exists.
    ///
    /// `root` receives a weak reference to the broker being built, so root
    /// services can dial handles they are given later.
    pub fn connect_with_root<S, F>(
        stream: S,
        config: BrokerConfig,
        mux_config: MuxConfig,
        generation: u64,
        root: F,
    ) -> Result<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnOnce(Weak<Broker>) -> Result<Server>,
    {
        let mut failure = None;
        let mut gate = None;
        let broker = Arc::new_cyclic(|weak: &Weak<Broker>| {
            let table = match root(weak.clone()) {
                Ok(server) => HandleTable::with_root(server),
                Err(e) => {
                    failure = Some(e);
                    HandleTable::default()
                }
            };
            let table = Arc::new(table);
            let (mux, read_gate) = Mux::start_gated(config.name.clone(), stream, table.clone(), mux_config);
            gate = Some(read_gate);
            Self {
                config,
                mux,
                table,
                next_handle: AtomicU32::new(1),
                generation,
            }
        });
        if let Some(e) = failure {
            broker.mux.shutdown();
            return Err(Error::serve("root", e));
        }
        // The root may upgrade its weak reference from here on.
        if let Some(gate) = gate {
            gate.open();
        }
        tracing::debug!(broker = %broker.config.name, generation, "broker connected with root");
        Ok(broker)
    }

    /// Two brokers joined by an in-memory stream.
    pub fn in_memory_pair(
        host: BrokerConfig,
        plugin: BrokerConfig,
        mux_config: MuxConfig,
    ) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            Self::connect(a, host, mux_config.clone(), 0),
            Self::connect(b, plugin, mux_config, 0),
        )
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mux(&self) -> &Mux {
        &self.mux
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    pub async fn closed(&self) {
        self.mux.closed().await;
    }

    /// Build a fresh server context with `register` and serve it.
    pub async fn serve_new<F>(&self, name: &str, register: F) -> Result<(ServiceHandle, Resource)>
    where
        F: FnOnce(&mut Server) -> Result<()>,
    {
        let mut server = Server::new();
        register(&mut server).map_err(|e| Error::serve(name, e))?;
        self.serve(name, server).await
    }

    /// Serve an already-built server under a new handle.
    ///
    /// The returned resource withdraws the handle and shuts the server down.
    pub async fn serve(&self, name: &str, server: Server) -> Result<(ServiceHandle, Resource)> {
        if self.mux.is_closed() {
            return Err(Error::serve(
                name,
                Error::connection_closed(format!("{} connection closed", self.config.name)),
            ));
        }
        let handle = self.allocate_handle().map_err(|e| Error::serve(name, e))?;
        let server = Arc::new(server);
        self.table
            .insert(handle, name, server)
            .await
            .map_err(|e| Error::serve(name, e))?;
        tracing::debug!(broker = %self.config.name, service = name, %handle, "serving");

        let table = self.table.clone();
        let resource = Resource::new(name, move || async move {
            match table.remove(handle).await {
                Some(server) => server.shutdown().await,
                None => Ok(()),
            }
        });
        Ok((handle, resource))
    }

    /// Serve the root service (handle 0) of this side.
    pub async fn serve_root(&self, server: Server) -> Result<()> {
        self.table
            .insert(ServiceHandle::ROOT, "root", Arc::new(server))
            .await
            .map_err(|e| Error::serve("root", e))
    }

    /// Resolve `handle` on the peer into a usable connection.
    ///
    /// The handle is pinged first, so a stale handle or a dead transport
    /// fails here with [`Error::Dial`] naming `name` and `handle`.
    pub async fn dial(&self, name: &str, handle: ServiceHandle) -> Result<Conn> {
        let ping = self
            .mux
            .call(handle, PING_METHOD, wire::empty(), self.config.dial.dial_timeout);
        let result = tokio::select! {
            result = ping => result,
            _ = self.config.stop.cancelled() => Err(Error::cancelled("stop signal")),
        };
        match result {
            Ok(_) => Ok(Conn::new(
                name,
                handle,
                self.mux.clone(),
                self.config.dial.call_timeout,
            )),
            Err(e) => Err(Error::dial(name, handle, e)),
        }
    }

    /// Dial each `(name, handle)` in order.
    ///
    /// When a dial fails, every connection dialed before it is closed before
    /// the dial error is returned.
    pub async fn dial_all(&self, deps: &[(&str, ServiceHandle)]) -> Result<(Vec<Conn>, ResourceSet)> {
        let mut conns = Vec::with_capacity(deps.len());
        let opened = self.dial_each(deps, &mut conns).await?;
        Ok((conns, opened))
    }

    async fn dial_each(&self, deps: &[(&str, ServiceHandle)], conns: &mut Vec<Conn>) -> Result<ResourceSet> {
        let mut opened = ResourceSet::new();
        for (name, handle) in deps {
            match self.dial(name, *handle).await {
                Ok(conn) => {
                    opened.push(conn.resource());
                    conns.push(conn);
                }
                Err(e) => {
                    self.close_all(opened).await;
                    return Err(e);
                }
            }
        }
        Ok(opened)
    }

    /// Best-effort close used on failure paths. Failures are logged, never returned.
    pub async fn close_all(&self, resources: ResourceSet) {
        if resources.is_empty() {
            return;
        }
        let count = resources.len();
        if let Err(e) = resources.close_all().await {
            tracing::warn!(broker = %self.config.name, count, "rollback close failed: {}", e);
        }
    }

    /// Handles currently served on this side.
    pub async fn served(&self) -> Vec<(ServiceHandle, String)> {
        self.table.served().await
    }

    /// Close the connection and shut down every served server.
    pub async fn shutdown(&self) {
        self.mux.shutdown();
        for (name, server) in self.table.drain().await {
            if let Err(e) = server.shutdown().await {
                tracing::warn!(broker = %self.config.name, service = %name, "shutdown failed: {}", e);
            }
        }
    }

    fn allocate_handle(&self) -> Result<ServiceHandle> {
        self.next_handle
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .map(ServiceHandle::new)
            .map_err(|_| Error::internal("handle space exhausted"))
    }
}

/// A dialed handle on the peer.
#[derive(Clone)]
pub struct Conn {
    name: Arc<str>,
    handle: ServiceHandle,
    mux: Mux,
    closed: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Conn {
    fn new(name: &str, handle: ServiceHandle, mux: Mux, call_timeout: Duration) -> Self {
        Self {
            name: Arc::from(name),
            handle,
            mux,
            closed: Arc::new(AtomicBool::new(false)),
            call_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle
    }

    /// Closed locally, or the underlying connection is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.mux.is_closed()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True when both are clones of the same dial.
    pub fn same_connection(&self, other: &Conn) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }

    /// Resource that closes this connection (every clone of it).
    pub fn resource(&self) -> Resource {
        let conn = self.clone();
        Resource::new(self.name.to_string(), move || async move {
            conn.close();
            Ok(())
        })
    }
}

#[async_trait]
impl CallTarget for Conn {
    async fn invoke_within(&self, method: &str, body: Bytes, timeout: Duration) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(format!("{} (handle {})", self.name, self.handle)));
        }
        self.mux.call(self.handle, method, body, timeout).await
    }

    fn call_timeout(&self) -> Duration {
        self.call_timeout
    }
}
