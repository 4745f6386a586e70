//! Compose-then-call client connections.
//!
//! A [`ClientConn`] is built from a composition function. On first use the
//! function runs against a fresh [`Deps`]: it serves each local dependency the
//! remote factory needs (every one recorded as a resource, in order), then
//! issues exactly one remote call that returns the handle of the constructed
//! remote object. That handle is dialed and the resulting connection is what
//! callers talk to.
//!
//! If composition or the final dial fails, every resource recorded so far is
//! closed before the original error is returned. On success the resources
//! stay with the connection until it is closed.
//!
//! Connections are tied to a broker generation. When the supervisor relaunches
//! the plugin process the broker changes, and the next call composes again
//! against the new one.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use crate::broker::{Broker, Conn, Resource, ResourceSet, Server};
use crate::types::{DialOptions, Error, Result, ServiceHandle};

/// Anything calls can be addressed to.
#[async_trait]
pub trait CallTarget: Send + Sync {
    async fn invoke_within(&self, method: &str, body: Bytes, timeout: Duration) -> Result<Bytes>;

    /// Deadline applied by [`CallTarget::invoke`].
    fn call_timeout(&self) -> Duration;

    async fn invoke(&self, method: &str, body: Bytes) -> Result<Bytes> {
        self.invoke_within(method, body, self.call_timeout()).await
    }
}

#[async_trait]
impl<T: CallTarget + ?Sized> CallTarget for Arc<T> {
    async fn invoke_within(&self, method: &str, body: Bytes, timeout: Duration) -> Result<Bytes> {
        (**self).invoke_within(method, body, timeout).await
    }

    fn call_timeout(&self) -> Duration {
        (**self).call_timeout()
    }
}

/// Supplies the broker of the current process incarnation.
#[async_trait]
pub trait BrokerSource: Send + Sync {
    async fn broker(&self) -> Result<Arc<Broker>>;
}

#[async_trait]
impl BrokerSource for Arc<Broker> {
    async fn broker(&self) -> Result<Arc<Broker>> {
        if self.is_closed() {
            return Err(Error::unavailable(format!(
                "{} connection closed",
                self.config().name
            )));
        }
        Ok(self.clone())
    }
}

/// What a composition function works with: the broker, plus a record of every
/// resource it opens.
#[derive(Clone)]
pub struct Deps {
    broker: Arc<Broker>,
    opened: Arc<Mutex<ResourceSet>>,
}

impl fmt::Debug for Deps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deps").field("broker", &self.broker).finish()
    }
}

impl Deps {
    fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            opened: Arc::new(Mutex::new(ResourceSet::new())),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Serve a dependency and record its resource.
    pub async fn serve_new<F>(&self, name: &str, register: F) -> Result<ServiceHandle>
    where
        F: FnOnce(&mut Server) -> Result<()>,
    {
        let (handle, resource) = self.broker.serve_new(name, register).await?;
        self.add(resource).await;
        Ok(handle)
    }

    pub async fn serve(&self, name: &str, server: Server) -> Result<ServiceHandle> {
        let (handle, resource) = self.broker.serve(name, server).await?;
        self.add(resource).await;
        Ok(handle)
    }

    /// Dial a peer handle and record the connection.
    pub async fn dial(&self, name: &str, handle: ServiceHandle) -> Result<Conn> {
        let conn = self.broker.dial(name, handle).await?;
        self.add(conn.resource()).await;
        Ok(conn)
    }

    pub async fn add(&self, resource: Resource) {
        self.opened.lock().await.push(resource);
    }

    async fn take(&self) -> ResourceSet {
        self.opened.lock().await.take()
    }
}

type Compose = Arc<dyn Fn(Deps) -> BoxFuture<'static, Result<ServiceHandle>> + Send + Sync>;

struct Established {
    conn: Conn,
    resources: ResourceSet,
    broker: Arc<Broker>,
}

impl Established {
    fn is_current(&self, broker: &Arc<Broker>) -> bool {
        Arc::ptr_eq(&self.broker, broker) && !self.conn.is_closed()
    }

    async fn release(self) {
        self.conn.close();
        self.broker.close_all(self.resources).await;
    }
}

enum ConnState {
    Idle,
    Established(Established),
    Closed,
}

/// Lazily composed connection to one remote object.
pub struct ClientConn {
    name: String,
    source: Arc<dyn BrokerSource>,
    compose: Compose,
    state: Mutex<ConnState>,
    call_timeout: Duration,
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn").field("name", &self.name).finish()
    }
}

impl ClientConn {
    pub fn new<F, Fut>(name: impl Into<String>, source: Arc<dyn BrokerSource>, compose: F) -> Self
    where
        F: Fn(Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServiceHandle>> + Send + 'static,
    {
        Self {
            name: name.into(),
            source,
            compose: Arc::new(move |deps| Box::pin(compose(deps))),
            state: Mutex::new(ConnState::Idle),
            call_timeout: DialOptions::default().call_timeout,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Composed and usable against the current broker.
    pub async fn is_connected(&self) -> bool {
        let broker = self.source.broker().await;
        let state = self.state.lock().await;
        match (&*state, broker) {
            (ConnState::Established(est), Ok(broker)) => est.is_current(&broker),
            _ => false,
        }
    }

    /// Return the composed connection, composing first if needed.
    pub async fn connect(&self) -> Result<Conn> {
        let mut state = self.state.lock().await;
        if matches!(*state, ConnState::Closed) {
            return Err(Error::closed(self.name.clone()));
        }

        let broker = self.source.broker().await?;
        match std::mem::replace(&mut *state, ConnState::Idle) {
            ConnState::Established(est) if est.is_current(&broker) => {
                let conn = est.conn.clone();
                *state = ConnState::Established(est);
                return Ok(conn);
            }
            ConnState::Established(stale) => {
                tracing::debug!(
                    conn = %self.name,
                    from = stale.broker.generation(),
                    to = broker.generation(),
                    "recomposing"
                );
                stale.release().await;
            }
            ConnState::Idle | ConnState::Closed => {}
        }

        let est = self.compose_on(broker).await?;
        let conn = est.conn.clone();
        *state = ConnState::Established(est);
        Ok(conn)
    }

    /// Composition runs on its own task. If the caller is gone when it
    /// finishes, whatever it opened is released there.
    async fn compose_on(&self, broker: Arc<Broker>) -> Result<Established> {
        let (tx, rx) = oneshot::channel();
        let name = self.name.clone();
        let compose = self.compose.clone();
        tokio::spawn(async move {
            let outcome = compose_task(&name, compose, broker).await;
            if let Err(Ok(abandoned)) = tx.send(outcome) {
                tracing::debug!(conn = %name, "caller gone, releasing composed connection");
                abandoned.release().await;
            }
        });
        rx.await
            .map_err(|_| Error::internal(format!("{} composition task aborted", self.name)))?
    }

    /// Drop the composed connection after a transport failure on `failed`.
    async fn invalidate(&self, failed: &Conn) {
        let mut state = self.state.lock().await;
        let matches = matches!(
            &*state,
            ConnState::Established(est) if est.conn.same_connection(failed)
        );
        if !matches {
            return;
        }
        if let ConnState::Established(est) = std::mem::replace(&mut *state, ConnState::Idle) {
            est.release().await;
        }
    }

    /// Close the connection and every dependency it holds. Terminal.
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, ConnState::Closed);
        match previous {
            ConnState::Established(est) => {
                est.conn.close();
                est.resources.close_all().await
            }
            ConnState::Idle | ConnState::Closed => Ok(()),
        }
    }
}

async fn compose_task(name: &str, compose: Compose, broker: Arc<Broker>) -> Result<Established> {
    let deps = Deps::new(broker.clone());
    let result = match compose(deps.clone()).await {
        Ok(handle) => broker.dial(name, handle).await,
        Err(e) => Err(e),
    };
    let resources = deps.take().await;

    match result {
        Ok(conn) => {
            tracing::debug!(
                conn = %name,
                handle = %conn.handle(),
                deps = ?resources.names(),
                generation = broker.generation(),
                "composed"
            );
            Ok(Established {
                conn,
                resources,
                broker,
            })
        }
        Err(e) => {
            tracing::debug!(conn = %name, opened = resources.len(), "composition failed: {}", e);
            broker.close_all(resources).await;
            Err(e)
        }
    }
}

#[async_trait]
impl CallTarget for ClientConn {
    async fn invoke_within(&self, method: &str, body: Bytes, timeout: Duration) -> Result<Bytes> {
        let conn = self.connect().await?;
        let result = conn.invoke_within(method, body, timeout).await;
        if let Err(e) = &result {
            if e.is_transport() {
                tracing::debug!(conn = %self.name, method, "transport failure, invalidating: {}", e);
                self.invalidate(&conn).await;
            }
        }
        result
    }

    fn call_timeout(&self) -> Duration {
        self.call_timeout
    }
}
