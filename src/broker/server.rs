//! Server contexts and the per-connection handle table.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{Conn, Resource, ResourceSet};
use crate::clientconn::CallTarget;
use crate::ipc::{wire, Dispatcher};
use crate::types::{Error, Result, ServiceHandle};

/// Reserved method answered for every live handle. Used to validate dials.
pub const PING_METHOD: &str = "_broker.Ping";

/// One named service inside a [`Server`]. Receives the bare method name
/// (the part after `Service.`) and a msgpack body.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, method: &str, body: Bytes) -> Result<Bytes>;
}

/// A fresh server context: what one handle resolves to.
///
/// Calls are addressed as `"Service.Method"`. A server built with
/// [`Server::forward`] instead relays every call to another connection
/// unchanged.
pub struct Server {
    services: HashMap<String, Arc<dyn Service>>,
    forward: Option<Conn>,
    attached: Mutex<Option<ResourceSet>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.services.keys().collect();
        names.sort();
        f.debug_struct("Server")
            .field("services", &names)
            .field("forward", &self.forward.as_ref().map(Conn::name))
            .finish()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
            forward: None,
            attached: Mutex::new(Some(ResourceSet::new())),
        }
    }

    /// Passthrough server relaying every call to `target`.
    pub fn forward(target: Conn) -> Self {
        Self {
            forward: Some(target),
            ..Self::new()
        }
    }

    /// Register `service` under `name`. Names are unique per server.
    pub fn register(&mut self, name: impl Into<String>, service: impl Service + 'static) -> Result<()> {
        self.register_arc(name, Arc::new(service))
    }

    pub fn register_arc(&mut self, name: impl Into<String>, service: Arc<dyn Service>) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.contains('.') {
            return Err(Error::validation(format!("invalid service name: {:?}", name)));
        }
        if self.services.contains_key(&name) {
            return Err(Error::validation(format!("service already registered: {}", name)));
        }
        self.services.insert(name, service);
        Ok(())
    }

    /// Tie `resource` to this server; it is closed when the server shuts down.
    pub fn attach(&mut self, resource: Resource) {
        if let Some(set) = self.attached.get_mut() {
            set.push(resource);
        }
    }

    pub fn attach_set(&mut self, resources: ResourceSet) {
        if let Some(set) = self.attached.get_mut() {
            set.extend(resources);
        }
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub async fn handle(&self, method: &str, body: Bytes) -> Result<Bytes> {
        if let Some(target) = &self.forward {
            return target.invoke(method, body).await;
        }

        let (service, method) = method
            .split_once('.')
            .ok_or_else(|| Error::validation(format!("malformed method: {}", method)))?;
        let service = self
            .services
            .get(service)
            .ok_or_else(|| Error::not_found(format!("service not registered: {}", service)))?;
        service.call(method, body).await
    }

    /// Close attached resources. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<()> {
        let attached = self.attached.lock().await.take();
        match attached {
            Some(set) => set.close_all().await,
            None => Ok(()),
        }
    }
}

struct Entry {
    name: String,
    server: Arc<Server>,
}

/// Handles served on this side of a connection.
#[derive(Default)]
pub(crate) struct HandleTable {
    entries: RwLock<HashMap<ServiceHandle, Entry>>,
}

impl HandleTable {
    pub(crate) fn with_root(server: Server) -> Self {
        let entries = HashMap::from([(
            ServiceHandle::ROOT,
            Entry {
                name: "root".to_string(),
                server: Arc::new(server),
            },
        )]);
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub(crate) async fn insert(&self, handle: ServiceHandle, name: &str, server: Arc<Server>) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&handle) {
            return Err(Error::validation(format!("handle {} already served", handle)));
        }
        entries.insert(
            handle,
            Entry {
                name: name.to_string(),
                server,
            },
        );
        Ok(())
    }

    pub(crate) async fn remove(&self, handle: ServiceHandle) -> Option<Arc<Server>> {
        self.entries.write().await.remove(&handle).map(|e| e.server)
    }

    pub(crate) async fn drain(&self) -> Vec<(String, Arc<Server>)> {
        self.entries
            .write()
            .await
            .drain()
            .map(|(_, e)| (e.name, e.server))
            .collect()
    }

    pub(crate) async fn served(&self) -> Vec<(ServiceHandle, String)> {
        let mut served: Vec<_> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(h, e)| (*h, e.name.clone()))
            .collect();
        served.sort();
        served
    }
}

#[async_trait]
impl Dispatcher for HandleTable {
    async fn dispatch(&self, handle: ServiceHandle, method: &str, body: Bytes) -> Result<Bytes> {
        let server = self
            .entries
            .read()
            .await
            .get(&handle)
            .map(|e| e.server.clone())
            .ok_or(Error::UnknownHandle(handle))?;

        if method == PING_METHOD {
            return Ok(wire::empty());
        }
        server.handle(method, body).await
    }
}
