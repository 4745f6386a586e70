//! Explicit item-type → handler table.
//!
//! Generic calls carry a string item type plus a [`VersionedPayload`] of
//! parameters. Handlers are registered once at setup with their concrete
//! parameter and return types, so locating the right decoder is a map lookup
//! rather than runtime type inspection.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::{decode, encode, EncodingVersion, VersionedPayload};
use crate::types::{Error, Result};

type ErasedHandler =
    Arc<dyn Fn(VersionedPayload, EncodingVersion) -> BoxFuture<'static, Result<VersionedPayload>> + Send + Sync>;

/// Registered handlers keyed by item type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, ErasedHandler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("item_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `item_type`.
    ///
    /// Registering the same item type twice is a validation error.
    pub fn register<P, R, F, Fut>(&mut self, item_type: impl Into<String>, handler: F) -> Result<()>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let item_type = item_type.into();
        if self.handlers.contains_key(&item_type) {
            return Err(Error::validation(format!(
                "handler already registered for item type: {}",
                item_type
            )));
        }

        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |params, returns| {
            let handler = handler.clone();
            Box::pin(async move {
                let params: P = decode(&params)?;
                let value = handler(params).await?;
                Ok(encode(&value, returns)?)
            })
        });
        self.handlers.insert(item_type, erased);
        Ok(())
    }

    /// Decode `params` by its own tag, run the handler, encode the result with `returns`.
    pub async fn dispatch(
        &self,
        item_type: &str,
        params: VersionedPayload,
        returns: EncodingVersion,
    ) -> Result<VersionedPayload> {
        let handler = self
            .handlers
            .get(item_type)
            .ok_or_else(|| Error::not_found(format!("no handler for item type: {}", item_type)))?
            .clone();
        handler(params, returns).await
    }

    pub fn contains(&self, item_type: &str) -> bool {
        self.handlers.contains_key(item_type)
    }

    pub fn item_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
