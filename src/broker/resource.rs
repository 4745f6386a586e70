//! Named closable handles and the all-or-nothing close set.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;

use crate::types::{CloseFailure, Error, Result};

type Closer = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A named, closable handle to an opened sub-connection or served sub-service.
///
/// Closing consumes the resource, so it runs at most once.
pub struct Resource {
    name: String,
    close: Closer,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("name", &self.name).finish()
    }
}

impl Resource {
    pub fn new<F, Fut>(name: impl Into<String>, close: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            close: Box::new(move || Box::pin(close())),
        }
    }

    /// A resource with nothing to release.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, || async { Ok(()) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn close(self) -> Result<()> {
        (self.close)().await
    }
}

/// Ordered collection of resources, closed as a unit.
#[derive(Debug, Default)]
pub struct ResourceSet {
    resources: Vec<Resource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    pub fn extend(&mut self, other: ResourceSet) {
        self.resources.extend(other.resources);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Names in the order they were added.
    pub fn names(&self) -> Vec<&str> {
        self.resources.iter().map(Resource::name).collect()
    }

    /// Take every member out, leaving the set empty.
    pub fn take(&mut self) -> ResourceSet {
        std::mem::take(self)
    }

    /// Close every member, most recently added first.
    ///
    /// Every member is attempted even when earlier ones fail; failures are
    /// aggregated into [`Error::CloseAll`]. An empty set closes trivially.
    pub async fn close_all(self) -> Result<()> {
        let mut failures = Vec::new();
        for resource in self.resources.into_iter().rev() {
            let name = resource.name.clone();
            if let Err(error) = resource.close().await {
                failures.push(CloseFailure { name, error });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::CloseAll(failures))
        }
    }
}

impl From<Vec<Resource>> for ResourceSet {
    fn from(resources: Vec<Resource>) -> Self {
        Self { resources }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Resource {
        let log = log.clone();
        Resource::new(name, move || async move {
            log.lock().unwrap().push(name);
            if fail {
                Err(Error::internal(format!("{} refused", name)))
            } else {
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_close_all_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ResourceSet::new();
        set.push(recording("a", &log, false));
        set.push(recording("b", &log, false));
        set.push(recording("c", &log, false));
        assert_eq!(set.names(), vec!["a", "b", "c"]);

        set.close_all().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_close_all_attempts_every_member() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = ResourceSet::new();
        set.push(recording("a", &log, true));
        set.push(recording("b", &log, false));
        set.push(recording("c", &log, true));

        let err = set.close_all().await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        match err {
            Error::CloseAll(failures) => {
                let names: Vec<_> = failures.iter().map(|f| f.name.as_str()).collect();
                assert_eq!(names, vec!["c", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_set_closes() {
        ResourceSet::new().close_all().await.unwrap();
        let mut set = ResourceSet::from(vec![Resource::noop("x")]);
        let taken = set.take();
        assert!(set.is_empty());
        assert_eq!(taken.len(), 1);
        taken.close_all().await.unwrap();
    }
}
