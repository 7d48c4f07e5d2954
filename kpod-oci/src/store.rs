//! In-memory registry of containers known to the supervisor.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::container::Container;

/// Thread-safe lookup of containers by id.
///
/// A container is added once it was constructed and removed only after the
/// runtime confirmed its deletion.
#[derive(Debug, Default)]
pub struct ContainerStore {
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container.
    ///
    /// Returns the container previously registered under the same id.
    pub fn add(&self, container: Arc<Container>) -> Option<Arc<Container>> {
        self.write()
            .insert(container.id().to_string(), container)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Container>> {
        self.write().remove(id)
    }

    /// All containers, oldest first.
    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut containers: Vec<_> = self.read().values().cloned().collect();
        containers.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id().cmp(b.id())));
        containers
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // The map stays consistent even if a holder panicked, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Container>>> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Container>>> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;
    use chrono::{Duration, Utc};

    fn container(id: &str, age_secs: i64) -> Arc<Container> {
        Arc::new(Container::new(ContainerConfig {
            id: id.into(),
            created: Some(Utc::now() - Duration::seconds(age_secs)),
            ..Default::default()
        }))
    }

    #[test]
    fn add_get_remove() {
        let store = ContainerStore::new();
        assert!(store.is_empty());

        assert!(store.add(container("a", 0)).is_none());
        assert!(store.contains("a"));
        assert_eq!(store.get("a").map(|c| c.id().to_string()), Some("a".into()));
        assert!(store.add(container("a", 0)).is_some());
        assert_eq!(store.len(), 1);

        assert!(store.remove("a").is_some());
        assert!(store.get("a").is_none());
        assert!(store.remove("a").is_none());
    }

    #[test]
    fn list_is_oldest_first() {
        let store = ContainerStore::new();
        store.add(container("new", 1));
        store.add(container("old", 100));
        store.add(container("mid", 10));

        let ids: Vec<_> = store.list().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, ["old", "mid", "new"]);
    }
}
