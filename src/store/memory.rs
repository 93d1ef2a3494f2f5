//! In-process reference implementation of the coordination-store contract.
//!
//! Backs the test suite and single-process compositions. Nodes live in a flat
//! path map; child counts are derived by prefix, so the membership condition
//! works even when the parent node was never explicitly created.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use super::{parent, validate_path, ChangeKind, CoordinationStore, NodeView, StoreEvent, WatchHandle};
use crate::core::errors::{DroverError, Result};

#[derive(Debug, Clone)]
struct StoredNode {
    value: Vec<u8>,
    version: i64,
}

/// DashMap-backed coordination store
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: DashMap<String, StoredNode>,
    data_watches: Mutex<Vec<(String, oneshot::Sender<StoreEvent>)>>,
    child_watches: Mutex<Vec<(String, oneshot::Sender<StoreEvent>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn count_children(&self, path: &str) -> usize {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.starts_with(&prefix) && !key[prefix.len()..].contains('/')
            })
            .count()
    }

    fn view(&self, path: &str, node: &StoredNode) -> NodeView {
        NodeView {
            path: path.to_string(),
            value: node.value.clone(),
            version: node.version,
            child_count: self.count_children(path),
        }
    }

    /// Fire and consume every registered data watch for `path`
    fn fire_data(&self, path: &str, kind: ChangeKind) {
        let mut registry = self.data_watches.lock().expect("watch registry poisoned");
        let mut remaining = Vec::with_capacity(registry.len());
        for (watched, sender) in registry.drain(..) {
            if watched == path {
                trace!(path = %path, ?kind, "firing data watch");
                let _ = sender.send(StoreEvent {
                    path: path.to_string(),
                    kind,
                });
            } else if !sender.is_closed() {
                remaining.push((watched, sender));
            }
        }
        *registry = remaining;
    }

    /// Fire and consume every children watch on the parent of `path`
    fn fire_children(&self, child_path: &str) {
        let Some(parent_path) = parent(child_path) else {
            return;
        };
        let mut registry = self.child_watches.lock().expect("watch registry poisoned");
        let mut remaining = Vec::with_capacity(registry.len());
        for (watched, sender) in registry.drain(..) {
            if watched == parent_path {
                trace!(path = %parent_path, "firing children watch");
                let _ = sender.send(StoreEvent {
                    path: parent_path.clone(),
                    kind: ChangeKind::ChildrenChanged,
                });
            } else if !sender.is_closed() {
                remaining.push((watched, sender));
            }
        }
        *registry = remaining;
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<NodeView>> {
        validate_path(path)?;
        // clone out so no shard guard is held while counting children
        let node = self.nodes.get(path).map(|entry| entry.value().clone());
        Ok(node.map(|node| self.view(path, &node)))
    }

    async fn child_count(&self, path: &str) -> Result<usize> {
        validate_path(path)?;
        Ok(self.count_children(path))
    }

    async fn create(&self, path: &str, value: &[u8]) -> Result<NodeView> {
        validate_path(path)?;
        let node = StoredNode {
            value: value.to_vec(),
            version: 0,
        };
        match self.nodes.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(DroverError::NodeExists {
                    path: path.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(node.clone());
            }
        }
        self.fire_data(path, ChangeKind::Created);
        self.fire_children(path);
        Ok(self.view(path, &node))
    }

    async fn set(
        &self,
        path: &str,
        value: &[u8],
        expected_version: Option<i64>,
    ) -> Result<NodeView> {
        validate_path(path)?;
        let updated = {
            let mut entry = self.nodes.get_mut(path).ok_or_else(|| DroverError::NotFound {
                path: path.to_string(),
            })?;
            if let Some(expected) = expected_version {
                if entry.version != expected {
                    return Err(DroverError::VersionConflict {
                        path: path.to_string(),
                        expected,
                        actual: entry.version,
                    });
                }
            }
            entry.value = value.to_vec();
            entry.version += 1;
            entry.clone()
        };
        self.fire_data(path, ChangeKind::DataChanged);
        Ok(self.view(path, &updated))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        if self.nodes.remove(path).is_none() {
            return Err(DroverError::NotFound {
                path: path.to_string(),
            });
        }
        self.fire_data(path, ChangeKind::Deleted);
        self.fire_children(path);
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<WatchHandle> {
        validate_path(path)?;
        let (tx, rx) = oneshot::channel();
        self.data_watches
            .lock()
            .expect("watch registry poisoned")
            .push((path.to_string(), tx));
        Ok(WatchHandle::new(rx, path))
    }

    async fn watch_children(&self, path: &str) -> Result<WatchHandle> {
        validate_path(path)?;
        let (tx, rx) = oneshot::channel();
        self.child_watches
            .lock()
            .expect("watch registry poisoned")
            .push((path.to_string(), tx));
        Ok(WatchHandle::new(rx, path))
    }
}
