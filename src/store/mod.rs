//! Coordination-store contract.
//!
//! The store is an external collaborator: a hierarchical, versioned key tree
//! offering single-shot change notifications. drover consumes it through the
//! [`CoordinationStore`] trait; [`MemoryStore`] is the in-process reference
//! implementation used by the test suite and local compositions.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::core::errors::{DroverError, Result};

/// A snapshot of one store node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub path: String,
    pub value: Vec<u8>,
    pub version: i64,
    pub child_count: usize,
}

/// The category of change a watch observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    DataChanged,
    Deleted,
    ChildrenChanged,
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub path: String,
    pub kind: ChangeKind,
}

/// A single-shot change subscription.
///
/// Delivers at most one [`StoreEvent`]; callers needing further notifications
/// re-arm by calling `watch`/`watch_children` again. Dropping the handle
/// cancels the subscription.
#[derive(Debug)]
pub struct WatchHandle {
    rx: oneshot::Receiver<StoreEvent>,
    path: String,
}

impl WatchHandle {
    pub fn new(rx: oneshot::Receiver<StoreEvent>, path: impl Into<String>) -> Self {
        Self {
            rx,
            path: path.into(),
        }
    }

    /// Block until the one event arrives. An error means the store side was
    /// dropped (connection closed) before delivering.
    pub async fn recv(self) -> Result<StoreEvent> {
        self.rx
            .await
            .map_err(|_| DroverError::store("watch", self.path, "watch source dropped"))
    }

    /// Cancel the subscription without waiting
    pub fn cancel(self) {}
}

/// Hierarchical, versioned key tree with single-shot change notifications.
///
/// Every operation is single-attempt and fail-fast: errors surface verbatim
/// and nothing retries internally.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Fetch one node, or `None` if the path does not exist
    async fn get(&self, path: &str) -> Result<Option<NodeView>>;

    /// Number of direct children under `path`.
    ///
    /// Defined for absent paths (0 unless children exist independently), so
    /// membership conditions can be armed regardless of node existence.
    async fn child_count(&self, path: &str) -> Result<usize>;

    /// Create a node; fails with `NodeExists` if the path is taken
    async fn create(&self, path: &str, value: &[u8]) -> Result<NodeView>;

    /// Replace a node's value. With `expected_version` set, fails with
    /// `VersionConflict` unless the stored version matches.
    async fn set(&self, path: &str, value: &[u8], expected_version: Option<i64>)
        -> Result<NodeView>;

    /// Delete a node; fails with `NotFound` if absent
    async fn delete(&self, path: &str) -> Result<()>;

    /// Arm a single-shot watch for creation/data-change/deletion of `path`
    async fn watch(&self, path: &str) -> Result<WatchHandle>;

    /// Arm a single-shot watch for children-changed events under `path`
    async fn watch_children(&self, path: &str) -> Result<WatchHandle>;
}

/// Create-or-set: the store has no native upsert, so recording paths go
/// through this helper.
pub async fn put(store: &dyn CoordinationStore, path: &str, value: &[u8]) -> Result<NodeView> {
    match store.create(path, value).await {
        Err(DroverError::NodeExists { .. }) => store.set(path, value, None).await,
        other => other,
    }
}

/// Validate a store path: absolute, '/'-delimited, no empty segments
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(DroverError::configuration(format!(
            "store path '{}' must be absolute",
            path
        )));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(DroverError::configuration(format!(
            "store path '{}' must not end with '/'",
            path
        )));
    }
    if path.contains("//") {
        return Err(DroverError::configuration(format!(
            "store path '{}' contains an empty segment",
            path
        )));
    }
    Ok(())
}

/// Join a base path and a child segment
pub fn join(base: &str, child: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), child)
}

/// Parent of a path, or `None` at the root
pub fn parent(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}
