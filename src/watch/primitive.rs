//! One-shot watch primitives over a single coordination-store path.
//!
//! A [`StateWatch`] observes one path for one change category and completes
//! at most once: Fired, TimedOut, Cancelled, and Failed (store connection
//! gone) are mutually exclusive terminal states. The store's own watches are
//! single-shot, so each driver re-arms internally until it sees the category
//! it was armed for; only the Members variant re-arms on a matching event
//! whose predicate is not yet satisfied. Constructors arm the first store
//! watch before spawning the driver, so no change after arming is missed.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::errors::{DroverError, Result};
use crate::store::{ChangeKind, CoordinationStore, NodeView, WatchHandle};

/// The capability variant of a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Created,
    Deleted,
    Changed,
    Members,
}

/// Numeric predicate over a node's child count.
///
/// `equals` wins when set; otherwise the half-open range `[min, max)` applies
/// with missing bounds open. `outside_range` complements the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersPredicate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equals: Option<usize>,
    #[serde(default)]
    pub outside_range: bool,
}

impl MembersPredicate {
    /// Exact-count predicate
    pub fn exactly(count: usize) -> Self {
        Self {
            min: None,
            max: None,
            equals: Some(count),
            outside_range: false,
        }
    }

    /// Half-open range predicate `[min, max)`
    pub fn between(min: usize, max: usize) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            equals: None,
            outside_range: false,
        }
    }

    pub fn is_satisfied(&self, count: usize) -> bool {
        let inside = match self.equals {
            Some(expected) => count == expected,
            None => {
                self.min.map_or(true, |min| count >= min)
                    && self.max.map_or(true, |max| count < max)
            }
        };
        if self.outside_range {
            !inside
        } else {
            inside
        }
    }

    /// A predicate with no bounds at all matches everything or nothing and
    /// is a descriptor mistake.
    pub fn validate(&self) -> Result<()> {
        if self.equals.is_none() && self.min.is_none() && self.max.is_none() {
            return Err(DroverError::configuration(
                "members condition needs min, max, or equals",
            ));
        }
        Ok(())
    }
}

/// The (before, after) node pair a fired watch reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedChange {
    pub before: Option<NodeView>,
    pub after: Option<NodeView>,
}

/// One watch's report on the shared group channel
#[derive(Debug)]
pub struct WatchReport {
    pub kind: WatchKind,
    pub path: String,
    pub result: Result<ObservedChange>,
}

#[derive(Debug, Clone)]
enum Terminal {
    Fired(ObservedChange),
    TimedOut(u64),
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
struct WatchShared {
    path: String,
    kind: WatchKind,
    terminal: Mutex<Option<Terminal>>,
    changed: Notify,
    done: CancellationToken,
}

impl WatchShared {
    fn new(path: String, kind: WatchKind) -> Self {
        Self {
            path,
            kind,
            terminal: Mutex::new(None),
            changed: Notify::new(),
            done: CancellationToken::new(),
        }
    }

    /// Record the terminal state; only the first caller wins
    fn complete(&self, terminal: Terminal) -> bool {
        {
            let mut slot = self.terminal.lock().expect("watch state poisoned");
            if slot.is_some() {
                return false;
            }
            trace!(path = %self.path, kind = ?self.kind, terminal = ?terminal, "watch completed");
            *slot = Some(terminal);
        }
        self.done.cancel();
        self.changed.notify_waiters();
        true
    }

    fn fail(&self, err: &DroverError) {
        self.complete(Terminal::Failed(err.to_string()));
    }

    async fn wait_terminal(&self) -> Terminal {
        loop {
            let notified = self.changed.notified();
            if let Some(terminal) = self.terminal.lock().expect("watch state poisoned").clone() {
                return terminal;
            }
            notified.await;
        }
    }

    fn into_result(&self, terminal: Terminal) -> Result<ObservedChange> {
        match terminal {
            Terminal::Fired(change) => Ok(change),
            Terminal::TimedOut(ms) => Err(DroverError::timeout(
                format!("{:?} watch on '{}'", self.kind, self.path),
                ms,
            )),
            Terminal::Cancelled => Err(DroverError::cancelled(format!(
                "{:?} watch on '{}'",
                self.kind, self.path
            ))),
            Terminal::Failed(message) => {
                Err(DroverError::store("watch", self.path.clone(), message))
            }
        }
    }
}

/// A one-shot observer of a single store path for one change category
#[derive(Debug, Clone)]
pub struct StateWatch {
    shared: Arc<WatchShared>,
}

impl StateWatch {
    /// Arm a watch that fires when `path` comes into existence.
    ///
    /// Precondition: the path must not exist yet.
    pub async fn created(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
    ) -> Result<StateWatch> {
        let path = path.into();
        let primed = store.watch(&path).await?;
        if store.get(&path).await?.is_some() {
            primed.cancel();
            return Err(DroverError::invalid_state(
                path,
                "created watch requires the path to be absent",
            ));
        }
        let shared = Arc::new(WatchShared::new(path, WatchKind::Created));
        tokio::spawn(drive_created(store, Arc::clone(&shared), Some(primed)));
        Ok(StateWatch { shared })
    }

    /// Arm a watch that fires when `path` is removed.
    ///
    /// Precondition: the path must exist.
    pub async fn deleted(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
    ) -> Result<StateWatch> {
        let path = path.into();
        let primed = store.watch(&path).await?;
        let Some(before) = store.get(&path).await? else {
            primed.cancel();
            return Err(DroverError::invalid_state(
                path,
                "deleted watch requires the path to exist",
            ));
        };
        let shared = Arc::new(WatchShared::new(path, WatchKind::Deleted));
        tokio::spawn(drive_deleted(store, Arc::clone(&shared), before, Some(primed)));
        Ok(StateWatch { shared })
    }

    /// Arm a watch that fires on value mutation or creation of `path`.
    /// Valid in either existence state.
    pub async fn changed(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
    ) -> Result<StateWatch> {
        let path = path.into();
        let primed = store.watch(&path).await?;
        let before = store.get(&path).await?;
        let shared = Arc::new(WatchShared::new(path, WatchKind::Changed));
        tokio::spawn(drive_changed(store, Arc::clone(&shared), before, Some(primed)));
        Ok(StateWatch { shared })
    }

    /// Arm a watch that fires once the child count of `path` satisfies the
    /// predicate. Valid regardless of existence; an already-satisfied
    /// predicate fires immediately.
    pub async fn members(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
        predicate: MembersPredicate,
    ) -> Result<StateWatch> {
        predicate.validate()?;
        let path = path.into();
        let primed = store.watch_children(&path).await?;
        let shared = Arc::new(WatchShared::new(path, WatchKind::Members));
        tokio::spawn(drive_members(
            store,
            Arc::clone(&shared),
            predicate,
            Some(primed),
        ));
        Ok(StateWatch { shared })
    }

    pub fn kind(&self) -> WatchKind {
        self.shared.kind
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Block until the watch reaches a terminal state
    pub async fn wait(&self) -> Result<ObservedChange> {
        let terminal = self.shared.wait_terminal().await;
        self.shared.into_result(terminal)
    }

    /// Arm a timer that completes the watch with Timeout unless it fires
    /// first
    pub fn set_timeout(&self, timeout: Duration) {
        let shared = Arc::clone(&self.shared);
        let timeout_ms = timeout.as_millis() as u64;
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    shared.complete(Terminal::TimedOut(timeout_ms));
                }
            }
        });
    }

    /// Cancel the watch; a no-op once terminal
    pub fn cancel(&self) {
        self.shared.complete(Terminal::Cancelled);
    }

    /// Group-notify hook: forward this watch's terminal result onto a shared
    /// channel. Consumed by `ConditionSet`.
    pub fn notify_group(&self, group: mpsc::Sender<WatchReport>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let terminal = shared.wait_terminal().await;
            let report = WatchReport {
                kind: shared.kind,
                path: shared.path.clone(),
                result: shared.into_result(terminal),
            };
            if group.send(report).await.is_err() {
                debug!(path = %shared.path, "group channel gone before watch report");
            }
        });
    }
}

/// Take the pre-armed handle on the first pass, re-arm afterwards
async fn next_handle(
    store: &Arc<dyn CoordinationStore>,
    shared: &WatchShared,
    primed: &mut Option<WatchHandle>,
    children: bool,
) -> Option<WatchHandle> {
    if let Some(handle) = primed.take() {
        return Some(handle);
    }
    let armed = if children {
        store.watch_children(&shared.path).await
    } else {
        store.watch(&shared.path).await
    };
    match armed {
        Ok(handle) => Some(handle),
        Err(err) => {
            shared.fail(&err);
            None
        }
    }
}

async fn drive_created(
    store: Arc<dyn CoordinationStore>,
    shared: Arc<WatchShared>,
    mut primed: Option<WatchHandle>,
) {
    loop {
        if shared.done.is_cancelled() {
            return;
        }
        let Some(handle) = next_handle(&store, &shared, &mut primed, false).await else {
            return;
        };
        // sample after arming: a creation racing the arm fires immediately
        match store.get(&shared.path).await {
            Ok(Some(after)) => {
                shared.complete(Terminal::Fired(ObservedChange {
                    before: None,
                    after: Some(after),
                }));
                return;
            }
            Ok(None) => {}
            Err(err) => {
                shared.fail(&err);
                return;
            }
        }
        tokio::select! {
            _ = shared.done.cancelled() => return,
            event = handle.recv() => match event {
                Err(err) => {
                    shared.fail(&err);
                    return;
                }
                // loop back to re-sample; the next pass fires if it exists
                Ok(_) => continue,
            }
        }
    }
}

async fn drive_deleted(
    store: Arc<dyn CoordinationStore>,
    shared: Arc<WatchShared>,
    mut before: NodeView,
    mut primed: Option<WatchHandle>,
) {
    loop {
        if shared.done.is_cancelled() {
            return;
        }
        let Some(handle) = next_handle(&store, &shared, &mut primed, false).await else {
            return;
        };
        match store.get(&shared.path).await {
            Ok(Some(current)) => before = current,
            Ok(None) => {
                shared.complete(Terminal::Fired(ObservedChange {
                    before: Some(before),
                    after: None,
                }));
                return;
            }
            Err(err) => {
                shared.fail(&err);
                return;
            }
        }
        tokio::select! {
            _ = shared.done.cancelled() => return,
            event = handle.recv() => match event {
                Err(err) => {
                    shared.fail(&err);
                    return;
                }
                Ok(event) => {
                    if event.kind == ChangeKind::Deleted {
                        shared.complete(Terminal::Fired(ObservedChange {
                            before: Some(before),
                            after: None,
                        }));
                        return;
                    }
                    // data changed while waiting for deletion: re-arm
                    continue;
                }
            }
        }
    }
}

async fn drive_changed(
    store: Arc<dyn CoordinationStore>,
    shared: Arc<WatchShared>,
    mut before: Option<NodeView>,
    mut primed: Option<WatchHandle>,
) {
    loop {
        if shared.done.is_cancelled() {
            return;
        }
        let Some(handle) = next_handle(&store, &shared, &mut primed, false).await else {
            return;
        };
        tokio::select! {
            _ = shared.done.cancelled() => return,
            event = handle.recv() => match event {
                Err(err) => {
                    shared.fail(&err);
                    return;
                }
                Ok(event) => match event.kind {
                    ChangeKind::Created | ChangeKind::DataChanged => {
                        let after = match store.get(&shared.path).await {
                            Ok(view) => view,
                            Err(err) => {
                                shared.fail(&err);
                                return;
                            }
                        };
                        shared.complete(Terminal::Fired(ObservedChange { before, after }));
                        return;
                    }
                    ChangeKind::Deleted => {
                        // a deletion resets the baseline; fire on recreation
                        before = None;
                        continue;
                    }
                    ChangeKind::ChildrenChanged => continue,
                }
            }
        }
    }
}

async fn drive_members(
    store: Arc<dyn CoordinationStore>,
    shared: Arc<WatchShared>,
    predicate: MembersPredicate,
    mut primed: Option<WatchHandle>,
) {
    // explicit loop rather than recursive re-subscription: membership churn
    // can deliver any number of unsatisfied events before the one that fires
    loop {
        if shared.done.is_cancelled() {
            return;
        }
        let Some(handle) = next_handle(&store, &shared, &mut primed, true).await else {
            return;
        };
        let count = match store.child_count(&shared.path).await {
            Ok(count) => count,
            Err(err) => {
                shared.fail(&err);
                return;
            }
        };
        if predicate.is_satisfied(count) {
            let after = match store.get(&shared.path).await {
                Ok(view) => view,
                Err(err) => {
                    shared.fail(&err);
                    return;
                }
            };
            shared.complete(Terminal::Fired(ObservedChange {
                before: None,
                after,
            }));
            return;
        }
        trace!(path = %shared.path, count, "members condition not yet satisfied");
        tokio::select! {
            _ = shared.done.cancelled() => return,
            event = handle.recv() => match event {
                Err(err) => {
                    warn!(path = %shared.path, error = %err, "members watch source dropped");
                    shared.fail(&err);
                    return;
                }
                Ok(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_equality() {
        let predicate = MembersPredicate::exactly(3);
        assert!(predicate.is_satisfied(3));
        assert!(!predicate.is_satisfied(2));
        assert!(!predicate.is_satisfied(4));
    }

    #[test]
    fn test_predicate_half_open_range() {
        let predicate = MembersPredicate::between(2, 5);
        assert!(!predicate.is_satisfied(1));
        assert!(predicate.is_satisfied(2));
        assert!(predicate.is_satisfied(4));
        assert!(!predicate.is_satisfied(5));
    }

    #[test]
    fn test_predicate_complement() {
        let predicate = MembersPredicate {
            outside_range: true,
            ..MembersPredicate::between(2, 5)
        };
        assert!(predicate.is_satisfied(1));
        assert!(!predicate.is_satisfied(3));
        assert!(predicate.is_satisfied(5));
    }

    #[test]
    fn test_predicate_open_bounds() {
        let at_least_two = MembersPredicate {
            min: Some(2),
            max: None,
            equals: None,
            outside_range: false,
        };
        assert!(!at_least_two.is_satisfied(1));
        assert!(at_least_two.is_satisfied(100));
    }

    #[test]
    fn test_unbounded_predicate_rejected() {
        let empty = MembersPredicate {
            min: None,
            max: None,
            equals: None,
            outside_range: false,
        };
        assert!(empty.validate().is_err());
    }
}
