//! ANY/ALL combination of watches with a global deadline; the trigger
//! primitive gating task execution on fleet-wide state.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::primitive::{MembersPredicate, StateWatch, WatchKind, WatchReport};
use crate::core::errors::{DroverError, Result};
use crate::store::CoordinationStore;

/// Membership half of a trigger: a group path plus the count predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersSpec {
    pub path: String,
    #[serde(flatten)]
    pub predicate: MembersPredicate,
}

/// Serializable descriptor of a condition set: at most one path per watch
/// kind, ANY/ALL policy, and an optional global deadline in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<MembersSpec>,
    #[serde(default)]
    pub require_all: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TriggerSpec {
    pub fn watch_count(&self) -> usize {
        [
            self.created.is_some(),
            self.deleted.is_some(),
            self.changed.is_some(),
            self.members.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        for (kind, path) in [
            ("created", &self.created),
            ("deleted", &self.deleted),
            ("changed", &self.changed),
        ] {
            if let Some(path) = path {
                if path.trim().is_empty() {
                    return Err(DroverError::configuration_field(
                        format!("trigger {} path must not be empty", kind),
                        kind,
                    ));
                }
            }
        }
        if let Some(members) = &self.members {
            if members.path.trim().is_empty() {
                return Err(DroverError::configuration_field(
                    "trigger members path must not be empty",
                    "members",
                ));
            }
            members.predicate.validate()?;
        }
        Ok(())
    }
}

/// A set of armed watches reporting into one bounded channel.
///
/// `wait` resolves with success once the ANY/ALL policy is satisfied, or with
/// Timeout when the global deadline elapses first, and never success afterwards.
/// On an early ANY success the remaining watches stay armed; [`cancel`] is
/// the explicit cleanup.
///
/// [`cancel`]: ConditionSet::cancel
#[derive(Debug)]
pub struct ConditionSet {
    watches: Vec<StateWatch>,
    require_all: bool,
    timeout: Option<Duration>,
    reports: mpsc::Receiver<WatchReport>,
    finished: bool,
}

impl ConditionSet {
    /// Instantiate one watch per present spec entry, all reporting to a
    /// shared channel sized to the watch count. Arming failures cancel any
    /// watches armed earlier in the same call.
    pub async fn arm(store: &Arc<dyn CoordinationStore>, spec: &TriggerSpec) -> Result<ConditionSet> {
        spec.validate()?;
        let (tx, rx) = mpsc::channel(spec.watch_count().max(1));
        let mut watches: Vec<StateWatch> = Vec::with_capacity(spec.watch_count());

        if let Some(path) = &spec.created {
            let watch = StateWatch::created(Arc::clone(store), path.clone())
                .await
                .map_err(|err| cancel_armed(&watches, err))?;
            watch.notify_group(tx.clone());
            watches.push(watch);
        }
        if let Some(path) = &spec.deleted {
            let watch = StateWatch::deleted(Arc::clone(store), path.clone())
                .await
                .map_err(|err| cancel_armed(&watches, err))?;
            watch.notify_group(tx.clone());
            watches.push(watch);
        }
        if let Some(path) = &spec.changed {
            let watch = StateWatch::changed(Arc::clone(store), path.clone())
                .await
                .map_err(|err| cancel_armed(&watches, err))?;
            watch.notify_group(tx.clone());
            watches.push(watch);
        }
        if let Some(members) = &spec.members {
            let watch = StateWatch::members(
                Arc::clone(store),
                members.path.clone(),
                members.predicate,
            )
            .await
            .map_err(|err| cancel_armed(&watches, err))?;
            watch.notify_group(tx.clone());
            watches.push(watch);
        }

        Ok(ConditionSet {
            watches,
            require_all: spec.require_all,
            timeout: spec.timeout(),
            reports: rx,
            finished: false,
        })
    }

    /// Number of armed watches
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Block until the policy is satisfied or the deadline elapses
    #[instrument(skip(self), fields(watches = self.watches.len(), all = self.require_all))]
    pub async fn wait(&mut self) -> Result<()> {
        if self.finished {
            return Err(DroverError::Stopped);
        }
        let mut pending: HashSet<WatchKind> =
            self.watches.iter().map(|watch| watch.kind()).collect();
        if pending.is_empty() {
            self.finished = true;
            return Ok(());
        }
        let deadline = self
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let report = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.reports.recv()).await {
                        Ok(report) => report,
                        Err(_) => {
                            self.finished = true;
                            self.cancel();
                            let timeout_ms = self
                                .timeout
                                .map(|timeout| timeout.as_millis() as u64)
                                .unwrap_or_default();
                            return Err(DroverError::timeout("condition set", timeout_ms));
                        }
                    }
                }
                None => self.reports.recv().await,
            };
            let Some(report) = report else {
                self.finished = true;
                return Err(DroverError::channel(
                    "condition set",
                    "all watch reporters gone before completion",
                ));
            };
            match report.result {
                Ok(_) => {
                    debug!(kind = ?report.kind, path = %report.path, "watch fired");
                    pending.remove(&report.kind);
                    if !self.require_all || pending.is_empty() {
                        self.finished = true;
                        return Ok(());
                    }
                }
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            }
        }
    }

    /// Cancel every armed watch. Watches that already fired are unaffected.
    pub fn cancel(&self) {
        for watch in &self.watches {
            watch.cancel();
        }
    }
}

fn cancel_armed(watches: &[StateWatch], err: DroverError) -> DroverError {
    for watch in watches {
        watch.cancel();
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_count() {
        let spec = TriggerSpec {
            created: Some("/a".into()),
            members: Some(MembersSpec {
                path: "/group".into(),
                predicate: MembersPredicate::exactly(1),
            }),
            ..Default::default()
        };
        assert_eq!(spec.watch_count(), 2);
        assert_eq!(TriggerSpec::default().watch_count(), 0);
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        let spec = TriggerSpec {
            created: Some("  ".into()),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_round_trips_through_json() {
        let spec = TriggerSpec {
            deleted: Some("/locks/{{unit}}".into()),
            members: Some(MembersSpec {
                path: "/groups/{{group}}".into(),
                predicate: MembersPredicate::exactly(3),
            }),
            require_all: true,
            timeout_ms: Some(300_000),
            ..Default::default()
        };
        let raw = serde_json::to_string(&spec).unwrap();
        let reparsed: TriggerSpec = serde_json::from_str(&raw).unwrap();
        assert_eq!(spec, reparsed);
    }
}
