// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

// Consumed service contracts with in-process reference implementations
pub mod bus; // pub/sub message bus
pub mod store; // hierarchical coordination store

// Execution building blocks
pub mod dag; // dependency-graph scheduling
pub mod task; // task descriptors and the trigger-gated runtime
pub mod watch; // one-shot watches and trigger condition sets

// Re-exports for convenience
pub use crate::core::config::{SchedulerConfig, TaskOptions};
pub use crate::core::errors::{DroverError, Result};

pub use crate::bus::{MemoryBus, MessageBus, Subscription, Topic};
pub use crate::dag::{DependencyScheduler, GraphNode, NodeOutcome, RunReport, Runnable};
pub use crate::store::{CoordinationStore, MemoryStore, NodeView, StoreEvent};
pub use crate::task::{ExecSpec, TaskRuntime, TaskSpec, TaskStat, TaskUnit, TaskValue};
pub use crate::watch::{ConditionSet, MembersPredicate, MembersSpec, StateWatch, TriggerSpec, WatchKind};
