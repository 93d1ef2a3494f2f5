//! Dependency-graph scheduling.

pub mod scheduler;

pub use scheduler::{DependencyScheduler, GraphNode, NodeOutcome, NodeReport, RunReport, Runnable};
