//! Dependency-graph execution of Runnable units.
//!
//! A [`GraphNode`] runs its dependencies first, with one spawned task per
//! dependency, reporting completion-or-failure over two bounded channels,
//! and runs its own Prepare→Execute→Finish body only once every dependency
//! has resolved successfully. Siblings already launched always run to
//! completion; a failed dependency marks the node Skipped without running
//! its body. Shared nodes (diamonds) execute exactly once.
//!
//! [`DependencyScheduler`] adds name-keyed registration, petgraph cycle
//! validation, a parallelism cap, and a run report.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OnceCell, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::core::config::SchedulerConfig;
use crate::core::errors::{DroverError, Result};

/// A schedulable unit of work.
///
/// Phase bodies report failures as `anyhow` errors; the scheduler records
/// them against the owning node. `prepare` and `finish` default to no-ops.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    fn name(&self) -> String;

    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self) -> anyhow::Result<()>;

    async fn finish(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Terminal state of one node after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeOutcome {
    /// All three phases completed
    Succeeded,
    /// A phase of the node's own body failed
    Failed,
    /// A dependency failed; the body never ran
    Skipped,
}

/// One unit plus its direct dependencies
pub struct GraphNode {
    name: String,
    runnable: Arc<dyn Runnable>,
    dependencies: Vec<Arc<GraphNode>>,
    limiter: Option<Arc<Semaphore>>,
    outcome: OnceCell<NodeOutcome>,
    errors: Mutex<Vec<String>>,
}

impl GraphNode {
    /// Build a node named after its runnable
    pub fn new(runnable: Arc<dyn Runnable>, dependencies: Vec<Arc<GraphNode>>) -> Arc<GraphNode> {
        let name = runnable.name();
        Self::with_limiter(name, runnable, dependencies, None)
    }

    fn with_limiter(
        name: String,
        runnable: Arc<dyn Runnable>,
        dependencies: Vec<Arc<GraphNode>>,
        limiter: Option<Arc<Semaphore>>,
    ) -> Arc<GraphNode> {
        Arc::new(GraphNode {
            name,
            runnable,
            dependencies,
            limiter,
            outcome: OnceCell::new(),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Terminal state, once the node has been run
    pub fn outcome(&self) -> Option<NodeOutcome> {
        self.outcome.get().copied()
    }

    /// Accumulated errors; inspectable after `run` returns
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("node errors poisoned").clone()
    }

    fn record_error(&self, message: String) {
        warn!(node = %self.name, %message, "node error");
        self.errors
            .lock()
            .expect("node errors poisoned")
            .push(message);
    }

    /// Run dependencies then the node body. Concurrent invocations of a
    /// shared node coalesce onto a single execution.
    pub fn run(self: Arc<Self>) -> BoxFuture<'static, NodeOutcome> {
        async move {
            let node = self;
            *node.outcome.get_or_init(|| node.run_inner()).await
        }
        .boxed()
    }

    async fn run_inner(&self) -> NodeOutcome {
        if !self.dependencies.is_empty() {
            let total = self.dependencies.len();
            let (done_tx, mut done_rx) = mpsc::channel::<String>(total);
            let (fail_tx, mut fail_rx) = mpsc::channel::<String>(total);
            for dependency in &self.dependencies {
                let dependency = Arc::clone(dependency);
                let done_tx = done_tx.clone();
                let fail_tx = fail_tx.clone();
                tokio::spawn(async move {
                    let name = dependency.name().to_string();
                    match dependency.run().await {
                        NodeOutcome::Succeeded => {
                            let _ = done_tx.send(name).await;
                        }
                        NodeOutcome::Failed | NodeOutcome::Skipped => {
                            let _ = fail_tx.send(name).await;
                        }
                    }
                });
            }
            drop(done_tx);
            drop(fail_tx);

            let mut remaining = total;
            let mut failed: Vec<String> = Vec::new();
            while remaining > 0 {
                tokio::select! {
                    Some(name) = done_rx.recv() => {
                        debug!(node = %self.name, dependency = %name, "dependency finished");
                        remaining -= 1;
                    }
                    Some(name) = fail_rx.recv() => {
                        remaining -= 1;
                        failed.push(name);
                    }
                    else => break,
                }
            }
            if !failed.is_empty() {
                failed.sort();
                self.record_error(format!("dependencies failed: {}", failed.join(", ")));
                return NodeOutcome::Skipped;
            }
        }

        let _permit = match &self.limiter {
            Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.record_error("scheduler closed before node could run".to_string());
                    return NodeOutcome::Failed;
                }
            },
            None => None,
        };

        debug!(node = %self.name, "running node body");
        if let Err(err) = self.runnable.prepare().await {
            self.record_error(format!("prepare failed: {:#}", err));
            return NodeOutcome::Failed;
        }
        if let Err(err) = self.runnable.execute().await {
            self.record_error(format!("execute failed: {:#}", err));
            return NodeOutcome::Failed;
        }
        if let Err(err) = self.runnable.finish().await {
            self.record_error(format!("finish failed: {:#}", err));
            return NodeOutcome::Failed;
        }
        NodeOutcome::Succeeded
    }
}

/// Per-node summary in a run report
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub outcome: NodeOutcome,
    pub errors: Vec<String>,
}

/// Summary of one scheduler run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub success: bool,
    pub nodes: Vec<NodeReport>,
}

struct NodeSpec {
    name: String,
    runnable: Arc<dyn Runnable>,
    dependencies: Vec<String>,
}

/// Name-keyed DAG builder and executor
pub struct DependencyScheduler {
    config: SchedulerConfig,
    specs: Vec<NodeSpec>,
}

impl DependencyScheduler {
    pub fn new(config: Option<SchedulerConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();
        config.validate()?;
        Ok(Self {
            config,
            specs: Vec::new(),
        })
    }

    /// Register a unit under its runnable's name, depending on previously or
    /// later registered names.
    pub fn add(&mut self, runnable: Arc<dyn Runnable>, dependencies: &[&str]) -> Result<()> {
        let name = runnable.name();
        if self.specs.iter().any(|spec| spec.name == name) {
            return Err(DroverError::configuration(format!(
                "node '{}' is already registered",
                name
            )));
        }
        self.specs.push(NodeSpec {
            name,
            runnable,
            dependencies: dependencies.iter().map(|dep| dep.to_string()).collect(),
        });
        Ok(())
    }

    /// Validate the graph, execute it, and summarize the outcome per node
    #[instrument(skip(self), fields(nodes = self.specs.len()))]
    pub async fn run(&self) -> Result<RunReport> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for (position, spec) in self.specs.iter().enumerate() {
            indices.insert(spec.name.as_str(), graph.add_node(position));
        }
        for spec in &self.specs {
            let target = indices[spec.name.as_str()];
            for dependency in &spec.dependencies {
                let source = *indices.get(dependency.as_str()).ok_or_else(|| {
                    DroverError::configuration(format!(
                        "node '{}' depends on unknown node '{}'",
                        spec.name, dependency
                    ))
                })?;
                graph.add_edge(source, target, ());
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(DroverError::configuration(
                "dependency graph contains a cycle",
            ));
        }

        // dependency-first construction: Topo yields every node after its
        // dependencies, so the Arc graph can be built in one pass
        let limiter = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut nodes: HashMap<String, Arc<GraphNode>> = HashMap::new();
        let mut topo = Topo::new(&graph);
        while let Some(index) = topo.next(&graph) {
            let spec = &self.specs[graph[index]];
            let dependencies = spec
                .dependencies
                .iter()
                .map(|dep| Arc::clone(&nodes[dep]))
                .collect();
            let node = GraphNode::with_limiter(
                spec.name.clone(),
                Arc::clone(&spec.runnable),
                dependencies,
                Some(Arc::clone(&limiter)),
            );
            nodes.insert(spec.name.clone(), node);
        }

        // launch only the sinks; everything else runs as a dependency
        let mut pending = FuturesUnordered::new();
        for index in graph.node_indices() {
            if graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .next()
                .is_none()
            {
                let name = &self.specs[graph[index]].name;
                pending.push(Arc::clone(&nodes[name]).run());
            }
        }
        while pending.next().await.is_some() {}

        let mut reports = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let node = &nodes[&spec.name];
            reports.push(NodeReport {
                name: spec.name.clone(),
                outcome: node.outcome().unwrap_or(NodeOutcome::Skipped),
                errors: node.errors(),
            });
        }
        let success = reports
            .iter()
            .all(|report| report.outcome == NodeOutcome::Succeeded);
        let report = RunReport {
            run_id: cuid2::create_id(),
            success,
            nodes: reports,
        };
        info!(run_id = %report.run_id, success, "scheduler run finished");
        Ok(report)
    }
}
