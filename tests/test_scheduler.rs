//! Test suite for dependency-graph scheduling

use anyhow::bail;
use async_trait::async_trait;
use drover::bus::{MemoryBus, MessageBus};
use drover::core::config::SchedulerConfig;
use drover::dag::{DependencyScheduler, GraphNode, NodeOutcome, Runnable};
use drover::store::{CoordinationStore, MemoryStore};
use drover::task::{TaskRuntime, TaskSpec, TaskUnit};
use drover::DroverError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Test runnable that records its execution into a shared log
struct Recorder {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    fail: bool,
    delay: Duration,
}

impl Recorder {
    fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
            fail: false,
            delay: Duration::from_millis(10),
        })
    }

    fn failing(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
            fail: true,
            delay: Duration::from_millis(10),
        })
    }

    fn slow(name: &str, log: &Arc<Mutex<Vec<String>>>, delay: Duration) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
            fail: false,
            delay,
        })
    }
}

#[async_trait]
impl Runnable for Recorder {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn execute(&self) -> anyhow::Result<()> {
        sleep(self.delay).await;
        self.log.lock().unwrap().push(self.name.clone());
        if self.fail {
            bail!("{} exploded", self.name);
        }
        Ok(())
    }
}

/// Test runnable that records which phases ran
struct Phased {
    name: String,
    phases: Arc<Mutex<Vec<&'static str>>>,
    fail_execute: bool,
}

#[async_trait]
impl Runnable for Phased {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        self.phases.lock().unwrap().push("prepare");
        Ok(())
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.phases.lock().unwrap().push("execute");
        if self.fail_execute {
            bail!("execute blew up");
        }
        Ok(())
    }

    async fn finish(&self) -> anyhow::Result<()> {
        self.phases.lock().unwrap().push("finish");
        Ok(())
    }
}

#[tokio::test]
async fn test_diamond_runs_shared_dependency_once_and_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let c = GraphNode::new(Recorder::new("c", &log), vec![]);
    let a = GraphNode::new(Recorder::new("a", &log), vec![Arc::clone(&c)]);
    let b = GraphNode::new(Recorder::new("b", &log), vec![Arc::clone(&c)]);
    let x = GraphNode::new(
        Recorder::new("x", &log),
        vec![Arc::clone(&a), Arc::clone(&b)],
    );

    let outcome = Arc::clone(&x).run().await;
    assert_eq!(outcome, NodeOutcome::Succeeded);

    let order = log.lock().unwrap().clone();
    assert_eq!(order.len(), 4, "shared dependency must run exactly once");
    assert_eq!(order.first().map(String::as_str), Some("c"));
    assert_eq!(order.last().map(String::as_str), Some("x"));
    assert!(order.contains(&"a".to_string()));
    assert!(order.contains(&"b".to_string()));
}

#[tokio::test]
async fn test_failed_dependency_skips_dependents() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let c = GraphNode::new(Recorder::failing("c", &log), vec![]);
    let a = GraphNode::new(Recorder::new("a", &log), vec![Arc::clone(&c)]);
    let b = GraphNode::new(Recorder::new("b", &log), vec![Arc::clone(&c)]);
    let x = GraphNode::new(
        Recorder::new("x", &log),
        vec![Arc::clone(&a), Arc::clone(&b)],
    );

    let outcome = Arc::clone(&x).run().await;
    assert_eq!(outcome, NodeOutcome::Skipped);
    assert_eq!(c.outcome(), Some(NodeOutcome::Failed));
    assert_eq!(a.outcome(), Some(NodeOutcome::Skipped));
    assert_eq!(b.outcome(), Some(NodeOutcome::Skipped));

    // only the failing node's body ever ran
    assert_eq!(log.lock().unwrap().clone(), vec!["c".to_string()]);

    // accumulated errors stay inspectable
    assert!(c.errors().iter().any(|e| e.contains("exploded")));
    assert!(x.errors().iter().any(|e| e.contains("dependencies failed")));
}

#[tokio::test]
async fn test_launched_siblings_run_to_completion_after_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let fast_fail = GraphNode::new(Recorder::failing("fast-fail", &log), vec![]);
    let slow_ok = GraphNode::new(
        Recorder::slow("slow-ok", &log, Duration::from_millis(150)),
        vec![],
    );
    let parent = GraphNode::new(
        Recorder::new("parent", &log),
        vec![Arc::clone(&fast_fail), Arc::clone(&slow_ok)],
    );

    let outcome = Arc::clone(&parent).run().await;
    assert_eq!(outcome, NodeOutcome::Skipped);

    // the slow sibling was not cancelled by the early failure
    assert_eq!(slow_ok.outcome(), Some(NodeOutcome::Succeeded));
    assert!(log.lock().unwrap().contains(&"slow-ok".to_string()));
}

#[tokio::test]
async fn test_phases_run_in_sequence_and_abort_on_failure() {
    let phases = Arc::new(Mutex::new(Vec::new()));
    let ok = GraphNode::new(
        Arc::new(Phased {
            name: "ok".into(),
            phases: Arc::clone(&phases),
            fail_execute: false,
        }),
        vec![],
    );
    assert_eq!(Arc::clone(&ok).run().await, NodeOutcome::Succeeded);
    assert_eq!(
        phases.lock().unwrap().clone(),
        vec!["prepare", "execute", "finish"]
    );

    let phases = Arc::new(Mutex::new(Vec::new()));
    let broken = GraphNode::new(
        Arc::new(Phased {
            name: "broken".into(),
            phases: Arc::clone(&phases),
            fail_execute: true,
        }),
        vec![],
    );
    assert_eq!(Arc::clone(&broken).run().await, NodeOutcome::Failed);
    // finish never runs after a failing execute
    assert_eq!(phases.lock().unwrap().clone(), vec!["prepare", "execute"]);
    assert!(broken.errors().iter().any(|e| e.contains("execute failed")));
}

#[tokio::test]
async fn test_scheduler_runs_graph_and_reports() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = DependencyScheduler::new(None).unwrap();
    scheduler.add(Recorder::new("fetch", &log), &[]).unwrap();
    scheduler
        .add(Recorder::new("build", &log), &["fetch"])
        .unwrap();
    scheduler
        .add(Recorder::new("test", &log), &["fetch"])
        .unwrap();
    scheduler
        .add(Recorder::new("deploy", &log), &["build", "test"])
        .unwrap();

    let report = scheduler.run().await.unwrap();
    assert!(report.success);
    assert!(!report.run_id.is_empty());
    assert_eq!(report.nodes.len(), 4);
    assert!(report
        .nodes
        .iter()
        .all(|node| node.outcome == NodeOutcome::Succeeded));

    let order = log.lock().unwrap().clone();
    assert_eq!(order.first().map(String::as_str), Some("fetch"));
    assert_eq!(order.last().map(String::as_str), Some("deploy"));
}

#[tokio::test]
async fn test_scheduler_reports_partial_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = DependencyScheduler::new(Some(SchedulerConfig { max_parallel: 2 })).unwrap();
    scheduler.add(Recorder::failing("fetch", &log), &[]).unwrap();
    scheduler
        .add(Recorder::new("build", &log), &["fetch"])
        .unwrap();
    scheduler
        .add(Recorder::new("deploy", &log), &["build"])
        .unwrap();

    let report = scheduler.run().await.unwrap();
    assert!(!report.success);

    let outcome = |name: &str| {
        report
            .nodes
            .iter()
            .find(|node| node.name == name)
            .unwrap()
            .outcome
    };
    assert_eq!(outcome("fetch"), NodeOutcome::Failed);
    assert_eq!(outcome("build"), NodeOutcome::Skipped);
    assert_eq!(outcome("deploy"), NodeOutcome::Skipped);
}

#[tokio::test]
async fn test_scheduler_rejects_cycle() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = DependencyScheduler::new(None).unwrap();
    scheduler.add(Recorder::new("a", &log), &["b"]).unwrap();
    scheduler.add(Recorder::new("b", &log), &["a"]).unwrap();

    let err = scheduler.run().await.unwrap_err();
    assert!(matches!(err, DroverError::Configuration { .. }));
}

#[tokio::test]
async fn test_scheduler_rejects_unknown_dependency() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = DependencyScheduler::new(None).unwrap();
    scheduler.add(Recorder::new("a", &log), &["ghost"]).unwrap();

    let err = scheduler.run().await.unwrap_err();
    assert!(matches!(err, DroverError::Configuration { .. }));
}

#[tokio::test]
async fn test_scheduler_rejects_duplicate_names() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = DependencyScheduler::new(None).unwrap();
    scheduler.add(Recorder::new("a", &log), &[]).unwrap();

    let err = scheduler.add(Recorder::new("a", &log), &[]).unwrap_err();
    assert!(matches!(err, DroverError::Configuration { .. }));
}

#[tokio::test]
async fn test_task_units_sequence_through_scheduler() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::default());

    let spec = |id: &str| TaskSpec {
        id: id.to_string(),
        namespace: format!("/units/{}", id),
        success_path: format!("/units/{}/success", id),
        error_path: format!("/units/{}/error", id),
        status_topic: format!("mem://local/units/{}/status", id),
        ..Default::default()
    };

    let first = TaskRuntime::init(Arc::clone(&store), Arc::clone(&bus), spec("first"), None)
        .await
        .unwrap();
    let second = TaskRuntime::init(Arc::clone(&store), Arc::clone(&bus), spec("second"), None)
        .await
        .unwrap();

    let mut scheduler = DependencyScheduler::new(None).unwrap();
    scheduler
        .add(Arc::new(TaskUnit::new(Arc::clone(&first))), &[])
        .unwrap();
    scheduler
        .add(Arc::new(TaskUnit::new(Arc::clone(&second))), &["first"])
        .unwrap();

    let report = scheduler.run().await.unwrap();
    assert!(report.success);
    // finish stopped both runtimes
    assert!(first.done());
    assert!(second.done());
}
