//! The live, stateful execution of a task descriptor.
//!
//! A runtime moves Created → Running (streams forwarding) → optionally
//! blocked on its trigger → executing → Done. Completion recording is
//! at-most-once: the first `success`/`error` claims the terminal transition
//! under the runtime's one mutex, and every externally visible operation
//! afterwards is a no-op returning `Stopped` (except `stop`, which is
//! idempotent).

use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::process;
use super::spec::{TaskSpec, TaskStat, TaskValue};
use crate::bus::MessageBus;
use crate::core::config::TaskOptions;
use crate::core::errors::{DroverError, Result};
use crate::store::{self, CoordinationStore};
use crate::watch::ConditionSet;

/// Message carried on a stream channel; `None` is the sentinel terminating
/// the forwarding loop.
pub(crate) type StreamMessage = Option<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Created,
    Running,
    Completing,
    Done,
}

#[derive(Debug)]
struct RuntimeState {
    phase: Phase,
    streams_started: bool,
    last_error: Option<String>,
}

#[derive(Debug)]
struct StreamChannel {
    topic: String,
    tx: mpsc::Sender<StreamMessage>,
    rx: Mutex<Option<mpsc::Receiver<StreamMessage>>>,
}

impl StreamChannel {
    fn new(topic: String, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            topic,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("spec", &self.spec)
            .field("stat", &self.stat)
            .field("options", &self.options)
            .field("state", &self.state)
            .field("status", &self.status)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .finish_non_exhaustive()
    }
}

/// One task's runtime: descriptor, live channels, flags, and the mutex
/// guarding them
pub struct TaskRuntime {
    spec: TaskSpec,
    stat: Mutex<TaskStat>,
    store: Arc<dyn CoordinationStore>,
    bus: Arc<dyn MessageBus>,
    options: TaskOptions,
    state: Mutex<RuntimeState>,
    status: StreamChannel,
    stdout: Option<StreamChannel>,
    stderr: Option<StreamChannel>,
}

impl TaskRuntime {
    /// Validate the descriptor, stamp `stat.started`, persist descriptor and
    /// stat, and allocate the stream channels for the configured topics.
    ///
    /// Fails with `Configuration` on invalid input before any side effect.
    pub async fn init(
        store: Arc<dyn CoordinationStore>,
        bus: Arc<dyn MessageBus>,
        mut spec: TaskSpec,
        options: Option<TaskOptions>,
    ) -> Result<Arc<TaskRuntime>> {
        let options = options.unwrap_or_default();
        options.validate()?;
        spec.validate()?;
        if let Some(exec) = &spec.exec {
            which::which(&exec.path).map_err(|_| {
                DroverError::configuration_field(
                    format!("command '{}' not found", exec.path),
                    "exec.path",
                )
            })?;
        }

        spec.stat.started = Some(Utc::now());
        let stat = spec.stat;

        let descriptor = serde_json::to_vec(&spec)?;
        store::put(store.as_ref(), &spec.namespace, &descriptor).await?;
        let info = serde_json::to_vec(&stat)?;
        store::put(store.as_ref(), &store::join(&spec.namespace, "info"), &info).await?;

        let status = StreamChannel::new(spec.status_topic.clone(), options.channel_capacity);
        let stdout = spec
            .stdout_topic
            .clone()
            .map(|topic| StreamChannel::new(topic, options.channel_capacity));
        let stderr = spec
            .stderr_topic
            .clone()
            .map(|topic| StreamChannel::new(topic, options.channel_capacity));

        info!(task = %spec.id, namespace = %spec.namespace, "task runtime initialized");
        Ok(Arc::new(TaskRuntime {
            spec,
            stat: Mutex::new(stat),
            store,
            bus,
            options,
            state: Mutex::new(RuntimeState {
                phase: Phase::Created,
                streams_started: false,
                last_error: None,
            }),
            status,
            stdout,
            stderr,
        }))
    }

    /// Spawn one forwarding loop per configured channel. Idempotent;
    /// returns `Stopped` once the runtime is terminal.
    pub fn start_streams(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.phase >= Phase::Completing {
                return Err(DroverError::Stopped);
            }
            if state.streams_started {
                return Ok(());
            }
            state.streams_started = true;
            state.phase = Phase::Running;
        }
        for channel in self.channels() {
            let receiver = channel
                .rx
                .lock()
                .expect("stream receiver poisoned")
                .take();
            if let Some(receiver) = receiver {
                tokio::spawn(forward_stream(
                    Arc::clone(&self.bus),
                    channel.topic.clone(),
                    receiver,
                ));
            }
        }
        debug!(task = %self.spec.id, "stream forwarders started");
        Ok(())
    }

    /// Start the task: begin streaming, block on the trigger if one is
    /// configured, then fork the subprocess if one is configured.
    ///
    /// A trigger Timeout surfaces verbatim and execution never begins. With
    /// an exec the returned receiver resolves once the process outcome has
    /// been recorded; without one the task is a pure trigger/no-op and
    /// `None` is returned immediately.
    #[instrument(skip(self), fields(task = %self.spec.id))]
    pub async fn start(self: &Arc<Self>) -> Result<Option<oneshot::Receiver<Result<()>>>> {
        self.start_streams()?;

        if let Some(trigger) = &self.spec.trigger {
            let _ = self.log(format!("task {} waiting on trigger", self.spec.id)).await;
            let mut conditions = ConditionSet::arm(&self.store, trigger).await?;
            let waited = conditions.wait().await;
            conditions.cancel();
            waited?;
            {
                let mut stat = self.lock_stat();
                stat.triggered = Some(Utc::now());
            }
            self.persist_stat().await?;
            let _ = self.log(format!("task {} triggered", self.spec.id)).await;
        }

        match &self.spec.exec {
            Some(exec) => {
                let (done_tx, done_rx) = oneshot::channel();
                tokio::spawn(process::run_command(
                    Arc::clone(self),
                    exec.clone(),
                    done_tx,
                ));
                Ok(Some(done_rx))
            }
            None => Ok(None),
        }
    }

    /// Append a line to the status stream; `Stopped` once terminal
    pub async fn log(&self, line: impl AsRef<[u8]>) -> Result<()> {
        if self.lock_state().phase >= Phase::Completing {
            return Err(DroverError::Stopped);
        }
        self.status
            .tx
            .send(Some(line.as_ref().to_vec()))
            .await
            .map_err(|_| DroverError::channel("status", "status channel closed"))
    }

    /// Record a successful outcome and stop. At most one of
    /// `success`/`error` ever takes effect.
    pub async fn success(&self, value: TaskValue) -> Result<()> {
        self.record(false, value).await
    }

    /// Record a failed outcome and stop
    pub async fn error(&self, value: TaskValue) -> Result<()> {
        self.record(true, value).await
    }

    async fn record(&self, failed: bool, value: TaskValue) -> Result<()> {
        let bytes = value.into_bytes()?;
        {
            let mut state = self.lock_state();
            if state.phase >= Phase::Completing {
                return Err(DroverError::Stopped);
            }
            state.phase = Phase::Completing;
            if failed {
                state.last_error = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
        }

        let outcome_path = if failed {
            &self.spec.error_path
        } else {
            &self.spec.success_path
        };
        {
            let mut stat = self.lock_stat();
            let now = Some(Utc::now());
            if failed {
                stat.error = now;
            } else {
                stat.success = now;
            }
        }

        // record in the store before stopping; if the store is unreachable
        // the runtime still stops but cannot durably record completion
        let mut recorded = store::put(self.store.as_ref(), outcome_path, &bytes)
            .await
            .map(|_| ());
        if recorded.is_ok() {
            if let Some(output_path) = &self.spec.output_path {
                recorded = store::put(self.store.as_ref(), output_path, &bytes)
                    .await
                    .map(|_| ());
            }
        }
        if recorded.is_ok() {
            recorded = self.persist_stat().await;
        }
        if let Err(err) = &recorded {
            warn!(task = %self.spec.id, error = %err, "failed to record terminal outcome");
        } else {
            info!(task = %self.spec.id, failed, "task outcome recorded");
        }

        let stopped = self.stop().await;
        recorded?;
        stopped
    }

    /// Send the stream sentinels and flip the runtime to Done. Idempotent;
    /// only the first call has effect.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.phase == Phase::Done {
                return Ok(());
            }
            state.phase = Phase::Done;
        }
        for channel in self.channels() {
            let _ = channel.tx.send(None).await;
        }
        debug!(task = %self.spec.id, "task runtime stopped");
        Ok(())
    }

    /// True once the stream forwarders are up
    pub fn ready(&self) -> bool {
        let state = self.lock_state();
        state.streams_started && state.phase < Phase::Completing
    }

    /// True between start_streams and terminal completion
    pub fn running(&self) -> bool {
        let state = self.lock_state();
        state.phase == Phase::Running
    }

    /// True once completion has been recorded or the runtime stopped
    pub fn done(&self) -> bool {
        self.lock_state().phase == Phase::Done
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn stat(&self) -> TaskStat {
        *self.lock_stat()
    }

    async fn persist_stat(&self) -> Result<()> {
        let stat = self.stat();
        let info = serde_json::to_vec(&stat)?;
        store::put(
            self.store.as_ref(),
            &store::join(&self.spec.namespace, "info"),
            &info,
        )
        .await
        .map(|_| ())
    }

    fn channels(&self) -> impl Iterator<Item = &StreamChannel> {
        std::iter::once(&self.status)
            .chain(self.stdout.iter())
            .chain(self.stderr.iter())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().expect("runtime state poisoned")
    }

    fn lock_stat(&self) -> std::sync::MutexGuard<'_, TaskStat> {
        self.stat.lock().expect("runtime stat poisoned")
    }

    pub(crate) fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub(crate) fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub(crate) fn stdout_sender(&self) -> Option<mpsc::Sender<StreamMessage>> {
        self.stdout.as_ref().map(|channel| channel.tx.clone())
    }

    pub(crate) fn stderr_sender(&self) -> Option<mpsc::Sender<StreamMessage>> {
        self.stderr.as_ref().map(|channel| channel.tx.clone())
    }
}

/// Drain one stream channel into its pub/sub topic until the `None`
/// sentinel (or a dropped sender) ends the loop.
async fn forward_stream(
    bus: Arc<dyn MessageBus>,
    topic: String,
    mut rx: mpsc::Receiver<StreamMessage>,
) {
    while let Some(message) = rx.recv().await {
        let Some(payload) = message else { break };
        if let Err(err) = bus.publish(&topic, &payload).await {
            warn!(topic = %topic, error = %err, "dropping stream message after publish failure");
        }
    }
    debug!(topic = %topic, "stream forwarder finished");
}
