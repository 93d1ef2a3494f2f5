//! Subprocess execution for tasks with an `exec` block.
//!
//! stdout/stderr are pumped in chunks both onto the runtime's stream
//! channels and into capture buffers; stdin, when a topic is configured, is
//! fed from a bus subscription until the EOT sentinel closes it. Exactly one
//! of `success`/`error` is invoked based on exit status, and this module
//! never panics on a misbehaving process.

use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::runtime::{StreamMessage, TaskRuntime};
use super::spec::{ExecSpec, TaskValue};
use crate::bus::Subscription;
use crate::core::errors::{DroverError, Result};

/// A pub/sub topic has no natural end-of-stream, so this one-byte EOT
/// message closes the process's stdin.
pub const STDIN_CLOSE: &[u8] = &[0x04];

/// Supervise one subprocess to completion and record its outcome through the
/// runtime. The completion signal resolves once recording has finished.
pub(crate) async fn run_command(
    runtime: Arc<TaskRuntime>,
    exec: ExecSpec,
    done: oneshot::Sender<Result<()>>,
) {
    match execute(&runtime, &exec).await {
        Ok(captured_stdout) => {
            let recorded = runtime.success(TaskValue::Bytes(captured_stdout)).await;
            let _ = done.send(recorded);
        }
        Err(err) => {
            if let Err(record_err) = runtime.error(TaskValue::Text(err.to_string())).await {
                warn!(task = %runtime.spec().id, error = %record_err, "failed to record exec error");
            }
            let _ = done.send(Err(err));
        }
    }
}

async fn execute(runtime: &Arc<TaskRuntime>, exec: &ExecSpec) -> Result<Vec<u8>> {
    let mut command = Command::new(&exec.path);
    command
        .args(&exec.args)
        .envs(&exec.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if runtime.spec().stdin_topic.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    if let Some(dir) = &exec.dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|err| {
        DroverError::exec_failed(format!("failed to spawn '{}': {}", exec.path, err), None)
    })?;
    debug!(task = %runtime.spec().id, command = %exec.path, "subprocess spawned");

    let buffer_size = runtime.options().read_buffer_size;
    let stdout = child.stdout.take().ok_or_else(|| {
        DroverError::command_unknown(format!("'{}' spawned without stdout pipe", exec.path))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        DroverError::command_unknown(format!("'{}' spawned without stderr pipe", exec.path))
    })?;
    let stdout_pump = tokio::spawn(pump_output(stdout, runtime.stdout_sender(), buffer_size));
    let stderr_pump = tokio::spawn(pump_output(stderr, runtime.stderr_sender(), buffer_size));

    if let Some(topic) = &runtime.spec().stdin_topic {
        let stdin = child.stdin.take().ok_or_else(|| {
            DroverError::command_unknown(format!("'{}' spawned without stdin pipe", exec.path))
        })?;
        let subscription = runtime.bus().subscribe(topic).await?;
        tokio::spawn(pump_stdin(subscription, stdin));
    }

    let status = child
        .wait()
        .await
        .map_err(|err| DroverError::command_unknown(err.to_string()))?;
    let captured_stdout = stdout_pump.await.unwrap_or_default();
    let captured_stderr = stderr_pump.await.unwrap_or_default();

    if status.success() {
        return Ok(captured_stdout);
    }
    match status.code() {
        Some(code) => {
            let detail = String::from_utf8_lossy(&captured_stderr);
            let detail = detail.trim();
            let message = if detail.is_empty() {
                format!("'{}' exited with code {}", exec.path, code)
            } else {
                format!("'{}' exited with code {}: {}", exec.path, code, detail)
            };
            Err(DroverError::exec_failed(message, Some(code)))
        }
        // killed by signal or otherwise reaped without a code
        None => Err(DroverError::command_unknown(format!(
            "'{}' terminated without an exit code",
            exec.path
        ))),
    }
}

/// Read one output pipe to EOF, forwarding each chunk to the stream channel
/// (when the topic is configured) and into the capture buffer.
async fn pump_output(
    mut source: impl AsyncRead + Unpin,
    sink: Option<mpsc::Sender<StreamMessage>>,
    buffer_size: usize,
) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buffer = vec![0u8; buffer_size];
    loop {
        match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => {
                captured.extend_from_slice(&buffer[..read]);
                if let Some(sink) = &sink {
                    let _ = sink.send(Some(buffer[..read].to_vec())).await;
                }
            }
            Err(err) => {
                warn!(error = %err, "output pump read failed");
                break;
            }
        }
    }
    captured
}

/// Forward inbound bus messages to the process's stdin until the sentinel
/// (or a closed topic) ends the stream. Dropping the handle closes the pipe.
async fn pump_stdin(mut subscription: Subscription, mut stdin: ChildStdin) {
    while let Some(message) = subscription.recv().await {
        if message.as_slice() == STDIN_CLOSE {
            break;
        }
        if let Err(err) = stdin.write_all(&message).await {
            warn!(error = %err, "stdin pump write failed");
            break;
        }
    }
    debug!("stdin pump finished");
}
