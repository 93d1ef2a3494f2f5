//! Adapter making a task runtime schedulable as a DAG node.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;

use super::runtime::TaskRuntime;
use crate::dag::Runnable;

/// Wraps an `Arc<TaskRuntime>` as a [`Runnable`] so the dependency scheduler
/// can sequence task runtimes directly.
pub struct TaskUnit {
    runtime: Arc<TaskRuntime>,
}

impl TaskUnit {
    pub fn new(runtime: Arc<TaskRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<TaskRuntime> {
        &self.runtime
    }
}

#[async_trait]
impl Runnable for TaskUnit {
    fn name(&self) -> String {
        self.runtime.spec().id.clone()
    }

    async fn execute(&self) -> anyhow::Result<()> {
        match self.runtime.start().await? {
            Some(completion) => {
                let outcome = completion
                    .await
                    .map_err(|_| anyhow!("task completion channel dropped"))?;
                outcome.map_err(Into::into)
            }
            // pure trigger/no-op task: firing the trigger is the work
            None => Ok(()),
        }
    }

    async fn finish(&self) -> anyhow::Result<()> {
        self.runtime.stop().await.map_err(Into::into)
    }
}
