//! Polling of remote asynchronous tasks.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ControlConfig;
use crate::error::{CpiError, Result};
use crate::model::{Document, Task, TaskStatus};

/// Fresh copies of tasks and entities; implemented by the protocol client.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn reload_task(&self, task: &Task) -> Result<Task>;

    async fn reload_entity(&self, entity: &Document) -> Result<Document>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWaiter {
    pub wait_max: Duration,
    pub wait_delay: Duration,
    pub old_task_threshold: Duration,
}

impl TaskWaiter {
    pub fn from_control(control: &ControlConfig) -> Self {
        Self {
            wait_max: control.wait_max(),
            wait_delay: control.wait_delay(),
            old_task_threshold: control.old_task_threshold(),
        }
    }

    async fn pause(&self, operation: &str, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(CpiError::Cancelled {
                operation: operation.to_string(),
            }),
            _ = tokio::time::sleep(self.wait_delay) => Ok(()),
        }
    }

    /// Reloads `task` every `wait_delay` until it reaches a terminal status.
    pub async fn wait_task(
        &self,
        source: &dyn TaskSource,
        task: Task,
        accept_failure: bool,
        cancel: &CancellationToken,
    ) -> Result<Task> {
        let operation = format!("task {}", task.ident());
        let start = Instant::now();
        let mut task = task;

        loop {
            match task.status {
                TaskStatus::Success => {
                    tracing::debug!("{} ({}) succeeded", operation, task.operation);
                    return Ok(task);
                }
                status if status.is_failure() => {
                    if accept_failure {
                        tracing::warn!(
                            "{} ({}) ended with {}, accepted by caller",
                            operation,
                            task.operation,
                            status
                        );
                        return Ok(task);
                    }
                    tracing::error!("{} ({}) ended with {}", operation, task.operation, status);
                    return Err(CpiError::TaskFailure(task.failure_info()));
                }
                status => {
                    if start.elapsed() >= self.wait_max {
                        tracing::error!(
                            "{} still {} after {:?}",
                            operation,
                            status,
                            self.wait_max
                        );
                        return Err(CpiError::Timeout {
                            operation,
                            waited: self.wait_max,
                        });
                    }
                    tracing::debug!(
                        "{} is {}, polling again in {:?}",
                        operation,
                        status,
                        self.wait_delay
                    );
                }
            }

            self.pause(&operation, cancel).await?;
            task = source.reload_task(&task).await?;
        }
    }

    /// Waits for the entity's queued work, then checks its task history.
    ///
    /// Pre-running tasks are awaited first, then running ones. Afterwards
    /// every non-successful task younger than `old_task_threshold` counts as
    /// a live failure.
    pub async fn wait_entity(
        &self,
        source: &dyn TaskSource,
        entity: &Document,
        accept_failure: bool,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        let tasks = entity.tasks()?;
        for phase in [TaskStatus::PreRunning, TaskStatus::Running] {
            for task in tasks.iter().filter(|t| t.status == phase) {
                tracing::debug!(
                    "Waiting for {} task {} on {}",
                    phase,
                    task.ident(),
                    entity.label()
                );
                self.wait_task(source, task.clone(), accept_failure, cancel)
                    .await?;
            }
        }

        let entity = source.reload_entity(entity).await?;
        let threshold = chrono::Duration::from_std(self.old_task_threshold)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let now = Utc::now();

        let mut failures = Vec::new();
        for task in entity.tasks()? {
            if task.status == TaskStatus::Success {
                continue;
            }
            if task.is_older_than(threshold, now) {
                tracing::debug!(
                    "Ignoring stale {} task {} on {}",
                    task.status,
                    task.ident(),
                    entity.label()
                );
                continue;
            }
            failures.push(task.failure_info());
        }

        if failures.is_empty() {
            return Ok(entity);
        }
        if accept_failure {
            tracing::warn!(
                "{} has {} failed task(s), accepted by caller",
                entity.label(),
                failures.len()
            );
            return Ok(entity);
        }
        for failure in &failures {
            tracing::error!("{}: {}", entity.label(), failure);
        }
        Err(CpiError::EntityTaskFailure {
            entity: entity.label(),
            failures,
        })
    }

    /// Calls `block` every `wait_delay` until it breaks or `wait_max` elapses.
    ///
    /// Returns `Some` with the break value, `None` on a silent timeout.
    pub async fn timed_loop<F, Fut, T>(
        &self,
        operation: &str,
        raise_on_timeout: bool,
        cancel: &CancellationToken,
        mut block: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ControlFlow<T>>>,
    {
        let start = Instant::now();
        loop {
            if let ControlFlow::Break(value) = block().await? {
                return Ok(Some(value));
            }
            if start.elapsed() >= self.wait_max {
                if raise_on_timeout {
                    return Err(CpiError::Timeout {
                        operation: operation.to_string(),
                        waited: self.wait_max,
                    });
                }
                tracing::debug!("{} gave up after {:?}", operation, self.wait_max);
                return Ok(None);
            }
            self.pause(operation, cancel).await?;
        }
    }
}
