//! Structured concurrency with per-task captured logs.
//!
//! A `TaskGroup` runs futures on a tokio `JoinSet`. The first failing task
//! cancels the group's token so that siblings can stop at their next
//! suspension point. Every task's log events are buffered: a successful
//! task's buffer is flushed as soon as it completes, while failed tasks'
//! buffers are kept and flushed together, in submission order, after the
//! whole group has finished.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tracing::{debug, error};

use crate::cancel::{CancelReason, CancelToken};
use crate::logging::{CAPTURE, LogBuffer, emit_lines};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single task that did not succeed.
#[derive(Debug)]
pub struct TaskFailure {
  pub description: String,
  pub error: BoxError,
}

impl std::fmt::Display for TaskFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {}", self.description, self.error)
  }
}

impl TaskFailure {
  /// Downcast the underlying error.
  pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
    self.error.downcast_ref::<E>()
  }
}

#[derive(Debug, Error)]
pub enum TaskGroupError {
  /// All failures, in submission order. The first entry is the one that
  /// cancelled the group.
  #[error("{}", format_failures(.0))]
  Failed(Vec<TaskFailure>),

  #[error("task {description} was not started: {reason}")]
  NotStarted { description: String, reason: CancelReason },
}

fn format_failures(failures: &[TaskFailure]) -> String {
  match failures {
    [single] => single.to_string(),
    _ => {
      let joined: Vec<String> = failures.iter().map(ToString::to_string).collect();
      format!("{} tasks failed: {}", failures.len(), joined.join("; "))
    }
  }
}

impl TaskGroupError {
  pub fn failures(&self) -> &[TaskFailure] {
    match self {
      TaskGroupError::Failed(failures) => failures,
      TaskGroupError::NotStarted { .. } => &[],
    }
  }
}

struct Completed<T> {
  index: usize,
  description: String,
  logs: Vec<String>,
  result: Result<T, BoxError>,
}

pub struct TaskGroup<T> {
  token: CancelToken,
  join_set: JoinSet<Completed<T>>,
  limit: Option<Arc<Semaphore>>,
  descriptions: Vec<String>,
  /// Submission index of each spawned task, for tasks that never return.
  indices: HashMap<Id, usize>,
}

impl<T: Send + 'static> TaskGroup<T> {
  /// A group whose token is a child of `parent`.
  pub fn new(parent: &CancelToken) -> Self {
    TaskGroup {
      token: parent.child(),
      join_set: JoinSet::new(),
      limit: None,
      descriptions: Vec::new(),
      indices: HashMap::new(),
    }
  }

  /// A group that runs at most `parallelism` tasks at once.
  pub fn with_limit(parent: &CancelToken, parallelism: usize) -> Self {
    let mut group = Self::new(parent);
    group.limit = Some(Arc::new(Semaphore::new(parallelism.max(1))));
    group
  }

  pub fn token(&self) -> &CancelToken {
    &self.token
  }

  /// Start a task. The closure receives the group token, which is cancelled
  /// as soon as any task in the group fails.
  pub fn spawn<F, Fut, E>(&mut self, description: impl Into<String>, task: F)
  where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    let description = description.into();
    let index = self.descriptions.len();
    self.descriptions.push(description.clone());

    let token = self.token.clone();
    let limit = self.limit.clone();
    let future = task(token.clone());
    let buffer: LogBuffer = Arc::default();

    let handle = self.join_set.spawn(async move {
      let _permit = match limit {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
      };

      let result = if let Some(reason) = token.reason() {
        Err(BoxError::from(TaskGroupError::NotStarted {
          description: description.clone(),
          reason,
        }))
      } else {
        CAPTURE
          .scope(buffer.clone(), async move { future.await.map_err(Into::into) })
          .await
      };

      let logs = std::mem::take(&mut *buffer.lock().unwrap_or_else(|e| e.into_inner()));
      Completed {
        index,
        description,
        logs,
        result,
      }
    });
    self.indices.insert(handle.id(), index);
  }

  /// Wait for every task. Returns outputs in submission order.
  pub async fn wait(mut self) -> Result<Vec<T>, TaskGroupError> {
    let mut outputs: Vec<Option<T>> = (0..self.descriptions.len()).map(|_| None).collect();
    let mut failed: Vec<(usize, String, Vec<String>, BoxError)> = Vec::new();

    while let Some(joined) = self.join_set.join_next().await {
      let completed = match joined {
        Ok(completed) => completed,
        Err(join_error) => {
          // Panicked or aborted; the buffer is gone with the task.
          self.token.cancel();
          let index = self.indices.get(&join_error.id()).copied().unwrap_or(usize::MAX);
          let description = self
            .descriptions
            .get(index)
            .cloned()
            .unwrap_or_else(|| "task".to_string());
          if failed.is_empty() {
            error!(task = %description, error = %join_error, "task failed, cancelling group");
          }
          let message = if join_error.is_panic() { "panicked" } else { "was aborted" };
          failed.push((index, description, Vec::new(), BoxError::from(format!("task {}", message))));
          continue;
        }
      };

      match completed.result {
        Ok(output) => {
          emit_lines(&format!("----- {} (succeeded) -----", completed.description), &completed.logs);
          debug!(task = %completed.description, "task completed");
          outputs[completed.index] = Some(output);
        }
        Err(err) => {
          if failed.is_empty() {
            error!(task = %completed.description, error = %err, "task failed, cancelling group");
          }
          self.token.cancel();
          failed.push((completed.index, completed.description, completed.logs, err));
        }
      }
    }

    if failed.is_empty() {
      return Ok(outputs.into_iter().flatten().collect());
    }

    // Report the task that failed first in wall-clock order as the cause.
    let first = failed.remove(0);
    failed.sort_by_key(|(index, ..)| *index);
    failed.insert(0, first);

    let mut failures = Vec::with_capacity(failed.len());
    for (_, description, logs, error) in failed {
      emit_lines(&format!("----- {} (failed) -----", description), &logs);
      failures.push(TaskFailure { description, error });
    }
    Err(TaskGroupError::Failed(failures))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[derive(Debug, Error)]
  #[error("boom {0}")]
  struct Boom(u32);

  #[tokio::test]
  async fn outputs_are_in_submission_order() {
    let mut group = TaskGroup::new(&CancelToken::new());
    for i in 0..5u64 {
      group.spawn(format!("task {}", i), move |_| async move {
        tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
        Ok::<_, Boom>(i)
      });
    }
    assert_eq!(group.wait().await.unwrap(), vec![0, 1, 2, 3, 4]);
  }

  #[tokio::test]
  async fn first_error_cancels_siblings() {
    let parent = CancelToken::new();
    let mut group = TaskGroup::new(&parent);
    group.spawn("slow", |token| async move {
      match token.sleep(Duration::from_secs(30)).await {
        Ok(()) => Ok(()),
        Err(reason) => Err(format!("stopped: {}", reason)),
      }
    });
    group.spawn("fails", |_| async { Err::<(), _>("bad input".to_string()) });

    let err = group.wait().await.unwrap_err();
    let failures = err.failures();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].description, "fails");
    assert!(failures[1].to_string().contains("slow: stopped"));
    assert!(!parent.is_cancelled());
  }

  #[tokio::test]
  async fn errors_are_labelled_with_description() {
    let mut group = TaskGroup::new(&CancelToken::new());
    group.spawn("render billing", |_| async { Err::<(), _>(Boom(7)) });

    let err = group.wait().await.unwrap_err();
    assert_eq!(err.to_string(), "render billing: boom 7");
    assert!(err.failures()[0].downcast_ref::<Boom>().is_some());
  }

  #[tokio::test]
  async fn panicking_task_keeps_its_description() {
    let mut group = TaskGroup::new(&CancelToken::new());
    group.spawn("render compute", |_| async { Ok::<_, Boom>(1) });
    group.spawn("render billing", |_| async {
      if true {
        panic!("unexpected chart layout");
      }
      Ok::<_, Boom>(2)
    });

    let err = group.wait().await.unwrap_err();
    let failures = err.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].description, "render billing");
    assert_eq!(err.to_string(), "render billing: task panicked");
  }

  #[tokio::test]
  async fn limit_bounds_concurrency() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut group = TaskGroup::with_limit(&CancelToken::new(), 2);
    for i in 0..6 {
      let running = running.clone();
      let peak = peak.clone();
      group.spawn(format!("task {}", i), move |_| async move {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        running.fetch_sub(1, Ordering::SeqCst);
        Ok::<_, Boom>(())
      });
    }
    group.wait().await.unwrap();
    assert!(peak.load(Ordering::SeqCst) <= 2);
  }

  #[tokio::test]
  async fn logs_are_captured_per_task() {
    let outer: LogBuffer = Arc::default();
    let result = CAPTURE
      .scope(outer.clone(), async {
        let mut group = TaskGroup::new(&CancelToken::new());
        group.spawn("quiet", |_| async {
          crate::logging::CAPTURE.with(|buffer| buffer.lock().unwrap().push("hello".to_string()));
          Ok::<_, Boom>(())
        });
        group.wait().await
      })
      .await;
    assert!(result.is_ok());
    let lines = outer.lock().unwrap().clone();
    assert_eq!(lines, vec!["----- quiet (succeeded) -----".to_string(), "  hello".to_string()]);
  }
}
