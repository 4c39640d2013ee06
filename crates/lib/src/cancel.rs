//! Cooperative cancellation with optional deadlines.
//!
//! A `CancelToken` is cloned into every task, subprocess and background loop
//! that must stop when its owner stops. Tokens form a tree: cancelling a
//! parent cancels every child, but cancelling a child leaves the parent alone.

use std::future::pending;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a token stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
  Cancelled,
  DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CancelReason::Cancelled => write!(f, "context canceled"),
      CancelReason::DeadlineExceeded => write!(f, "context deadline exceeded"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
  inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
  tx: watch::Sender<bool>,
  /// Earliest deadline of this token and all of its ancestors.
  deadline: Option<Instant>,
  children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
  fn cancel(&self) {
    self.tx.send_replace(true);
    let children = std::mem::take(&mut *self.children.lock().unwrap_or_else(|e| e.into_inner()));
    for child in children.iter().filter_map(Weak::upgrade) {
      child.cancel();
    }
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelToken {
  pub fn new() -> Self {
    Self::with_deadline(None)
  }

  fn with_deadline(deadline: Option<Instant>) -> Self {
    let (tx, _rx) = watch::channel(false);
    CancelToken {
      inner: Arc::new(Inner {
        tx,
        deadline,
        children: Mutex::new(Vec::new()),
      }),
    }
  }

  fn attach(&self, deadline: Option<Instant>) -> Self {
    let deadline = match (self.inner.deadline, deadline) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    };
    let child = Self::with_deadline(deadline);
    {
      let mut children = self.inner.children.lock().unwrap_or_else(|e| e.into_inner());
      children.retain(|weak| weak.strong_count() > 0);
      children.push(Arc::downgrade(&child.inner));
    }
    // Covers a cancel that raced with the registration above.
    if *self.inner.tx.borrow() {
      child.cancel();
    }
    child
  }

  /// A token that is cancelled together with `self`.
  pub fn child(&self) -> Self {
    self.attach(None)
  }

  /// A child token that also expires after `timeout`.
  pub fn child_with_timeout(&self, timeout: Duration) -> Self {
    self.attach(Some(Instant::now() + timeout))
  }

  pub fn cancel(&self) {
    self.inner.cancel();
  }

  pub fn reason(&self) -> Option<CancelReason> {
    if *self.inner.tx.borrow() {
      return Some(CancelReason::Cancelled);
    }
    match self.inner.deadline {
      Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
      _ => None,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.reason().is_some()
  }

  /// Resolves once this token or any ancestor is cancelled or expires.
  pub async fn cancelled(&self) -> CancelReason {
    if let Some(reason) = self.reason() {
      return reason;
    }

    let mut rx = self.inner.tx.subscribe();
    let own = async move {
      if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        pending::<()>().await;
      }
      CancelReason::Cancelled
    };

    let deadline = self.inner.deadline;
    let expired = async move {
      match deadline {
        Some(deadline) => {
          tokio::time::sleep_until(deadline).await;
          CancelReason::DeadlineExceeded
        }
        None => pending().await,
      }
    };

    tokio::select! {
      reason = own => reason,
      reason = expired => reason,
    }
  }

  /// Sleeps for `duration` unless cancelled first.
  pub async fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
    tokio::select! {
      _ = tokio::time::sleep(duration) => Ok(()),
      reason = self.cancelled() => Err(reason),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn cancel_propagates_to_children() {
    let parent = CancelToken::new();
    let child = parent.child();
    let grandchild = child.child();

    assert!(!grandchild.is_cancelled());
    parent.cancel();

    assert_eq!(grandchild.cancelled().await, CancelReason::Cancelled);
    assert!(child.is_cancelled());
  }

  #[tokio::test]
  async fn cancelling_child_leaves_parent_running() {
    let parent = CancelToken::new();
    let child = parent.child();
    child.cancel();

    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());
  }

  #[tokio::test]
  async fn child_of_cancelled_parent_starts_cancelled() {
    let parent = CancelToken::new();
    parent.cancel();
    assert_eq!(parent.child().reason(), Some(CancelReason::Cancelled));
  }

  #[tokio::test]
  async fn child_inherits_parent_deadline() {
    let parent = CancelToken::new().child_with_timeout(Duration::from_millis(10));
    let child = parent.child_with_timeout(Duration::from_secs(60));
    assert_eq!(child.cancelled().await, CancelReason::DeadlineExceeded);
  }

  #[tokio::test]
  async fn deadline_expires() {
    let token = CancelToken::new().child_with_timeout(Duration::from_millis(20));
    assert_eq!(token.cancelled().await, CancelReason::DeadlineExceeded);
    assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
  }

  #[tokio::test]
  async fn sleep_is_interrupted() {
    let token = CancelToken::new();
    let sleeper = token.clone();
    let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(60)).await });
    token.cancel();
    assert_eq!(handle.await.unwrap(), Err(CancelReason::Cancelled));
  }
}
