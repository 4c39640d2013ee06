//! Retry with bounded backoff.
//!
//! Flaky external operations (artifact downloads, pushes, readiness polling)
//! are wrapped in [`retry`]. Validation errors are never retried: the caller
//! supplies a predicate that decides which errors are transient.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::cancel::{CancelReason, CancelToken};

/// A finite sequence of delays between attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
  /// Fixed `interval` between attempts until `timeout` has been spent sleeping.
  Linear { timeout: Duration, interval: Duration },
  /// Delays `initial`, `initial * factor`, ... for at most `max_steps` retries.
  Exponential {
    initial: Duration,
    factor: u32,
    max_steps: usize,
  },
}

impl Backoff {
  pub fn linear(timeout: Duration, interval: Duration) -> Self {
    Backoff::Linear { timeout, interval }
  }

  pub fn exponential(initial: Duration, factor: u32, max_steps: usize) -> Self {
    Backoff::Exponential {
      initial,
      factor,
      max_steps,
    }
  }

  /// The delays to wait before each retry, in order.
  pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
    match *self {
      Backoff::Linear { timeout, interval } => {
        let steps = if interval.is_zero() {
          0
        } else {
          (timeout.as_millis() / interval.as_millis().max(1)) as usize
        };
        Box::new(std::iter::repeat_n(interval, steps))
      }
      Backoff::Exponential {
        initial,
        factor,
        max_steps,
      } => Box::new(
        std::iter::successors(Some(initial), move |delay| delay.checked_mul(factor.max(1))).take(max_steps),
      ),
    }
  }
}

/// Why [`retry`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
  /// The last error returned by the operation.
  Failed(E),
  /// The token fired while waiting between attempts.
  Cancelled { reason: CancelReason, last: E },
}

impl<E> RetryError<E> {
  /// The operation's last error, discarding the cancellation reason.
  pub fn into_inner(self) -> E {
    match self {
      RetryError::Failed(err) => err,
      RetryError::Cancelled { last, .. } => last,
    }
  }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RetryError::Failed(err) => write!(f, "{}", err),
      RetryError::Cancelled { reason, last } => write!(f, "{} (last error: {})", reason, last),
    }
  }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      RetryError::Failed(err) => Some(err),
      RetryError::Cancelled { last, .. } => Some(last),
    }
  }
}

/// Run `op` until it succeeds, fails with an error that `is_retryable`
/// rejects, or `backoff` is exhausted.
pub async fn retry<T, E, F, Fut>(
  backoff: &Backoff,
  token: &CancelToken,
  is_retryable: impl Fn(&E) -> bool,
  mut op: F,
) -> Result<T, RetryError<E>>
where
  E: std::fmt::Display,
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  let mut delays = backoff.delays();
  let mut attempt = 1usize;
  loop {
    let err = match op().await {
      Ok(value) => return Ok(value),
      Err(err) => err,
    };
    if !is_retryable(&err) {
      return Err(RetryError::Failed(err));
    }
    let Some(delay) = delays.next() else {
      return Err(RetryError::Failed(err));
    };
    debug!(attempt, error = %err, delay = ?delay, "retrying");
    if let Err(reason) = token.sleep(delay).await {
      return Err(RetryError::Cancelled { reason, last: err });
    }
    attempt += 1;
  }
}
