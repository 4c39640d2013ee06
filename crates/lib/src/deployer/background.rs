//! Long-running helper processes such as `kubectl port-forward`.

use std::net::TcpListener;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::process::{CommandSpec, run};

const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Restarts its processes whenever they exit until [`terminate`] is called.
///
/// [`terminate`]: BackgroundProcesses::terminate
pub struct BackgroundProcesses {
  token: CancelToken,
  tasks: Mutex<JoinSet<()>>,
}

impl BackgroundProcesses {
  pub fn new(parent: &CancelToken) -> Self {
    BackgroundProcesses {
      token: parent.child(),
      tasks: Mutex::new(JoinSet::new()),
    }
  }

  pub fn spawn_restarting(&self, name: impl Into<String>, spec: CommandSpec) {
    let name = name.into();
    let token = self.token.clone();
    let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
    tasks.spawn(async move {
      loop {
        let result = run(&spec, &token).await;
        if token.is_cancelled() {
          debug!(name = %name, "background process cancelled");
          return;
        }
        if let Err(err) = result {
          warn!(name = %name, error = %err, "background process exited");
        }
        if token.sleep(RESTART_DELAY).await.is_err() {
          return;
        }
      }
    });
  }

  pub fn len(&self) -> usize {
    self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Cancel every process and wait until all of them have exited.
  pub async fn terminate(&self) {
    debug!("BEGIN");
    self.token.cancel();
    let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
    while tasks.join_next().await.is_some() {}
    debug!("END");
  }
}

/// An unused local TCP port.
pub fn free_port() -> std::io::Result<u16> {
  let listener = TcpListener::bind(("127.0.0.1", 0))?;
  Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Instant;

  #[tokio::test]
  async fn terminate_stops_long_running_process() {
    let background = BackgroundProcesses::new(&CancelToken::new());
    background.spawn_restarting("sleep", CommandSpec::new("/bin/sleep").arg("60"));
    assert_eq!(background.len(), 1);
    let start = Instant::now();
    tokio::time::timeout(Duration::from_secs(10), background.terminate())
      .await
      .unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(background.is_empty());
  }

  #[tokio::test]
  async fn exiting_process_is_restarted_until_terminated() {
    let background = BackgroundProcesses::new(&CancelToken::new());
    background.spawn_restarting("false", CommandSpec::new("/bin/false"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(background.len(), 1);
    tokio::time::timeout(Duration::from_secs(5), background.terminate())
      .await
      .unwrap();
  }

  #[test]
  fn free_port_is_nonzero() {
    assert_ne!(free_port().unwrap(), 0);
  }
}
