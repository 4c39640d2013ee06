//! Deployment artifacts repository.
//!
//! Every released commit of a component has a deployment artifacts tar
//! (binaries plus templating config) stored at a predictable URL. A missing
//! tar is reported as [`ArtifactError::NotFound`] so the caller can build
//! exactly the missing releases.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::cancel::{CancelReason, CancelToken};
use crate::util::retry::{Backoff, retry};

pub const USERNAME_FILE: &str = "artifactory_username";
pub const PASSWORD_FILE: &str = "artifactory_password";

#[derive(Debug, Error)]
pub enum ArtifactError {
  #[error("{url} not found")]
  NotFound { url: String },

  #[error("GET {url} returned {status}")]
  Status { url: String, status: u16 },

  #[error("GET {url}: {source}")]
  Http {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("GET {url}: {reason}")]
  Cancelled { url: String, reason: CancelReason },

  #[error("failed to read credentials from {path}: {source}")]
  Credentials {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl ArtifactError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, ArtifactError::NotFound { .. })
  }

  /// Network errors and server-side failures.
  pub fn is_retryable(&self) -> bool {
    match self {
      ArtifactError::Http { .. } => true,
      ArtifactError::Status { status, .. } => *status >= 500 || *status == 429,
      _ => false,
    }
  }
}

/// `<base>/<component>/<commit>/universe_deployer_deployment_artifacts_<component>_<commit>.tar`
pub fn deployment_artifacts_tar_url(base: &str, component: &str, commit: &str) -> String {
  format!(
    "{}/{}/{}/{}",
    base.trim_end_matches('/'),
    component,
    commit,
    deployment_artifacts_file_name(component, commit)
  )
}

/// Also used as the cache key of a downloaded tar.
pub fn deployment_artifacts_file_name(component: &str, commit: &str) -> String {
  format!("universe_deployer_deployment_artifacts_{}_{}.tar", component, commit)
}

#[async_trait]
pub trait ArtifactSource: Send + Sync {
  /// Download the deployment artifacts tar of `(component, commit)` to `output`.
  async fn download(&self, component: &str, commit: &str, output: &Path, token: &CancelToken)
  -> Result<(), ArtifactError>;
}

#[derive(Debug, Clone)]
struct Credentials {
  username: String,
  password: String,
}

/// [`ArtifactSource`] over plain HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpArtifactRepository {
  base_url: String,
  client: reqwest::Client,
  credentials: Option<Credentials>,
  backoff: Backoff,
}

impl HttpArtifactRepository {
  pub fn new(base_url: impl Into<String>) -> Self {
    HttpArtifactRepository {
      base_url: base_url.into(),
      client: reqwest::Client::new(),
      credentials: None,
      backoff: Backoff::exponential(Duration::from_secs(2), 2, 5),
    }
  }

  pub fn with_backoff(mut self, backoff: Backoff) -> Self {
    self.backoff = backoff;
    self
  }

  /// Use basic auth when both credential files exist in `secrets_dir`.
  pub fn with_credentials_from(mut self, secrets_dir: &Path) -> Result<Self, ArtifactError> {
    let username_file = secrets_dir.join(USERNAME_FILE);
    let password_file = secrets_dir.join(PASSWORD_FILE);
    if !username_file.is_file() || !password_file.is_file() {
      debug!(secrets_dir = %secrets_dir.display(), "no artifact repository credentials");
      return Ok(self);
    }
    let read = |path: &Path| {
      fs::read_to_string(path)
        .map(|content| content.trim().to_string())
        .map_err(|source| ArtifactError::Credentials {
          path: path.to_path_buf(),
          source,
        })
    };
    self.credentials = Some(Credentials {
      username: read(&username_file)?,
      password: read(&password_file)?,
    });
    Ok(self)
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  async fn get_once(&self, url: &str, output: &Path) -> Result<u64, ArtifactError> {
    let http_error = |source| ArtifactError::Http {
      url: url.to_string(),
      source,
    };
    let mut request = self.client.get(url);
    if let Some(credentials) = &self.credentials {
      request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }
    let mut response = request.send().await.map_err(http_error)?;
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
      return Err(ArtifactError::NotFound { url: url.to_string() });
    }
    if !status.is_success() {
      return Err(ArtifactError::Status {
        url: url.to_string(),
        status: status.as_u16(),
      });
    }

    let io_error = |source| ArtifactError::Io {
      path: output.to_path_buf(),
      source,
    };
    let mut file = tokio::fs::File::create(output).await.map_err(io_error)?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(http_error)? {
      file.write_all(&chunk).await.map_err(io_error)?;
      written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_error)?;
    Ok(written)
  }
}

#[async_trait]
impl ArtifactSource for HttpArtifactRepository {
  async fn download(
    &self,
    component: &str,
    commit: &str,
    output: &Path,
    token: &CancelToken,
  ) -> Result<(), ArtifactError> {
    let url = deployment_artifacts_tar_url(&self.base_url, component, commit);
    info!(component, commit, url = %url, "downloading deployment artifacts");
    let start = Instant::now();

    let url_ref = url.as_str();
    let attempt = move || async move {
      tokio::select! {
        result = self.get_once(url_ref, output) => result,
        reason = token.cancelled() => Err(ArtifactError::Cancelled { url: url_ref.to_string(), reason }),
      }
    };
    let result = retry(&self.backoff, token, ArtifactError::is_retryable, attempt).await;
    match result {
      Ok(bytes) => {
        info!(component, commit, bytes, duration = ?start.elapsed(), "downloaded deployment artifacts");
        Ok(())
      }
      Err(err) => {
        let err = err.into_inner();
        if !err.is_not_found() {
          warn!(component, commit, error = %err, "download failed");
        }
        Err(err)
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  /// Answer every connection with `status` and `body`, then close it.
  async fn serve(status: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let Ok((mut stream, _)) = listener.accept().await else {
          return;
        };
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await;
        let response = format!(
          "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
          status,
          body.len(),
          body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
      }
    });
    format!("http://{}", addr)
  }

  #[test]
  fn url_layout() {
    assert_eq!(
      deployment_artifacts_tar_url("https://artifacts.example.com/idc/", "billing", "abc"),
      "https://artifacts.example.com/idc/billing/abc/universe_deployer_deployment_artifacts_billing_abc.tar"
    );
  }

  #[test]
  fn only_transient_errors_are_retryable() {
    let status = |status| ArtifactError::Status {
      url: "u".to_string(),
      status,
    };
    assert!(status(503).is_retryable());
    assert!(!status(403).is_retryable());
    assert!(!ArtifactError::NotFound { url: "u".to_string() }.is_retryable());
    assert!(ArtifactError::NotFound { url: "u".to_string() }.is_not_found());
  }

  #[tokio::test]
  async fn download_writes_body() {
    let base = serve("200 OK", "tar-bytes").await;
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("a.tar");
    HttpArtifactRepository::new(base)
      .download("billing", "abc", &output, &CancelToken::new())
      .await
      .unwrap();
    assert_eq!(fs::read_to_string(&output).unwrap(), "tar-bytes");
  }

  #[tokio::test]
  async fn missing_tar_is_not_found() {
    let base = serve("404 Not Found", "").await;
    let temp = TempDir::new().unwrap();
    let err = HttpArtifactRepository::new(base)
      .download("billing", "abc", &temp.path().join("a.tar"), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(err.is_not_found(), "{}", err);
    assert!(err.to_string().ends_with("universe_deployer_deployment_artifacts_billing_abc.tar not found"));
  }

  #[tokio::test]
  async fn server_errors_are_retried_then_reported() {
    let base = serve("500 Internal Server Error", "").await;
    let temp = TempDir::new().unwrap();
    let err = HttpArtifactRepository::new(base)
      .with_backoff(Backoff::exponential(Duration::from_millis(1), 2, 2))
      .download("billing", "abc", &temp.path().join("a.tar"), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, ArtifactError::Status { status: 500, .. }), "{}", err);
  }

  #[test]
  fn credentials_are_optional() {
    let temp = TempDir::new().unwrap();
    let repo = HttpArtifactRepository::new("http://x")
      .with_credentials_from(temp.path())
      .unwrap();
    assert!(repo.credentials.is_none());

    fs::write(temp.path().join(USERNAME_FILE), "user\n").unwrap();
    fs::write(temp.path().join(PASSWORD_FILE), "secret\n").unwrap();
    let repo = HttpArtifactRepository::new("http://x")
      .with_credentials_from(temp.path())
      .unwrap();
    let credentials = repo.credentials.unwrap();
    assert_eq!(credentials.username, "user");
    assert_eq!(credentials.password, "secret");
  }
}
