//! Test helpers shared by the library's unit tests.

use std::fs;
use std::path::Path;
use std::process::Command;

/// Returns the shell command and args to run a shell script.
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

/// True when a `git` binary is on PATH. Tests that need a real repository
/// return early otherwise.
pub fn git_available() -> bool {
  Command::new("git")
    .arg("--version")
    .output()
    .map(|output| output.status.success())
    .unwrap_or(false)
}

/// Write `files` (relative path, content) below `dir`.
pub fn write_files(dir: &Path, files: &[(&str, &str)]) {
  for (relative, content) in files {
    let path = dir.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
  }
}

/// Run git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
  let output = Command::new("git")
    .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
    .args(args)
    .current_dir(dir)
    .output()
    .unwrap();
  assert!(
    output.status.success(),
    "git {:?} failed: {}",
    args,
    String::from_utf8_lossy(&output.stderr)
  );
  String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A 40-hex commit made of one repeated character.
pub fn fake_commit(c: char) -> String {
  std::iter::repeat_n(c, 40).collect()
}
