//! Tracing setup and per-task log capture.
//!
//! Events emitted inside a [`crate::task_group::TaskGroup`] task are written
//! to a task-local buffer instead of the console, so that concurrent tasks
//! never interleave their diagnostics. The task group decides when each
//! buffer is flushed.

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::consts::MAX_OUTPUT_LEN_TO_LOG;

pub(crate) type LogBuffer = Arc<Mutex<Vec<String>>>;

tokio::task_local! {
  pub(crate) static CAPTURE: LogBuffer;
}

/// Returns true when the current task's events are being captured.
pub fn is_capturing() -> bool {
  CAPTURE.try_with(|_| ()).is_ok()
}

/// Install the global subscriber: an `EnvFilter` (`RUST_LOG`, falling back to
/// `default_level`), a console layer on stderr and the capture layer.
pub fn init(default_level: Level) -> Result<(), tracing_subscriber::util::TryInitError> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

  let console = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(filter_fn(|_| !is_capturing()));

  tracing_subscriber::registry()
    .with(filter)
    .with(console)
    .with(CaptureLayer)
    .try_init()
}

/// Writes events into the task-local buffer when one is in scope.
pub struct CaptureLayer;

impl<S: Subscriber> Layer<S> for CaptureLayer {
  fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
    let _ = CAPTURE.try_with(|buffer| {
      let line = format_event(event);
      buffer.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    });
  }
}

fn format_event(event: &Event<'_>) -> String {
  let mut visitor = LineVisitor::default();
  event.record(&mut visitor);
  format!("{:>5} {}{}", event.metadata().level(), visitor.message, visitor.fields)
}

#[derive(Default)]
struct LineVisitor {
  message: String,
  fields: String,
}

impl Visit for LineVisitor {
  fn record_str(&mut self, field: &Field, value: &str) {
    if field.name() == "message" {
      self.message.push_str(value);
    } else {
      let _ = write!(self.fields, " {}={}", field.name(), value);
    }
  }

  fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
    if field.name() == "message" {
      let _ = write!(self.message, "{:?}", value);
    } else {
      let _ = write!(self.fields, " {}={:?}", field.name(), value);
    }
  }
}

/// Emit previously captured lines. When called from inside another captured
/// task, the lines go to that task's buffer so nesting stays grouped.
pub(crate) fn emit_lines(header: &str, lines: &[String]) {
  if lines.is_empty() {
    return;
  }
  let forwarded = CAPTURE.try_with(|buffer| {
    let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
    buffer.push(header.to_string());
    buffer.extend(lines.iter().map(|line| format!("  {}", line)));
  });
  if forwarded.is_err() {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "{}", header);
    for line in lines {
      let _ = writeln!(out, "  {}", line);
    }
  }
}

/// Shorten long subprocess output before it is logged.
pub fn truncate_for_log(output: &str) -> &str {
  if output.len() <= MAX_OUTPUT_LEN_TO_LOG {
    return output;
  }
  let mut end = MAX_OUTPUT_LEN_TO_LOG;
  while !output.is_char_boundary(end) {
    end -= 1;
  }
  &output[..end]
}
