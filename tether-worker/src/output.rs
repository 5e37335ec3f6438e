//! Execution output sink
//!
//! Collects the structured text log of one execution. Actions append lines
//! through the execution context; the engine periodically drains what is new
//! and streams it to the master.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tether_core::domain::log::{
    JOB_FINISHED, JOB_STARTED, STAGE_FINISHED, STAGE_MARKER, STAGE_STARTED, STEP_MARKER,
    format_time,
};

#[derive(Default)]
struct Buffer {
    lines: Vec<String>,

    /// Lines already handed out by `new_content`
    sent: usize,
}

/// Append-only, shareable output of one execution
#[derive(Clone, Default)]
pub struct OutputSink {
    buffer: Arc<Mutex<Buffer>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer, recovered if a writer panicked mid-push
    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, line: String) {
        self.buffer().lines.push(line);
    }

    /// Writes a timestamped content line
    pub fn write_line(&self, text: impl AsRef<str>) {
        let now = format_time(Utc::now());
        for line in text.as_ref().lines() {
            self.push(format!("[{now}] {line}"));
        }
    }

    /// Writes a command about to be run
    pub fn write_command(&self, command: impl AsRef<str>) {
        self.write_line(format!("> {}", command.as_ref()));
    }

    pub fn job_started(&self, at: DateTime<Utc>) {
        self.push(format!("{JOB_STARTED}{}", format_time(at)));
    }

    pub fn new_stage(&self, name: &str, at: DateTime<Utc>) {
        self.push(String::new());
        self.push(format!("{STAGE_MARKER}{name}"));
        self.push(format!("{STAGE_STARTED}{}", format_time(at)));
    }

    pub fn new_step(&self, name: &str) {
        self.push(format!("{STEP_MARKER}{name}"));
    }

    pub fn stage_finished(&self, at: DateTime<Utc>, duration_ms: u64) {
        self.push(format!(
            "{STAGE_FINISHED}{}, Duration: {duration_ms}ms",
            format_time(at)
        ));
    }

    pub fn job_finished(&self, at: DateTime<Utc>, duration_ms: u64) {
        self.push(String::new());
        self.push(format!(
            "{JOB_FINISHED}{}, Duration: {duration_ms}ms",
            format_time(at)
        ));
    }

    pub fn line_count(&self) -> usize {
        self.buffer().lines.len()
    }

    /// The whole log, newline terminated
    pub fn content(&self) -> String {
        join(&self.buffer().lines)
    }

    /// Lines written since the previous call, with the line offset they start at
    pub fn new_content(&self) -> (usize, String) {
        let mut buffer = self.buffer();
        let offset = buffer.sent;
        let content = join(&buffer.lines[offset..]);
        buffer.sent = buffer.lines.len();
        (offset, content)
    }
}

fn join(lines: &[String]) -> String {
    let mut content = String::new();
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    content
}
