//! Execution log format
//!
//! Executors write a line-oriented text log with marker lines that split it
//! into stages:
//!
//! ```text
//! [Job] Started on 2026-03-01 10:00:00
//!
//! [Pipeline] Stage: build
//! [TimeConsuming] StartTime: 2026-03-01 10:00:00
//! [Pipeline] Step: compile
//! [2026-03-01 10:00:01] > cargo build
//! [2026-03-01 10:00:09] Finished release target
//! [TimeConsuming] EndTime: 2026-03-01 10:00:09, Duration: 9000ms
//!
//! [Job] Finished on 2026-03-01 10:00:09, Duration: 9000ms
//! ```
//!
//! `JobLog::parse` recovers the per-stage sections so viewers can tail a
//! single stage by line offset or read one step's output.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::detail::JobDetail;

pub const JOB_STARTED: &str = "[Job] Started on ";
pub const JOB_FINISHED: &str = "[Job] Finished on ";
pub const STAGE_MARKER: &str = "[Pipeline] Stage: ";
pub const STEP_MARKER: &str = "[Pipeline] Step: ";
pub const STAGE_STARTED: &str = "[TimeConsuming] StartTime: ";
pub const STAGE_FINISHED: &str = "[TimeConsuming] EndTime: ";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// Splits `<time>, Duration: <n>ms` into its parts
fn parse_time_and_duration(text: &str) -> (Option<DateTime<Utc>>, Option<u64>) {
    match text.split_once(", Duration: ") {
        Some((time, duration)) => (
            parse_time(time),
            duration.trim().trim_end_matches("ms").parse().ok(),
        ),
        None => (parse_time(text), None),
    }
}

/// Log lines belonging to one stage, marker line included
#[derive(Debug, Clone, PartialEq)]
pub struct StageSection {
    pub name: String,
    pub lines: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// A parsed execution log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobLog {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub stages: Vec<StageSection>,
    pub lines: Vec<String>,
}

/// One stage's output from a line offset, for incremental tailing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLog {
    pub start_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,

    /// Lines from the requested offset, newline separated
    pub content: String,

    /// Offset to pass on the next request
    pub last_line: usize,

    /// True once the stage reached a terminal status
    pub end: bool,
}

/// Output of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub name: String,
    pub lines: Vec<String>,
}

impl JobLog {
    pub fn parse(text: &str) -> Self {
        let mut log = JobLog {
            lines: text.lines().map(String::from).collect(),
            ..Default::default()
        };

        for line in text.lines() {
            if let Some(rest) = line.strip_prefix(JOB_STARTED) {
                log.start_time = parse_time(rest);
                continue;
            }
            if let Some(rest) = line.strip_prefix(JOB_FINISHED) {
                (log.end_time, log.duration_ms) = parse_time_and_duration(rest);
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix(STAGE_MARKER) {
                log.stages.push(StageSection {
                    name: name.trim().to_string(),
                    lines: Vec::new(),
                    start_time: None,
                    end_time: None,
                    duration_ms: None,
                });
            }

            // Lines before the first stage marker belong to no stage
            let Some(section) = log.stages.last_mut() else {
                continue;
            };
            if let Some(rest) = line.strip_prefix(STAGE_STARTED) {
                section.start_time = parse_time(rest);
            } else if let Some(rest) = line.strip_prefix(STAGE_FINISHED) {
                (section.end_time, section.duration_ms) = parse_time_and_duration(rest);
            }
            section.lines.push(line.to_string());
        }

        log
    }

    pub fn stage(&self, name: &str) -> Option<&StageSection> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns a stage's lines from `start`, or None for an unknown stage
    ///
    /// An offset past the end yields empty content with `last_line` at the
    /// current end, so a tailer simply polls again.
    pub fn stage_log(&self, detail: &JobDetail, stage: &str, start: usize) -> Option<StageLog> {
        let section = self.stage(stage)?;
        let stage_detail = detail.stage(stage);

        let content = section
            .lines
            .get(start..)
            .map(|lines| lines.join("\n"))
            .unwrap_or_default();

        Some(StageLog {
            start_time: section
                .start_time
                .or_else(|| stage_detail.and_then(|s| s.start_time)),
            duration_ms: section
                .duration_ms
                .or_else(|| stage_detail.map(|s| s.duration_ms))
                .unwrap_or(0),
            content,
            last_line: section.lines.len(),
            end: stage_detail.is_some_and(|s| s.status.is_terminal()),
        })
    }

    /// Lines a step printed, from its marker up to the next step or the end
    /// of the stage, without timing lines
    pub fn step_log(&self, stage: &str, step: &str) -> Option<StepLog> {
        let section = self.stage(stage)?;
        let mut lines = None;
        for line in &section.lines {
            if let Some(name) = line.strip_prefix(STEP_MARKER) {
                if lines.is_some() {
                    break;
                }
                if name.trim() == step {
                    lines = Some(Vec::new());
                }
                continue;
            }
            if line.starts_with(STAGE_STARTED) || line.starts_with(STAGE_FINISHED) {
                continue;
            }
            if let Some(lines) = lines.as_mut() {
                lines.push(line.clone());
            }
        }

        lines.map(|lines| StepLog {
            name: step.to_string(),
            lines,
        })
    }
}
