//! Execution detail types
//!
//! `JobDetail` is one run of a `Job`. The executor mutates it as stages and
//! steps progress; master and worker both persist it as a snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::{Job, Stage, Step};
use crate::domain::result::ActionResult;
use crate::domain::status::Status;

/// Runtime wrapper around a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetail {
    #[serde(flatten)]
    pub step: Step,

    #[serde(default)]
    pub status: Status,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration_ms: u64,
}

impl From<&Step> for StepDetail {
    fn from(step: &Step) -> Self {
        Self {
            step: step.clone(),
            status: Status::NotRun,
            start_time: None,
            duration_ms: 0,
        }
    }
}

/// Runtime wrapper around a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDetail {
    pub name: String,

    #[serde(default)]
    pub needs: Vec<String>,

    pub steps: Vec<StepDetail>,

    #[serde(default)]
    pub status: Status,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration_ms: u64,
}

impl StageDetail {
    pub fn new(name: &str, stage: &Stage) -> Self {
        Self {
            name: name.to_string(),
            needs: stage.needs.clone(),
            steps: stage.steps.iter().map(StepDetail::from).collect(),
            status: Status::NotRun,
            start_time: None,
            duration_ms: 0,
        }
    }
}

/// One execution of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    /// Execution id, unique per job name
    pub id: u64,

    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub parameter: BTreeMap<String, String>,

    /// Stages in resolved execution order
    pub stages: Vec<StageDetail>,

    pub status: Status,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default)]
    pub result: ActionResult,

    /// Human-readable terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobDetail {
    /// Creates a NOTRUN execution from a job and its resolved stage plan
    pub fn new(id: u64, job: &Job, stages: Vec<StageDetail>) -> Self {
        Self {
            id,
            name: job.name.clone(),
            version: job.version.clone(),
            parameter: job.parameter.clone(),
            stages,
            status: Status::NotRun,
            start_time: None,
            duration_ms: 0,
            result: ActionResult::default(),
            error: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageDetail> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Moves the execution to `next` if that is a forward transition
    ///
    /// Returns false, leaving the detail untouched, for repeats and for
    /// anything after a terminal status.
    pub fn transition(&mut self, next: Status) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Stops a non-terminal execution, recording the reason
    pub fn stop(&mut self, reason: impl Into<String>) -> bool {
        if !self.transition(Status::Stop) {
            return false;
        }
        self.error = Some(reason.into());
        for stage in &mut self.stages {
            if stage.status == Status::Running {
                stage.status = Status::Stop;
            }
            for step in &mut stage.steps {
                if step.status == Status::Running {
                    step.status = Status::Stop;
                }
            }
        }
        true
    }

    /// Replaces this detail with a newer snapshot without regressing status
    ///
    /// Snapshots can arrive late or out of order. Timings, stages and results
    /// always come from the snapshot; its status is taken only when it is a
    /// forward transition from the current one.
    pub fn absorb_snapshot(&mut self, snapshot: JobDetail) {
        let status = self.status;
        let error = self.error.take();
        *self = snapshot;
        if self.status != status && !status.can_transition_to(self.status) {
            self.status = status;
            self.error = error;
        } else if self.error.is_none() {
            self.error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver;

    fn detail() -> JobDetail {
        let job = Job::from_yaml(
            "name: demo\nstages:\n  A:\n    steps:\n      - name: s1\n  B:\n    needs: [A]\n    steps:\n      - name: s2\n",
        )
        .unwrap();
        let stages = resolver::resolve(&job.stages).unwrap();
        JobDetail::new(1, &job, stages)
    }

    #[test]
    fn test_new_detail_is_notrun() {
        let detail = detail();
        assert_eq!(detail.status, Status::NotRun);
        assert_eq!(detail.stages.len(), 2);
        assert!(detail.stages.iter().all(|s| s.status == Status::NotRun));
        assert_eq!(detail.stage("B").unwrap().steps[0].step.name, "s2");
    }

    #[test]
    fn test_transition_is_idempotent_and_monotonic() {
        let mut detail = detail();
        assert!(detail.transition(Status::Running));
        assert!(detail.transition(Status::Success));
        assert!(!detail.transition(Status::Success));
        assert!(!detail.transition(Status::Fail));
        assert_eq!(detail.status, Status::Success);
    }

    #[test]
    fn test_stop_marks_running_parts() {
        let mut detail = detail();
        detail.transition(Status::Running);
        detail.stages[0].status = Status::Running;
        detail.stages[0].steps[0].status = Status::Running;

        assert!(detail.stop("cancelled by request"));
        assert_eq!(detail.status, Status::Stop);
        assert_eq!(detail.stages[0].status, Status::Stop);
        assert_eq!(detail.stages[0].steps[0].status, Status::Stop);
        assert_eq!(detail.stages[1].status, Status::NotRun);
        assert_eq!(detail.error.as_deref(), Some("cancelled by request"));
        assert!(!detail.stop("again"));
    }

    #[test]
    fn test_snapshot_never_regresses_terminal_status() {
        let mut stored = detail();
        stored.transition(Status::Running);
        stored.transition(Status::Fail);
        stored.error = Some("boom".into());

        let mut late = detail();
        late.transition(Status::Running);
        late.duration_ms = 42;

        stored.absorb_snapshot(late);
        assert_eq!(stored.status, Status::Fail);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert_eq!(stored.duration_ms, 42);
    }

    #[test]
    fn test_stale_snapshot_keeps_running_status() {
        let mut stored = detail();
        stored.transition(Status::Running);

        let mut stale = detail();
        stale.duration_ms = 7;

        stored.absorb_snapshot(stale);
        assert_eq!(stored.status, Status::Running);
        assert_eq!(stored.duration_ms, 7);

        let mut finished = detail();
        finished.transition(Status::Running);
        finished.transition(Status::Success);
        stored.absorb_snapshot(finished);
        assert_eq!(stored.status, Status::Success);
    }
}
