//! Executor
//!
//! Runs executions as a state machine over job, stage and step status:
//! - Stages run strictly in resolved order; a failed stage ends the job
//! - Each step runs its optional environment action, then its own action
//! - Actions whose `pre` succeeded are cleaned up in reverse at stage exit
//! - A watchdog stops executions whose current step runs too long
//! - A snapshot saver persists live durations while the job runs
//!
//! Cancellation is cooperative: the execution's token is cancelled and the
//! phase in flight is abandoned at the step boundary.

mod fault;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use tether_core::domain::detail::JobDetail;
use tether_core::domain::job::{DefinitionError, Job, Step};
use tether_core::domain::status::{CANCELLED_BY_REQUEST, Status};
use tether_core::dto::message::{ExecuteRequest, JobRef};
use tether_core::resolver;
use tether_core::store::JobStore;

use crate::action::{Action, ActionRegistry};
use crate::context::ExecutionContext;
use crate::output::OutputSink;

pub use fault::{ExecutionFault, contained, guarded};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("execution {0} is already running")]
    AlreadyRunning(JobRef),
}

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Parent of the per-job working directories
    pub workspace: PathBuf,

    pub step_timeout: Duration,

    pub snapshot_interval: Duration,
}

/// Handle on one prepared or running execution
#[derive(Clone)]
pub struct Execution {
    pub job: JobRef,
    pub detail: Arc<Mutex<JobDetail>>,
    pub output: OutputSink,
    token: CancellationToken,
    stop_reason: Arc<Mutex<Option<String>>>,
}

impl Execution {
    fn new(job: JobRef, detail: JobDetail) -> Self {
        Self {
            job,
            detail: Arc::new(Mutex::new(detail)),
            output: OutputSink::new(),
            token: CancellationToken::new(),
            stop_reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn snapshot(&self) -> JobDetail {
        lock(&self.detail).clone()
    }

    pub fn status(&self) -> Status {
        lock(&self.detail).status
    }

    /// Cancels the execution; the first reason given is the one recorded
    fn stop(&self, reason: &str) {
        {
            let mut stop_reason = lock(&self.stop_reason);
            if stop_reason.is_none() {
                *stop_reason = Some(reason.to_string());
            }
        }
        self.token.cancel();
    }

    fn stop_reason(&self) -> String {
        lock(&self.stop_reason)
            .clone()
            .unwrap_or_else(|| CANCELLED_BY_REQUEST.to_string())
    }
}

/// Locks a mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Final outcome of an execution
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub job: JobRef,
    pub status: Status,
    pub error: Option<String>,
}

pub struct Executor {
    store: Arc<dyn JobStore>,
    registry: ActionRegistry,
    settings: ExecutorSettings,
    running: DashMap<JobRef, Execution>,
    step_timers: DashMap<JobRef, Instant>,
}

impl Executor {
    pub fn new(store: Arc<dyn JobStore>, registry: ActionRegistry, settings: ExecutorSettings) -> Self {
        Self {
            store,
            registry,
            settings,
            running: DashMap::new(),
            step_timers: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Parses and resolves the job and registers its cancellation handle
    ///
    /// Definition errors surface here, before anything runs.
    pub fn prepare(&self, request: &ExecuteRequest) -> Result<Execution, ExecutorError> {
        let job = Job::from_yaml(&request.pipeline_file)?;
        let stages = resolver::resolve(&job.stages).map_err(DefinitionError::from)?;

        let mut detail = JobDetail::new(request.job_id, &job, stages);
        detail.name = request.job_name.clone();

        match self.running.entry(request.job_ref()) {
            Entry::Occupied(entry) => Err(ExecutorError::AlreadyRunning(entry.key().clone())),
            Entry::Vacant(entry) => {
                let execution = Execution::new(request.job_ref(), detail);
                entry.insert(execution.clone());
                Ok(execution)
            }
        }
    }

    pub fn execution(&self, job: &JobRef) -> Option<Execution> {
        self.running.get(job).map(|entry| entry.value().clone())
    }

    /// Stops a running execution, returning false if it is not running here
    pub fn cancel(&self, job: &JobRef, reason: &str) -> bool {
        match self.execution(job) {
            Some(execution) => {
                tracing::info!("Stopping {}: {}", job, reason);
                execution.stop(reason);
                true
            }
            None => false,
        }
    }

    /// Live status if running here, otherwise the last persisted one
    pub async fn status(&self, job: &JobRef) -> Status {
        if let Some(execution) = self.execution(job) {
            return execution.status();
        }
        match self.store.get_job_detail(&job.job_name, job.job_id).await {
            Ok(detail) => detail.status,
            Err(_) => Status::NotRun,
        }
    }

    /// Runs a prepared execution to its terminal status
    pub async fn run(&self, execution: Execution) -> Completion {
        let job = execution.job.clone();
        let workdir = self.settings.workspace.join(&job.job_name);
        let started = Utc::now();
        let clock = Instant::now();

        let parameters = {
            let mut detail = lock(&execution.detail);
            detail.transition(Status::Running);
            detail.start_time = Some(started);
            detail.parameter.clone()
        };
        execution.output.job_started(started);
        tracing::info!("Execution {} started", job);

        let mut ctx = ExecutionContext::new(
            &job.job_name,
            job.job_id,
            workdir.clone(),
            parameters,
            execution.token.clone(),
            execution.output.clone(),
        )
        .with_file_dirs(
            self.store.artifact_dir(&job.job_name, job.job_id),
            self.store.report_dir(&job.job_name, job.job_id),
        );

        let outcome = match fs::create_dir_all(&workdir).await {
            Ok(()) => {
                self.persist(&execution).await;
                let (done, saver) = self.spawn_snapshot_saver(execution.clone());
                let outcome = self.run_stages(&execution, &mut ctx).await;
                done.cancel();
                let _ = saver.await;
                outcome
            }
            Err(e) => Err(ExecutionFault::Failed(anyhow::Error::new(e).context(format!(
                "Failed to create workspace {}",
                workdir.display()
            )))),
        };

        let (status, error) = match outcome {
            Ok(()) => (Status::Success, None),
            Err(ExecutionFault::Cancelled) => (Status::Stop, Some(execution.stop_reason())),
            Err(fault) => (Status::Fail, Some(fault.to_string())),
        };

        let duration_ms = elapsed_ms(clock);
        {
            let mut detail = lock(&execution.detail);
            detail.transition(status);
            detail.error = error.clone();
            detail.duration_ms = duration_ms;
        }
        execution.output.job_finished(Utc::now(), duration_ms);
        self.persist(&execution).await;

        self.step_timers.remove(&job);
        self.running.remove(&job);

        match &error {
            Some(error) => tracing::warn!("Execution {} finished {}: {}", job, status, error),
            None => tracing::info!("Execution {} finished {}", job, status),
        }
        Completion { job, status, error }
    }

    async fn run_stages(
        &self,
        execution: &Execution,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionFault> {
        let stage_count = lock(&execution.detail).stages.len();

        for index in 0..stage_count {
            // Stages after a cancel stay NOTRUN
            if execution.token.is_cancelled() {
                return Err(ExecutionFault::Cancelled);
            }

            let started = Utc::now();
            let clock = Instant::now();
            let (name, steps) = {
                let mut detail = lock(&execution.detail);
                let stage = &mut detail.stages[index];
                stage.status = Status::Running;
                stage.start_time = Some(started);
                let steps: Vec<Step> = stage.steps.iter().map(|s| s.step.clone()).collect();
                (stage.name.clone(), steps)
            };
            execution.output.new_stage(&name, started);
            self.persist(execution).await;
            tracing::debug!("Execution {} entering stage {}", execution.job, name);

            let mut stack: Vec<Box<dyn Action>> = Vec::new();
            let mut failure = None;

            for (step_index, step) in steps.iter().enumerate() {
                self.step_timers.insert(execution.job.clone(), Instant::now());
                let step_clock = Instant::now();
                {
                    let mut detail = lock(&execution.detail);
                    let step = &mut detail.stages[index].steps[step_index];
                    step.status = Status::Running;
                    step.start_time = Some(Utc::now());
                }
                execution.output.new_step(&step.name);

                let outcome = self.run_step(execution, ctx, step, &mut stack).await;
                {
                    let mut detail = lock(&execution.detail);
                    let step = &mut detail.stages[index].steps[step_index];
                    step.status = status_of(&outcome);
                    step.duration_ms = elapsed_ms(step_clock);
                }

                if let Err(fault) = outcome {
                    match &fault {
                        ExecutionFault::Cancelled => execution.output.write_line(format!(
                            "Step {} stopped: {}",
                            step.name,
                            execution.stop_reason()
                        )),
                        fault => execution
                            .output
                            .write_line(format!("Step {} failed: {}", step.name, fault)),
                    }
                    failure = Some(fault);
                    break;
                }
            }
            self.step_timers.remove(&execution.job);

            while let Some(mut action) = stack.pop() {
                if let Err(fault) = contained(action.post(ctx)).await {
                    tracing::warn!("Cleanup in {} failed: {}", execution.job, fault);
                    execution.output.write_line(format!("Cleanup failed: {fault}"));
                }
            }

            let outcome = match failure {
                Some(fault) => Err(fault),
                None => Ok(()),
            };
            let duration_ms = elapsed_ms(clock);
            {
                let mut detail = lock(&execution.detail);
                let stage = &mut detail.stages[index];
                stage.status = status_of(&outcome);
                stage.duration_ms = duration_ms;
            }
            execution.output.stage_finished(Utc::now(), duration_ms);
            self.persist(execution).await;

            outcome?;
        }

        Ok(())
    }

    async fn run_step(
        &self,
        execution: &Execution,
        ctx: &mut ExecutionContext,
        step: &Step,
        stack: &mut Vec<Box<dyn Action>>,
    ) -> Result<(), ExecutionFault> {
        if let Some(environment) = &step.runs_on {
            match self.registry.environment(step) {
                Some(action) => self.run_action(execution, ctx, action, stack).await?,
                None => ctx.output.write_line(format!(
                    "Environment `{environment}` is not available, running on host"
                )),
            }
        }

        let action = self.registry.create(step);
        self.run_action(execution, ctx, action, stack).await
    }

    /// Runs `pre` and `hook`, stacking the action for cleanup once `pre` succeeds
    async fn run_action(
        &self,
        execution: &Execution,
        ctx: &mut ExecutionContext,
        mut action: Box<dyn Action>,
        stack: &mut Vec<Box<dyn Action>>,
    ) -> Result<(), ExecutionFault> {
        let token = execution.token.clone();

        guarded(&token, action.pre(ctx)).await?;
        let hooked = guarded(&token, action.hook(ctx)).await;
        stack.push(action);

        if let Some(result) = hooked? {
            lock(&execution.detail).result.merge(result);
        }
        Ok(())
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    async fn persist(&self, execution: &Execution) {
        let snapshot = execution.snapshot();
        if let Err(e) = self.store.save_job_detail(&snapshot).await {
            tracing::warn!("Failed to save snapshot of {}: {}", execution.job, e);
        }
        let log = execution.output.content();
        if let Err(e) = self
            .store
            .save_log(&execution.job.job_name, execution.job.job_id, &log)
            .await
        {
            tracing::warn!("Failed to save log of {}: {}", execution.job, e);
        }
    }

    /// Refreshes live durations and persists them until `done` fires
    fn spawn_snapshot_saver(&self, execution: Execution) -> (CancellationToken, JoinHandle<()>) {
        let done = CancellationToken::new();
        let stop = done.clone();
        let store = Arc::clone(&self.store);
        let interval = self.settings.snapshot_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot = {
                    let mut detail = lock(&execution.detail);
                    refresh_durations(&mut detail, Utc::now());
                    detail.clone()
                };
                if let Err(e) = store.save_job_detail(&snapshot).await {
                    tracing::warn!("Failed to save snapshot of {}: {}", execution.job, e);
                }
                let log = execution.output.content();
                if let Err(e) = store
                    .save_log(&execution.job.job_name, execution.job.job_id, &log)
                    .await
                {
                    tracing::warn!("Failed to save log of {}: {}", execution.job, e);
                }
            }
        });

        (done, handle)
    }

    /// Stops every execution whose current step started over `step_timeout` ago
    pub fn check_timeouts(&self, now: Instant) -> Vec<JobRef> {
        let timeout = self.settings.step_timeout;
        let expired: Vec<JobRef> = self
            .step_timers
            .iter()
            .filter(|timer| now.saturating_duration_since(*timer.value()) > timeout)
            .map(|timer| timer.key().clone())
            .collect();

        for job in &expired {
            self.step_timers.remove(job);
            tracing::warn!("Step of {} exceeded {:?}", job, timeout);
            self.cancel(job, &format!("timeout: step exceeded {timeout:?}"));
        }
        expired
    }

    pub fn spawn_watchdog(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                executor.check_timeouts(Instant::now());
            }
        })
    }
}

fn status_of(outcome: &Result<(), ExecutionFault>) -> Status {
    match outcome {
        Ok(()) => Status::Success,
        Err(ExecutionFault::Cancelled) => Status::Stop,
        Err(_) => Status::Fail,
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn since_ms(start: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
    start.map(|start| u64::try_from((now - start).num_milliseconds()).unwrap_or(0))
}

fn refresh_durations(detail: &mut JobDetail, now: DateTime<Utc>) {
    if let Some(ms) = since_ms(detail.start_time, now) {
        detail.duration_ms = ms;
    }
    for stage in detail.stages.iter_mut().filter(|s| s.status == Status::Running) {
        if let Some(ms) = since_ms(stage.start_time, now) {
            stage.duration_ms = ms;
        }
        for step in stage.steps.iter_mut().filter(|s| s.status == Status::Running) {
            if let Some(ms) = since_ms(step.start_time, now) {
                step.duration_ms = ms;
            }
        }
    }
}
