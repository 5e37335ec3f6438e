//! Master Engine
//!
//! Owns the dispatcher, the job store and the master side of the transport.
//!
//! - Caller operations: job definitions, executing, re-executing and
//!   cancelling jobs, paged history, logs and live status
//! - Inbound updates from workers: results, log chunks, files, status answers
//! - Send failures: evict the node and redispatch, bounded per execution
//!
//! Every real status transition is published on a broadcast channel.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;

use tether_core::domain::detail::JobDetail;
use tether_core::domain::job::Job;
use tether_core::domain::log::{JobLog, StageLog, StepLog};
use tether_core::domain::node::{Node, NodeSummary};
use tether_core::domain::status::{CANCELLED_BY_REQUEST, Status};
use tether_core::dto::job::{Page, StatusChange};
use tether_core::dto::message::{
    Body, ExecuteRequest, ExecutionResult, FileChunk, JobRef, LogChunk, Message, StatusReport,
};
use tether_core::store::{JobStore, StoreError};
use tether_core::transport::TransportError;

use crate::config::Config;
use crate::service::dispatcher::{DispatchError, Dispatcher};
use crate::transport::{Connections, SendFailure};

const STATUS_EVENT_CAPACITY: usize = 100;

/// Engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("status query for {0} timed out")]
    StatusTimeout(JobRef),

    #[error("stage `{stage}` not found in {job}")]
    StageNotFound { job: JobRef, stage: String },

    #[error("step `{step}` of stage `{stage}` not found in {job}")]
    StepNotFound {
        job: JobRef,
        stage: String,
        step: String,
    },

    #[error("execution {0} is still running")]
    StillRunning(JobRef),

    #[error("execution {0} already started")]
    AlreadyStarted(JobRef),
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub struct MasterEngine {
    config: Config,
    dispatcher: Dispatcher,
    store: Arc<dyn JobStore>,
    connections: Connections,
    status_waiters: DashMap<JobRef, Vec<oneshot::Sender<Status>>>,
    redispatches: DashMap<JobRef, u32>,
    events: broadcast::Sender<StatusChange>,
}

impl MasterEngine {
    /// Builds the engine and spawns its failure and health-check loops
    pub fn start(config: Config, store: Arc<dyn JobStore>) -> Arc<Self> {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        let identity = Node::new("master", config.transport_addr.clone());

        let engine = Arc::new(Self {
            dispatcher: Dispatcher::new(identity, config.node_timeout),
            connections: Connections::new(failures_tx),
            store,
            status_waiters: DashMap::new(),
            redispatches: DashMap::new(),
            events,
            config,
        });

        tokio::spawn(Arc::clone(&engine).run_failure_loop(failures_rx));
        tokio::spawn(Arc::clone(&engine).run_health_check());

        engine
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn subscribe_status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    fn publish(&self, job: &JobRef, status: Status) {
        // No subscribers is fine
        let _ = self.events.send(StatusChange {
            job_name: job.job_name.clone(),
            job_id: job.job_id,
            status,
        });
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Registers a freshly connected node and binds its outbound queue
    pub fn attach(&self, node: &Node, outbound: mpsc::Sender<Message>) {
        match self.dispatcher.register(node.clone()) {
            Ok(()) => {}
            Err(DispatchError::AlreadyRegistered(key)) => {
                tracing::warn!("Node {} reconnected while still registered", key);
                let _ = self.dispatcher.ping(node);
            }
            Err(e) => tracing::warn!("Failed to register {}: {}", node, e),
        }
        self.connections.bind(node.key(), outbound);
    }

    /// Forgets a node whose connection closed, unless it already reconnected
    pub fn detach(&self, node: &Node, outbound: &mpsc::Sender<Message>) {
        if self.connections.unbind_if_same(&node.key(), outbound) {
            let _ = self.dispatcher.unregister(node);
            tracing::info!("Node {} disconnected", node);
        }
    }

    /// Refreshes a node; a connected node that was expired registers again
    pub fn heartbeat(&self, node: &Node) {
        if let Err(DispatchError::UnknownNode(key)) = self.dispatcher.ping(node) {
            tracing::info!("Node {} re-registered by heartbeat", key);
            let _ = self.dispatcher.register(node.clone());
        }
    }

    /// Graceful unregister requested by the node itself
    pub fn leave(&self, node: &Node) {
        if let Err(e) = self.dispatcher.unregister(node) {
            tracing::debug!("Unregister from {} ignored: {}", node, e);
        }
    }

    pub fn nodes(&self) -> Vec<NodeSummary> {
        self.dispatcher.nodes()
    }

    pub fn is_valid_node(&self, key: &str) -> bool {
        self.dispatcher.is_valid_node(key)
    }

    // =========================================================================
    // Job definitions
    // =========================================================================

    pub async fn create_job(&self, source: &str) -> Result<Job> {
        Ok(self.store.create_job(source).await?)
    }

    pub async fn update_job(&self, name: &str, source: &str) -> Result<Job> {
        Ok(self.store.update_job(name, source).await?)
    }

    pub async fn get_job(&self, name: &str) -> Result<Job> {
        Ok(self.store.get_job(name).await?)
    }

    pub async fn delete_job(&self, name: &str) -> Result<()> {
        Ok(self.store.delete_job(name).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs().await?)
    }

    /// Jobs whose name contains `keyword`, paged
    pub async fn search_jobs(
        &self,
        keyword: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Page<Job>> {
        Ok(self.store.search_jobs(keyword, page, page_size).await?)
    }

    pub async fn save_job_params(&self, name: &str, params: BTreeMap<String, String>) -> Result<Job> {
        Ok(self.store.save_job_params(name, params).await?)
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Creates a new execution and dispatches it to a worker
    ///
    /// If no node can be found the execution is marked FAIL and the dispatch
    /// error is returned; it never started anywhere.
    pub async fn execute_job(&self, name: &str) -> Result<JobDetail> {
        let detail = self.store.create_job_detail(name).await?;
        self.start_job(&JobRef::new(name, detail.id)).await?;
        Ok(detail)
    }

    /// Stores a NOTRUN execution without dispatching it
    pub async fn create_job_detail(&self, name: &str) -> Result<JobDetail> {
        Ok(self.store.create_job_detail(name).await?)
    }

    /// Dispatches an execution that was created but never started
    pub async fn execute_job_detail(&self, name: &str, id: u64) -> Result<JobDetail> {
        let detail = self.store.get_job_detail(name, id).await?;
        let job = JobRef::new(name, id);
        if detail.status != Status::NotRun {
            return Err(EngineError::AlreadyStarted(job));
        }

        self.start_job(&job).await?;
        Ok(detail)
    }

    /// Runs a finished execution again as a new execution
    ///
    /// Terminal executions never change, so the retry gets the next id and
    /// the current definition.
    pub async fn re_execute_job(&self, name: &str, id: u64) -> Result<JobDetail> {
        let previous = self.store.get_job_detail(name, id).await?;
        if !previous.status.is_terminal() {
            return Err(EngineError::StillRunning(JobRef::new(name, id)));
        }

        let detail = self.store.create_job_detail(name).await?;
        tracing::info!("Re-executing {}/{} as {}", name, id, detail.id);
        self.start_job(&JobRef::new(name, detail.id)).await?;
        Ok(detail)
    }

    async fn start_job(&self, job: &JobRef) -> Result<()> {
        if let Err(e) = self.dispatch(job).await {
            self.fail_dispatch(job, format!("dispatch failed: {e}")).await;
            return Err(e);
        }
        Ok(())
    }

    async fn dispatch(&self, job: &JobRef) -> Result<Node> {
        let pipeline_file = self.store.get_job_source(&job.job_name).await?;
        let node = self.select_node().await?;

        let message = self.dispatcher.send_job(
            &node,
            ExecuteRequest {
                job_name: job.job_name.clone(),
                pipeline_file,
                job_id: job.job_id,
            },
        );

        // Undeliverable requests come back through the failure loop
        match self.connections.send(&node.key(), message).await {
            Ok(()) => tracing::info!("Execution {} dispatched to {}", job, node),
            Err(e) => tracing::warn!("Execution {} not delivered to {}: {}", job, node, e),
        }
        Ok(node)
    }

    /// Picks a node, retrying while the pool is empty
    async fn select_node(&self) -> Result<Node> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatcher.dispatch_node() {
                Ok(node) => return Ok(node),
                Err(e) if attempt >= self.config.dispatch_retries => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        "No node for dispatch (attempt {}/{}): {}",
                        attempt,
                        self.config.dispatch_retries,
                        e
                    );
                    time::sleep(self.config.dispatch_retry_delay).await;
                }
            }
        }
    }

    async fn fail_dispatch(&self, job: &JobRef, reason: String) {
        self.redispatches.remove(job);

        let error = reason.clone();
        let outcome = self
            .store
            .update_job_detail(
                &job.job_name,
                job.job_id,
                Box::new(move |detail: &mut JobDetail| {
                    if !detail.transition(Status::Fail) {
                        return false;
                    }
                    detail.error = Some(error);
                    true
                }),
            )
            .await;

        match outcome {
            Ok((_, true)) => {
                tracing::error!("Execution {} failed: {}", job, reason);
                self.publish(job, Status::Fail);
            }
            Ok((_, false)) => {}
            Err(e) => tracing::warn!("Cannot record dispatch failure of {}: {}", job, e),
        }
    }

    /// Asks the executing worker to stop; stops locally if no worker has it
    pub async fn cancel_job(&self, name: &str, id: u64) -> Result<JobDetail> {
        let detail = self.store.get_job_detail(name, id).await?;
        if detail.status.is_terminal() {
            return Ok(detail);
        }

        let job = JobRef::new(name, id);
        match self.dispatcher.cancel_job(&job) {
            Ok((node, message)) => {
                if self.connections.send(&node.key(), message).await.is_ok() {
                    tracing::info!("Cancel for {} sent to {}", job, node);
                    return Ok(detail);
                }
            }
            Err(e) => tracing::debug!("Stopping {} locally: {}", job, e),
        }

        let stopped = self.store.mark_stopped(name, id, CANCELLED_BY_REQUEST).await?;
        self.redispatches.remove(&job);
        self.publish(&job, stopped.status);
        Ok(stopped)
    }

    pub async fn get_job_detail(&self, name: &str, id: u64) -> Result<JobDetail> {
        Ok(self.store.get_job_detail(name, id).await?)
    }

    pub async fn job_history(&self, name: &str) -> Result<Vec<JobDetail>> {
        // Unknown jobs are an error rather than an empty history
        self.store.get_job_source(name).await?;
        Ok(self.store.list_job_details(name).await?)
    }

    /// One page of the execution history, newest first
    pub async fn job_history_page(
        &self,
        name: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Page<JobDetail>> {
        self.store.get_job_source(name).await?;
        Ok(self.store.list_job_details_page(name, page, page_size).await?)
    }

    pub async fn delete_job_detail(&self, name: &str, id: u64) -> Result<()> {
        let job = JobRef::new(name, id);
        let detail = self.store.get_job_detail(name, id).await?;
        if detail.status == Status::Running {
            return Err(EngineError::StillRunning(job));
        }

        self.store.delete_job_detail(name, id).await?;
        self.dispatcher.forget(&job);
        Ok(())
    }

    pub async fn job_log(&self, name: &str, id: u64) -> Result<String> {
        self.store.get_job_detail(name, id).await?;
        Ok(self.store.get_log(name, id).await?)
    }

    pub async fn job_stage_log(
        &self,
        name: &str,
        id: u64,
        stage: &str,
        start: usize,
    ) -> Result<StageLog> {
        let detail = self.store.get_job_detail(name, id).await?;
        let log = JobLog::parse(&self.store.get_log(name, id).await?);

        log.stage_log(&detail, stage, start)
            .ok_or_else(|| EngineError::StageNotFound {
                job: JobRef::new(name, id),
                stage: stage.to_string(),
            })
    }

    pub async fn job_step_log(
        &self,
        name: &str,
        id: u64,
        stage: &str,
        step: &str,
    ) -> Result<StepLog> {
        self.store.get_job_detail(name, id).await?;
        let log = JobLog::parse(&self.store.get_log(name, id).await?);

        log.step_log(stage, step)
            .ok_or_else(|| EngineError::StepNotFound {
                job: JobRef::new(name, id),
                stage: stage.to_string(),
                step: step.to_string(),
            })
    }

    /// Directory holding the master's store and settings
    pub fn work_root(&self) -> &Path {
        &self.config.data_dir
    }

    /// Current status, asking the executing worker when the cache is not final
    pub async fn job_status(&self, name: &str, id: u64) -> Result<Status> {
        let detail = self.store.get_job_detail(name, id).await?;
        if detail.status.is_terminal() {
            return Ok(detail.status);
        }

        let job = JobRef::new(name, id);
        let (node, message) = match self.dispatcher.status_query(&job) {
            Ok(query) => query,
            Err(DispatchError::NotDispatched(_)) => return Ok(detail.status),
            Err(e) => return Err(e.into()),
        };

        let (tx, rx) = oneshot::channel();
        self.status_waiters.entry(job.clone()).or_default().push(tx);
        self.connections.send(&node.key(), message).await?;

        let answer = time::timeout(self.config.status_query_timeout, rx).await;
        self.status_waiters
            .remove_if(&job, |_, waiters| waiters.iter().all(|w| w.is_closed()));

        match answer {
            Ok(Ok(status)) => Ok(status),
            _ => Err(EngineError::StatusTimeout(job)),
        }
    }

    // =========================================================================
    // Inbound updates
    // =========================================================================

    pub fn resolve_status_query(&self, report: StatusReport) {
        let job = JobRef::new(report.job_name, report.job_id);
        match self.status_waiters.remove(&job) {
            Some((_, waiters)) => {
                for waiter in waiters {
                    let _ = waiter.send(report.status);
                }
            }
            None => tracing::debug!("Unsolicited status {} for {}", report.status, job),
        }
    }

    /// Records a final status; replays and late results are no-ops
    pub async fn apply_result(&self, result: ExecutionResult) -> Result<()> {
        let job = JobRef::new(result.job_name, result.job_id);
        let status = result.status;
        let error = result.error;

        let (detail, changed) = self
            .store
            .update_job_detail(
                &job.job_name,
                job.job_id,
                Box::new(move |detail: &mut JobDetail| {
                    if !detail.transition(status) {
                        return false;
                    }
                    if detail.error.is_none() {
                        detail.error = error;
                    }
                    true
                }),
            )
            .await?;

        if !changed {
            tracing::debug!(
                "Result {} for {} ignored, execution is {}",
                status,
                job,
                detail.status
            );
            return Ok(());
        }
        self.redispatches.remove(&job);

        tracing::info!("Execution {} finished: {}", job, detail.status);
        self.publish(&job, detail.status);
        Ok(())
    }

    /// Appends streamed output and absorbs the accompanying snapshot
    pub async fn record_log(&self, chunk: LogChunk) -> Result<()> {
        let job = JobRef::new(chunk.job_name, chunk.job_id);

        match self.store.get_job_detail(&job.job_name, job.job_id).await {
            Ok(_) => {}
            Err(StoreError::DetailNotFound { .. }) => {
                tracing::debug!("Log for deleted execution {} dropped", job);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.store
            .append_log(&job.job_name, job.job_id, chunk.offset, &chunk.content)
            .await?;

        let snapshot = chunk.detail;
        let mut before = Status::NotRun;
        let (stored, _) = self
            .store
            .update_job_detail(
                &job.job_name,
                job.job_id,
                Box::new(|stored: &mut JobDetail| {
                    before = stored.status;
                    stored.absorb_snapshot(snapshot);
                    true
                }),
            )
            .await?;

        if stored.status != before {
            if stored.status.is_terminal() {
                self.redispatches.remove(&job);
            }
            self.publish(&job, stored.status);
        }
        Ok(())
    }

    pub async fn save_file(&self, file: FileChunk) -> Result<()> {
        self.store.save_file(&file).await?;
        tracing::debug!(
            "Stored {:?} {} of {}/{} ({} bytes)",
            file.kind,
            file.path,
            file.job_name,
            file.job_id,
            file.data.len()
        );
        Ok(())
    }

    // =========================================================================
    // Background loops
    // =========================================================================

    async fn run_failure_loop(self: Arc<Self>, mut failures: mpsc::UnboundedReceiver<SendFailure>) {
        while let Some(failure) = failures.recv().await {
            self.handle_send_failure(failure).await;
        }
    }

    /// Evicts the unreachable node; lost execute requests go elsewhere
    async fn handle_send_failure(&self, failure: SendFailure) {
        tracing::warn!(
            "Send of {} to {} failed: {}",
            failure.message.body.kind(),
            failure.node_key,
            failure.reason
        );

        if self.dispatcher.unregister_by_key(&failure.node_key).is_ok() {
            tracing::warn!("Node {} evicted after failed send", failure.node_key);
        }
        self.connections.unbind(&failure.node_key);

        if let Body::Execute(request) = failure.message.body {
            self.redispatch(request.job_ref()).await;
        }
    }

    async fn redispatch(&self, job: JobRef) {
        match self.store.get_job_detail(&job.job_name, job.job_id).await {
            Ok(detail) if detail.status.is_terminal() => {
                tracing::debug!("Not redispatching {}, already {}", job, detail.status);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Not redispatching {}: {}", job, e);
                return;
            }
        }

        let attempt = {
            let mut count = self.redispatches.entry(job.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt > self.config.max_redispatch {
            let reason = format!(
                "dispatch failed: gave up after {} redispatch attempts",
                self.config.max_redispatch
            );
            self.fail_dispatch(&job, reason).await;
            return;
        }

        tracing::info!(
            "Redispatching {} (attempt {}/{})",
            job,
            attempt,
            self.config.max_redispatch
        );
        if let Err(e) = self.dispatch(&job).await {
            self.fail_dispatch(&job, format!("dispatch failed: {e}")).await;
        }
    }

    async fn run_health_check(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.health_check_interval);
        loop {
            ticker.tick().await;
            let evicted = self.dispatcher.health_check();
            if !evicted.is_empty() {
                tracing::info!("Evicted {} silent node(s)", evicted.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tether_core::store::FileJobStore;

    const JOB: &str = "name: build\nstages:\n  A:\n    steps:\n      - name: s1\n        run: echo a\n  B:\n    needs: [A]\n    steps:\n      - name: s2\n        run: echo b\n";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.dispatch_retries = 2;
        config.dispatch_retry_delay = Duration::from_millis(10);
        config.status_query_timeout = Duration::from_millis(200);
        config
    }

    async fn engine_with(config: Config) -> (TempDir, Arc<MasterEngine>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileJobStore::new(dir.path()));
        let engine = MasterEngine::start(config, store);
        engine.create_job(JOB).await.unwrap();
        (dir, engine)
    }

    async fn engine() -> (TempDir, Arc<MasterEngine>) {
        engine_with(test_config()).await
    }

    fn connect(engine: &MasterEngine, name: &str) -> (Node, mpsc::Receiver<Message>) {
        let node = Node::new(name, "10.0.0.1");
        let (tx, rx) = Connections::channel();
        engine.attach(&node, tx);
        (node, rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<Message>) -> Message {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("connection queue closed")
    }

    fn result(id: u64, status: Status) -> ExecutionResult {
        ExecutionResult {
            job_name: "build".into(),
            job_id: id,
            status,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_execute_sends_job_to_node() {
        let (_dir, engine) = engine().await;
        let (node, mut rx) = connect(&engine, "w1");

        let detail = engine.execute_job("build").await.unwrap();
        assert_eq!(detail.id, 1);
        assert_eq!(detail.stages[0].name, "A");

        match next_message(&mut rx).await.body {
            Body::Execute(req) => {
                assert_eq!(req.job_id, 1);
                assert_eq!(req.pipeline_file, JOB);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            engine.dispatcher().history(&JobRef::new("build", 1)),
            vec![node.key()]
        );
    }

    #[tokio::test]
    async fn test_no_node_fails_execution() {
        let (_dir, engine) = engine().await;

        let err = engine.execute_job("build").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Dispatch(DispatchError::NoNodeAvailable)
        ));

        let detail = engine.get_job_detail("build", 1).await.unwrap();
        assert_eq!(detail.status, Status::Fail);
        assert!(detail.error.unwrap().starts_with("dispatch failed"));
    }

    #[tokio::test]
    async fn test_failed_send_redispatches_to_other_node() {
        let (_dir, engine) = engine().await;
        let (x, x_rx) = connect(&engine, "x");
        let (y, mut y_rx) = connect(&engine, "y");
        drop(x_rx);

        let detail = engine.execute_job("build").await.unwrap();

        match next_message(&mut y_rx).await.body {
            Body::Execute(req) => assert_eq!(req.job_id, detail.id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!engine.is_valid_node(&x.key()));
        assert!(engine.is_valid_node(&y.key()));
        assert_eq!(
            engine.dispatcher().history(&JobRef::new("build", detail.id)),
            vec![x.key(), y.key()]
        );
    }

    #[tokio::test]
    async fn test_redispatch_is_bounded() {
        let mut config = test_config();
        config.max_redispatch = 1;
        let (_dir, engine) = engine_with(config).await;
        let mut events = engine.subscribe_status_changes();

        // Every node drops what it receives
        let queues: Vec<_> = (0..4).map(|i| connect(&engine, &format!("w{i}")).1).collect();
        drop(queues);

        engine.execute_job("build").await.unwrap();

        let change = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.status, Status::Fail);

        let detail = engine.get_job_detail("build", 1).await.unwrap();
        assert!(detail.error.unwrap().contains("gave up"));
        assert_eq!(
            engine.dispatcher().history(&JobRef::new("build", 1)).len(),
            2
        );
    }

    #[tokio::test]
    async fn test_replayed_result_is_idempotent() {
        let (_dir, engine) = engine().await;
        let (_node, _rx) = connect(&engine, "w1");
        let mut events = engine.subscribe_status_changes();
        engine.execute_job("build").await.unwrap();

        engine.apply_result(result(1, Status::Success)).await.unwrap();
        engine.apply_result(result(1, Status::Success)).await.unwrap();
        engine.apply_result(result(1, Status::Fail)).await.unwrap();

        let detail = engine.get_job_detail("build", 1).await.unwrap();
        assert_eq!(detail.status, Status::Success);

        assert_eq!(events.recv().await.unwrap().status, Status::Success);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_routes_to_assigned_node() {
        let (_dir, engine) = engine().await;
        let (_node, mut rx) = connect(&engine, "w1");
        engine.execute_job("build").await.unwrap();
        next_message(&mut rx).await;

        engine.cancel_job("build", 1).await.unwrap();
        assert_eq!(
            next_message(&mut rx).await.body,
            Body::Cancel(JobRef::new("build", 1))
        );

        engine.apply_result(result(1, Status::Stop)).await.unwrap();
        let detail = engine.cancel_job("build", 1).await.unwrap();
        assert_eq!(detail.status, Status::Stop);
    }

    #[tokio::test]
    async fn test_cancel_without_worker_stops_locally() {
        let (_dir, engine) = engine().await;
        let (node, _rx) = connect(&engine, "w1");
        engine.execute_job("build").await.unwrap();
        engine.leave(&node);

        let detail = engine.cancel_job("build", 1).await.unwrap();
        assert_eq!(detail.status, Status::Stop);
        assert_eq!(detail.error.as_deref(), Some(CANCELLED_BY_REQUEST));
    }

    #[tokio::test]
    async fn test_live_status_query() {
        let (_dir, engine) = engine().await;
        let (_node, mut rx) = connect(&engine, "w1");
        engine.execute_job("build").await.unwrap();
        next_message(&mut rx).await;

        let responder = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let query = next_message(&mut rx).await;
                let Body::StatusQuery(job) = query.body else {
                    panic!("expected status query");
                };
                engine.resolve_status_query(StatusReport {
                    job_name: job.job_name,
                    job_id: job.job_id,
                    status: Status::Running,
                });
                rx
            })
        };

        assert_eq!(engine.job_status("build", 1).await.unwrap(), Status::Running);
        let _rx = responder.await.unwrap();

        // Nobody answers the second time
        assert!(matches!(
            engine.job_status("build", 1).await,
            Err(EngineError::StatusTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_log_chunks_build_the_stage_log() {
        let (_dir, engine) = engine().await;
        let (_node, _rx) = connect(&engine, "w1");
        let mut events = engine.subscribe_status_changes();
        let mut snapshot = engine.execute_job("build").await.unwrap();
        snapshot.transition(Status::Running);
        snapshot.stages[0].status = Status::Running;

        let chunk = |offset: usize, content: &str, detail: &JobDetail| LogChunk {
            job_name: "build".into(),
            job_id: 1,
            offset,
            content: content.into(),
            detail: detail.clone(),
        };

        engine
            .record_log(chunk(0, "[Pipeline] Stage: A\n[Pipeline] Step: s1\n", &snapshot))
            .await
            .unwrap();
        engine
            .record_log(chunk(2, "[2026-03-01 10:00:00] a\n", &snapshot))
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap().status, Status::Running);

        let stage = engine.job_stage_log("build", 1, "A", 1).await.unwrap();
        assert_eq!(stage.last_line, 3);
        assert!(!stage.end);
        assert_eq!(stage.content, "[Pipeline] Step: s1\n[2026-03-01 10:00:00] a");

        assert!(matches!(
            engine.job_stage_log("build", 1, "B", 0).await,
            Err(EngineError::StageNotFound { .. })
        ));
        assert!(matches!(
            engine.delete_job_detail("build", 1).await,
            Err(EngineError::StillRunning(_))
        ));
    }

    fn log_chunk(offset: usize, content: &str, detail: &JobDetail) -> LogChunk {
        LogChunk {
            job_name: "build".into(),
            job_id: detail.id,
            offset,
            content: content.into(),
            detail: detail.clone(),
        }
    }

    #[tokio::test]
    async fn test_terminal_snapshot_clears_redispatch_count() {
        let (_dir, engine) = engine().await;
        let (_node, _rx) = connect(&engine, "w1");
        let mut snapshot = engine.execute_job("build").await.unwrap();
        let job = JobRef::new("build", snapshot.id);
        engine.redispatches.insert(job.clone(), 1);

        snapshot.transition(Status::Running);
        engine
            .record_log(log_chunk(0, "[Pipeline] Stage: A\n", &snapshot))
            .await
            .unwrap();
        assert!(engine.redispatches.contains_key(&job));

        snapshot.transition(Status::Success);
        engine
            .record_log(log_chunk(1, "", &snapshot))
            .await
            .unwrap();
        assert!(!engine.redispatches.contains_key(&job));

        // The late result changes nothing
        engine.apply_result(result(1, Status::Success)).await.unwrap();
        assert!(engine.redispatches.is_empty());
    }

    #[tokio::test]
    async fn test_created_execution_runs_once() {
        let (_dir, engine) = engine().await;
        let (_node, mut rx) = connect(&engine, "w1");

        let detail = engine.create_job_detail("build").await.unwrap();
        assert_eq!(detail.status, Status::NotRun);
        assert!(engine.dispatcher().history(&JobRef::new("build", 1)).is_empty());

        engine.execute_job_detail("build", detail.id).await.unwrap();
        match next_message(&mut rx).await.body {
            Body::Execute(req) => assert_eq!(req.job_id, detail.id),
            other => panic!("unexpected {other:?}"),
        }

        engine.apply_result(result(1, Status::Success)).await.unwrap();
        assert!(matches!(
            engine.execute_job_detail("build", 1).await,
            Err(EngineError::AlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn test_re_execute_creates_a_new_execution() {
        let (_dir, engine) = engine().await;
        let (_node, mut rx) = connect(&engine, "w1");
        let mut snapshot = engine.execute_job("build").await.unwrap();
        next_message(&mut rx).await;

        snapshot.transition(Status::Running);
        engine
            .record_log(log_chunk(0, "[Pipeline] Stage: A\n", &snapshot))
            .await
            .unwrap();
        assert!(matches!(
            engine.re_execute_job("build", 1).await,
            Err(EngineError::StillRunning(_))
        ));

        let mut failed = result(1, Status::Fail);
        failed.error = Some("exit status 1".into());
        engine.apply_result(failed).await.unwrap();

        let retry = engine.re_execute_job("build", 1).await.unwrap();
        assert_eq!(retry.id, 2);
        assert_eq!(retry.status, Status::NotRun);
        match next_message(&mut rx).await.body {
            Body::Execute(req) => assert_eq!(req.job_id, 2),
            other => panic!("unexpected {other:?}"),
        }

        // The failed run stays as it was
        let original = engine.get_job_detail("build", 1).await.unwrap();
        assert_eq!(original.status, Status::Fail);
        assert_eq!(original.error.as_deref(), Some("exit status 1"));

        assert!(matches!(
            engine.re_execute_job("build", 9).await,
            Err(EngineError::Store(StoreError::DetailNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_step_log_and_paged_queries() {
        let (dir, engine) = engine().await;
        let (_node, _rx) = connect(&engine, "w1");
        let mut snapshot = engine.execute_job("build").await.unwrap();
        engine.execute_job("build").await.unwrap();
        snapshot.transition(Status::Running);

        engine
            .record_log(log_chunk(
                0,
                "[Pipeline] Stage: A\n[Pipeline] Step: s1\n[2026-03-01 10:00:00] a\n",
                &snapshot,
            ))
            .await
            .unwrap();

        let step = engine.job_step_log("build", 1, "A", "s1").await.unwrap();
        assert_eq!(step.lines, vec!["[2026-03-01 10:00:00] a"]);
        assert!(matches!(
            engine.job_step_log("build", 1, "A", "s2").await,
            Err(EngineError::StepNotFound { .. })
        ));

        let page = engine.job_history_page("build", 1, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.data[0].id, 2);
        assert!(matches!(
            engine.job_history_page("missing", 1, 1).await,
            Err(EngineError::Store(StoreError::JobNotFound(_)))
        ));

        engine
            .create_job(&JOB.replace("name: build", "name: deploy"))
            .await
            .unwrap();
        let jobs = engine.search_jobs("dep", 0, 0).await.unwrap();
        assert_eq!(jobs.total, 1);
        assert_eq!(jobs.data[0].name, "deploy");

        let mut config = test_config();
        config.data_dir = dir.path().to_path_buf();
        let (_other, other) = engine_with(config).await;
        assert_eq!(other.work_root(), dir.path());
    }
}
