//! Worker Engine
//!
//! Owns the worker side of the master stream and hands execute requests to
//! the local executor:
//! - Registers on connect and sends heartbeats
//! - Starts and cancels executions on the master's request
//! - Streams new output with a detail snapshot while a job runs
//! - Reports the final log, produced files and the result on completion
//! - Answers live status queries
//!
//! Outgoing messages go through one outbox that outlives a connection, so a
//! reconnect picks up where the previous stream stopped.

use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::domain::node::Node;
use tether_core::domain::status::{CANCELLED_BY_REQUEST, Status};
use tether_core::dto::message::{
    Body, ExecuteRequest, ExecutionResult, JobRef, LogChunk, Message, StatusReport,
};
use tether_core::transport::TransportError;

use crate::client::MasterClient;
use crate::config::Config;
use crate::executor::{Execution, Executor, ExecutorError};

const OUTBOX_CAPACITY: usize = 256;

/// Why a session with the master ended
#[derive(Debug, PartialEq)]
pub enum SessionEnd {
    Disconnected,
    Shutdown,
}

pub struct WorkerEngine {
    config: Config,
    node: Node,
    executor: Arc<Executor>,
    outbox: mpsc::Sender<Message>,
    queue: Mutex<mpsc::Receiver<Message>>,

    /// A message whose send failed, retried first on the next session
    pending: Mutex<Option<Message>>,
    shutdown: CancellationToken,
}

impl WorkerEngine {
    pub fn new(config: Config, node: Node, executor: Arc<Executor>) -> Arc<Self> {
        let (outbox, queue) = mpsc::channel(OUTBOX_CAPACITY);
        Arc::new(Self {
            config,
            node,
            executor,
            outbox,
            queue: Mutex::new(queue),
            pending: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Serves the master until shutdown, reconnecting after connection loss
    pub async fn run(self: Arc<Self>, client: MasterClient) -> anyhow::Result<()> {
        let heartbeat = self.spawn_heartbeat();

        let mut stream = tokio::select! {
            _ = self.shutdown.cancelled() => {
                heartbeat.abort();
                return Ok(());
            }
            stream = client.connect_with_retry() => match stream {
                Ok(stream) => stream,
                Err(e) => {
                    heartbeat.abort();
                    return Err(e);
                }
            },
        };

        loop {
            match self.serve(stream).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Disconnected => {
                    warn!("Lost connection to master {}, reconnecting", client.master_addr());
                }
            }

            stream = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                stream = client.reconnect() => stream,
            };
        }

        heartbeat.abort();
        Ok(())
    }

    /// Requests a graceful unregister and stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drives one connection until it drops or the engine shuts down
    pub async fn serve<S>(self: &Arc<Self>, stream: S) -> SessionEnd
    where
        S: Stream<Item = Result<Message, TransportError>>
            + Sink<Message, Error = TransportError>
            + Unpin,
    {
        let (mut sink, mut inbound) = stream.split();
        let mut queue = self.queue.lock().await;

        let retry = self.pending.lock().await.take();
        if let Some(message) = retry {
            if let Err(e) = sink.send(message.clone()).await {
                warn!("Failed to resend {}: {}", message.body.kind(), e);
                *self.pending.lock().await = Some(message);
                return SessionEnd::Disconnected;
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    if let Err(e) = sink.send(Message::unregister(self.node.clone())).await {
                        debug!("Unregister not delivered: {}", e);
                    }
                    info!("Unregistered from master");
                    return SessionEnd::Shutdown;
                }
                frame = inbound.next() => match frame {
                    Some(Ok(message)) => {
                        let Some(reply) = self.handle(message).await else {
                            continue;
                        };
                        let reply = Message::new(self.node.clone(), reply);
                        if let Err(e) = sink.send(reply.clone()).await {
                            warn!("Failed to send {} to master: {}", reply.body.kind(), e);
                            *self.pending.lock().await = Some(reply);
                            return SessionEnd::Disconnected;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Stream from master failed: {}", e);
                        return SessionEnd::Disconnected;
                    }
                    None => {
                        info!("Master closed the connection");
                        return SessionEnd::Disconnected;
                    }
                },
                outgoing = queue.recv() => {
                    // The engine holds a sender, so the queue never closes
                    let Some(message) = outgoing else {
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = sink.send(message.clone()).await {
                        warn!("Failed to send {} to master: {}", message.body.kind(), e);
                        *self.pending.lock().await = Some(message);
                        return SessionEnd::Disconnected;
                    }
                }
            }
        }
    }

    async fn send(&self, body: Body) {
        let kind = body.kind();
        if self
            .outbox
            .send(Message::new(self.node.clone(), body))
            .await
            .is_err()
        {
            warn!("Outbox closed, {} dropped", kind);
        }
    }

    // =========================================================================
    // Inbound messages
    // =========================================================================

    /// Acts on a master request, returning the reply to write back
    ///
    /// Replies go straight to the stream rather than through the outbox, which
    /// this session is the only one to drain.
    async fn handle(self: &Arc<Self>, message: Message) -> Option<Body> {
        match message.body {
            Body::Execute(request) => self.start_execution(request),
            Body::Cancel(job) => self.cancel_execution(job).await,
            Body::StatusQuery(job) => {
                let status = self.executor.status(&job).await;
                Some(Body::StatusResult(StatusReport {
                    job_name: job.job_name,
                    job_id: job.job_id,
                    status,
                }))
            }
            Body::Error(report) => {
                warn!("Master reported: {}", report.message);
                None
            }
            other => {
                debug!("Ignoring {} from master", other.kind());
                None
            }
        }
    }

    fn start_execution(self: &Arc<Self>, request: ExecuteRequest) -> Option<Body> {
        let job = request.job_ref();
        match self.executor.prepare(&request) {
            Ok(execution) => {
                info!("Received execution {}", job);
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.drive(execution).await });
                None
            }
            Err(ExecutorError::AlreadyRunning(job)) => {
                debug!("Duplicate execute for {} ignored", job);
                None
            }
            Err(e) => {
                warn!("Rejected execution {}: {}", job, e);
                Some(Body::Result(ExecutionResult {
                    job_name: job.job_name,
                    job_id: job.job_id,
                    status: Status::Fail,
                    error: Some(e.to_string()),
                }))
            }
        }
    }

    async fn cancel_execution(&self, job: JobRef) -> Option<Body> {
        if self.executor.cancel(&job, CANCELLED_BY_REQUEST) {
            return None;
        }

        // Not running here; settle the master's view of it
        let status = self.executor.status(&job).await;
        let (status, error) = if status.is_terminal() {
            (status, None)
        } else {
            (Status::Stop, Some(CANCELLED_BY_REQUEST.to_string()))
        };
        warn!("Cancel for {} which is not running here, reporting {}", job, status);
        Some(Body::Result(ExecutionResult {
            job_name: job.job_name,
            job_id: job.job_id,
            status,
            error,
        }))
    }

    // =========================================================================
    // Execution reporting
    // =========================================================================

    /// Runs an execution and reports everything it produced
    async fn drive(self: Arc<Self>, execution: Execution) {
        let streamer = self.spawn_log_sender(execution.clone());
        let completion = self.executor.run(execution.clone()).await;

        // Always abort log sender
        streamer.abort();
        let _ = streamer.await;

        let job = completion.job.clone();

        // The full log heals any chunk lost to a reconnect
        self.send(Body::Log(Box::new(LogChunk {
            job_name: job.job_name.clone(),
            job_id: job.job_id,
            offset: 0,
            content: execution.output.content(),
            detail: execution.snapshot(),
        })))
        .await;

        match self
            .executor
            .store()
            .collect_files(&job.job_name, job.job_id)
            .await
        {
            Ok(files) => {
                if !files.is_empty() {
                    info!("Sending {} file(s) for {}", files.len(), job);
                }
                for file in files {
                    self.send(Body::File(file)).await;
                }
            }
            Err(e) => warn!("Failed to collect files of {}: {}", job, e),
        }

        self.send(Body::Result(ExecutionResult {
            job_name: job.job_name,
            job_id: job.job_id,
            status: completion.status,
            error: completion.error,
        }))
        .await;
    }

    /// Spawns a background task to send new output periodically
    fn spawn_log_sender(self: &Arc<Self>, execution: Execution) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(engine.config.log_send_interval);
            let mut reported = None;

            loop {
                ticker.tick().await;

                let (offset, content) = execution.output.new_content();
                let detail = execution.snapshot();
                if content.is_empty() && reported == Some(detail.status) {
                    continue;
                }
                reported = Some(detail.status);

                engine
                    .send(Body::Log(Box::new(LogChunk {
                        job_name: execution.job.job_name.clone(),
                        job_id: execution.job.job_id,
                        offset,
                        content,
                        detail,
                    })))
                    .await;
            }
        })
    }

    /// Starts a background task to send heartbeats
    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let outbox = self.outbox.clone();
        let node = self.node.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                debug!("Sending heartbeat");

                // A full outbox means the master is unreachable; skip this beat
                if let Err(e) = outbox.try_send(Message::heartbeat(node.clone())) {
                    debug!("Heartbeat skipped: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tether_core::store::FileJobStore;
    use tether_core::transport::framed;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    use crate::action::ActionRegistry;
    use crate::executor::ExecutorSettings;
    use tether_core::transport::MessageCodec;

    const JOB: &str = "name: build\nstages:\n  A:\n    steps:\n      - name: s1\n        run: echo from-the-worker\n";

    struct Harness {
        _dir: TempDir,
        engine: Arc<WorkerEngine>,
        master: Framed<DuplexStream, MessageCodec>,
        session: JoinHandle<SessionEnd>,
    }

    fn engine(dir: &TempDir) -> Arc<WorkerEngine> {
        let mut config = Config::new("w1".to_string(), "127.0.0.1:7070".to_string());
        config.log_send_interval = Duration::from_millis(20);

        let executor = Arc::new(Executor::new(
            Arc::new(FileJobStore::new(dir.path().join("store"))),
            ActionRegistry::new(),
            ExecutorSettings {
                workspace: dir.path().join("workdir"),
                step_timeout: Duration::from_secs(60),
                snapshot_interval: Duration::from_millis(50),
            },
        ));
        WorkerEngine::new(config, Node::new("w1", "127.0.0.1"), executor)
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let (master_io, worker_io) = tokio::io::duplex(256 * 1024);
        let serving = Arc::clone(&engine);
        let session = tokio::spawn(async move { serving.serve(framed(worker_io)).await });

        Harness {
            _dir: dir,
            engine,
            master: framed(master_io),
            session,
        }
    }

    fn master() -> Node {
        Node::new("master", "127.0.0.1:7070")
    }

    async fn next(master: &mut Framed<DuplexStream, MessageCodec>) -> Message {
        time::timeout(Duration::from_secs(10), master.next())
            .await
            .expect("timed out waiting for the worker")
            .expect("worker closed the stream")
            .expect("bad frame")
    }

    #[tokio::test]
    async fn test_execution_reports_log_then_result() {
        let mut h = harness();
        h.master
            .send(Message::new(
                master(),
                Body::Execute(ExecuteRequest {
                    job_name: "build".to_string(),
                    pipeline_file: JOB.to_string(),
                    job_id: 4,
                }),
            ))
            .await
            .unwrap();

        let mut logs = Vec::new();
        let result = loop {
            match next(&mut h.master).await.body {
                Body::Log(chunk) => logs.push(*chunk),
                Body::Result(result) => break result,
                other => panic!("unexpected {other:?}"),
            }
        };

        assert_eq!(result.job_id, 4);
        assert_eq!(result.status, Status::Success);

        let last = logs.last().expect("no log sent");
        assert_eq!(last.offset, 0);
        assert!(last.content.contains("from-the-worker"));
        assert_eq!(last.detail.status, Status::Success);
    }

    #[tokio::test]
    async fn test_unknown_jobs_are_settled() {
        let mut h = harness();
        let job = JobRef::new("ghost", 9);

        h.master
            .send(Message::new(master(), Body::StatusQuery(job.clone())))
            .await
            .unwrap();
        match next(&mut h.master).await.body {
            Body::StatusResult(report) => assert_eq!(report.status, Status::NotRun),
            other => panic!("unexpected {other:?}"),
        }

        h.master
            .send(Message::new(master(), Body::Cancel(job)))
            .await
            .unwrap();
        match next(&mut h.master).await.body {
            Body::Result(result) => {
                assert_eq!(result.status, Status::Stop);
                assert_eq!(result.error.as_deref(), Some(CANCELLED_BY_REQUEST));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_definition_fails_without_running() {
        let mut h = harness();
        h.master
            .send(Message::new(
                master(),
                Body::Execute(ExecuteRequest {
                    job_name: "build".to_string(),
                    pipeline_file: "name: build\nstages: {}\n".to_string(),
                    job_id: 1,
                }),
            ))
            .await
            .unwrap();

        match next(&mut h.master).await.body {
            Body::Result(result) => {
                assert_eq!(result.status, Status::Fail);
                assert!(result.error.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_unregisters() {
        let mut h = harness();
        h.engine.shutdown();

        assert_eq!(next(&mut h.master).await.body, Body::Unregister);
        assert_eq!(h.session.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_master_disconnect_ends_session() {
        let h = harness();
        drop(h.master);
        assert_eq!(h.session.await.unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reconnects_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = MasterClient::new(addr, Node::new("w1", "127.0.0.1"));
        let running = tokio::spawn(Arc::clone(&engine).run(client));

        // Accept the first session, then take the master away for good
        let (socket, _) = listener.accept().await.unwrap();
        let mut session = framed(socket);
        let first = time::timeout(Duration::from_secs(10), session.next())
            .await
            .expect("worker never registered")
            .unwrap()
            .unwrap();
        assert_eq!(first.body, Body::Register);
        drop(session);
        drop(listener);

        time::sleep(Duration::from_secs(3600)).await;
        assert!(!running.is_finished());

        engine.shutdown();
        time::timeout(Duration::from_secs(5), running)
            .await
            .expect("run ignored shutdown")
            .unwrap()
            .unwrap();
    }
}
