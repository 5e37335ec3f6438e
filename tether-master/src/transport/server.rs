//! Connection accept loop and per-connection reader/writer tasks

use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use tether_core::dto::message::{Body, Message};
use tether_core::transport::{TransportError, framed};

use super::{Connections, router};
use crate::service::engine::MasterEngine;

/// Accepts worker connections until the listener fails
pub async fn serve(listener: TcpListener, engine: Arc<MasterEngine>) -> anyhow::Result<()> {
    tracing::info!("Transport listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        tracing::debug!("Connection from {}", peer);
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            handle_connection(stream, engine).await;
            tracing::debug!("Connection from {} closed", peer);
        });
    }
}

/// Drives one worker connection until it closes
///
/// The first message must be a register; everything after it is routed in
/// arrival order.
pub async fn handle_connection<T>(io: T, engine: Arc<MasterEngine>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, mut stream) = framed(io).split();

    let node = match stream.next().await {
        Some(Ok(Message {
            node,
            body: Body::Register,
        })) => node,
        Some(Ok(other)) => {
            tracing::warn!(
                "Connection from {} opened with {}, expected register",
                other.node,
                other.body.kind()
            );
            return;
        }
        Some(Err(e)) => {
            tracing::warn!("Failed to read register message: {}", e);
            return;
        }
        None => return,
    };

    let key = node.key();
    let (outbound, queue) = Connections::channel();
    let (closing, closed) = oneshot::channel();
    let writer = tokio::spawn(write_loop(
        key.clone(),
        sink,
        queue,
        engine.connections().clone(),
        closed,
    ));
    engine.attach(&node, outbound.clone());

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(message) => {
                if message.node != node {
                    tracing::warn!(
                        "Dropping {} claiming to be {} on the connection of {}",
                        message.body.kind(),
                        message.node,
                        node
                    );
                    continue;
                }
                let leaving = matches!(message.body, Body::Unregister);
                router::route(&engine, message).await;
                if leaving {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Stream from {} failed: {}", key, e);
                break;
            }
        }
    }

    engine.detach(&node, &outbound);
    drop(outbound);
    let _ = closing.send(());
    if let Err(e) = writer.await {
        tracing::warn!("Writer for {} ended abnormally: {}", key, e);
    }
}

/// Drains the connection's queue into the sink
///
/// Stops on the first send error or once `closed` fires. Execute requests that
/// were never delivered, including any still queued, are reported as send
/// failures so they can be redispatched.
async fn write_loop<S>(
    key: String,
    mut sink: S,
    mut queue: mpsc::Receiver<Message>,
    connections: Connections,
    mut closed: oneshot::Receiver<()>,
) where
    S: Sink<Message, Error = TransportError> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = &mut closed => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        // Execute requests are kept so a failed delivery can be redispatched
        let retained = matches!(message.body, Body::Execute(_)).then(|| message.clone());
        let kind = message.body.kind();

        if let Err(e) = sink.send(message).await {
            tracing::warn!("Failed to send {} to {}: {}", kind, key, e);
            if let Some(message) = retained {
                connections.report_failure(&key, message, e.to_string());
            }
            break;
        }
    }

    queue.close();
    let mut lost = 0;
    while let Ok(message) = queue.try_recv() {
        if matches!(message.body, Body::Execute(_)) {
            connections.report_failure(&key, message, "connection closed");
            lost += 1;
        }
    }
    if lost > 0 {
        tracing::warn!("{} queued execute request(s) for {} not delivered", lost, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tether_core::domain::node::Node;
    use tether_core::domain::status::Status;
    use tether_core::dto::message::{ExecuteRequest, ExecutionResult};
    use tether_core::store::FileJobStore;
    use tokio::time;

    use crate::config::Config;
    use crate::transport::SendFailure;

    const JOB: &str = "name: build\nstages:\n  A:\n    steps:\n      - name: s1\n        run: echo a\n";

    async fn next(stream: &mut (impl futures::Stream<Item = Result<Message, TransportError>> + Unpin)) -> Message {
        time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("bad frame")
    }

    #[tokio::test]
    async fn test_worker_session_over_stream() {
        let dir = TempDir::new().unwrap();
        let engine = MasterEngine::start(
            Config::default(),
            Arc::new(FileJobStore::new(dir.path())),
        );
        engine.create_job(JOB).await.unwrap();

        let (master_io, worker_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(master_io, Arc::clone(&engine)));

        let node = Node::new("w1", "10.0.0.1");
        let (mut sink, mut stream) = framed(worker_io).split();
        sink.send(Message::register(node.clone())).await.unwrap();

        // Registration is processed before the connection is usable
        for _ in 0..50 {
            if engine.is_valid_node(&node.key()) {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }

        let detail = engine.execute_job("build").await.unwrap();
        let Body::Execute(request) = next(&mut stream).await.body else {
            panic!("expected execute");
        };
        assert_eq!(request.job_id, detail.id);

        sink.send(Message::new(
            node.clone(),
            Body::Result(ExecutionResult {
                job_name: "build".into(),
                job_id: detail.id,
                status: Status::Success,
                error: None,
            }),
        ))
        .await
        .unwrap();
        sink.send(Message::unregister(node.clone())).await.unwrap();

        for _ in 0..50 {
            if !engine.is_valid_node(&node.key()) {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.is_valid_node(&node.key()));
        assert_eq!(
            engine.get_job_detail("build", detail.id).await.unwrap().status,
            Status::Success
        );
    }

    #[tokio::test]
    async fn test_connection_must_start_with_register() {
        let dir = TempDir::new().unwrap();
        let engine = MasterEngine::start(
            Config::default(),
            Arc::new(FileJobStore::new(dir.path())),
        );

        let (master_io, worker_io) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(handle_connection(master_io, Arc::clone(&engine)));

        let node = Node::new("w1", "10.0.0.1");
        let (mut sink, _stream) = framed(worker_io).split();
        sink.send(Message::heartbeat(node.clone())).await.unwrap();

        time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(engine.nodes().is_empty());
    }

    fn execute(id: u64) -> Message {
        Message::new(
            Node::new("master", "m"),
            Body::Execute(ExecuteRequest {
                job_name: "build".into(),
                pipeline_file: JOB.into(),
                job_id: id,
            }),
        )
    }

    fn failed_ids(failures: &mut mpsc::UnboundedReceiver<SendFailure>) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Ok(failure) = failures.try_recv() {
            match failure.message.body {
                Body::Execute(request) => ids.push(request.job_id),
                other => panic!("unexpected failure for {}", other.kind()),
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_failing_sink_reports_every_queued_execute() {
        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let connections = Connections::new(failures_tx);

        let (outbound, queue) = Connections::channel();
        for id in 1..=3 {
            outbound.send(execute(id)).await.unwrap();
        }
        outbound
            .send(Message::heartbeat(Node::new("master", "m")))
            .await
            .unwrap();

        let sink = Box::pin(futures::sink::unfold((), |(), _: Message| async {
            Err::<(), _>(TransportError::Closed("w1@h".into()))
        }));
        let (_closing, closed) = oneshot::channel();
        write_loop("w1@h".into(), sink, queue, connections, closed).await;

        assert_eq!(failed_ids(&mut failures), vec![1, 2, 3]);
        assert!(outbound.is_closed());
    }

    #[tokio::test]
    async fn test_closed_connection_reports_queued_executes() {
        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let connections = Connections::new(failures_tx);

        let (outbound, queue) = Connections::channel();
        outbound.send(execute(1)).await.unwrap();
        outbound.send(execute(2)).await.unwrap();

        let (closing, closed) = oneshot::channel();
        closing.send(()).unwrap();
        write_loop(
            "w1@h".into(),
            futures::sink::drain().sink_map_err(|e| -> TransportError { match e {} }),
            queue,
            connections,
            closed,
        )
        .await;

        assert_eq!(failed_ids(&mut failures), vec![1, 2]);
    }
}
