//! Master connection
//!
//! Opens the worker's stream to the master and registers on it. Connecting
//! retries with capped exponential backoff since the master may not be ready
//! yet when the worker starts (common in container environments). The first
//! connection gives up after a bounded number of attempts; reconnecting after
//! a lost session never does.

use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use tether_core::domain::node::Node;
use tether_core::dto::message::Message;
use tether_core::transport::{MessageCodec, TransportError, framed};

pub type MasterStream = Framed<TcpStream, MessageCodec>;

/// Connection attempts before the worker gives up at startup
const STARTUP_ATTEMPTS: u32 = 10;
const INITIAL_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Doubling delay, capped at `MAX_DELAY`
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: INITIAL_DELAY,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_DELAY);
        delay
    }
}

pub struct MasterClient {
    master_addr: String,
    node: Node,
}

impl MasterClient {
    pub fn new(master_addr: impl Into<String>, node: Node) -> Self {
        Self {
            master_addr: master_addr.into(),
            node,
        }
    }

    pub fn master_addr(&self) -> &str {
        &self.master_addr
    }

    /// Connects and sends the register message
    pub async fn connect(&self) -> Result<MasterStream, TransportError> {
        let stream = TcpStream::connect(&self.master_addr).await?;
        stream.set_nodelay(true)?;

        let mut stream = framed(stream);
        stream.send(Message::register(self.node.clone())).await?;
        Ok(stream)
    }

    /// Connects with exponential backoff, giving up after `STARTUP_ATTEMPTS`
    pub async fn connect_with_retry(&self) -> anyhow::Result<MasterStream> {
        let mut backoff = Backoff::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.connect().await {
                Ok(stream) => {
                    info!(
                        "Registered with master {} as {} after {} attempt(s)",
                        self.master_addr, self.node, attempt
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    if attempt >= STARTUP_ATTEMPTS {
                        error!(
                            "Failed to connect to master after {} attempts",
                            STARTUP_ATTEMPTS
                        );
                        return Err(anyhow::anyhow!(
                            "Failed to register with master {}: {}",
                            self.master_addr,
                            e
                        ));
                    }

                    let delay = backoff.next();
                    warn!(
                        "Failed to connect to master (attempt {}/{}): {}",
                        attempt, STARTUP_ATTEMPTS, e
                    );
                    warn!("Retrying in {} ms...", delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Connects again after a lost session, retrying until it succeeds
    pub async fn reconnect(&self) -> MasterStream {
        let mut backoff = Backoff::new();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            match self.connect().await {
                Ok(stream) => {
                    info!(
                        "Reconnected to master {} after {} attempt(s)",
                        self.master_addr, attempt
                    );
                    return stream;
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!(
                        "Reconnect to master failed (attempt {}): {}, retrying in {} ms",
                        attempt,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tether_core::dto::message::Body;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_registers_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let node = Node::new("w1", "127.0.0.1");
        let client = MasterClient::new(addr, node.clone());
        let connecting = tokio::spawn(async move { client.connect().await.map(|_| ()) });

        let (socket, _) = listener.accept().await.unwrap();
        let first = framed(socket).next().await.unwrap().unwrap();
        assert_eq!(first.node, node);
        assert_eq!(first.body, Body::Register);

        connecting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_fails_without_master() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = MasterClient::new(addr, Node::new("w1", "127.0.0.1"));
        assert!(matches!(client.connect().await, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = Backoff::new();
        let delays: Vec<Duration> = (0..9).map(|_| backoff.next()).collect();
        assert_eq!(delays[0], INITIAL_DELAY);
        assert_eq!(delays[1], INITIAL_DELAY * 2);
        assert_eq!(delays[8], MAX_DELAY);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_trying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = MasterClient::new(addr, Node::new("w1", "127.0.0.1"));

        // Well past the point where the startup attempts are exhausted
        let outcome = tokio::time::timeout(Duration::from_secs(3600), client.reconnect()).await;
        assert!(outcome.is_err());
        assert!(client.connect_with_retry().await.is_err());
    }
}
