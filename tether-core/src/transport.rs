//! Message framing for master/worker streams
//!
//! Each `Message` is JSON-encoded inside a length-delimited frame. Both ends
//! wrap their socket in `framed` and use the resulting `Sink`/`Stream`; frames
//! on one connection are delivered in send order.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use crate::dto::message::Message;

/// Largest accepted frame; file transfers dominate
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("connection to {0} is closed")]
    Closed(String),

    #[error("no connection for node {0}")]
    NotConnected(String),
}

/// Length-delimited JSON codec for `Message`
#[derive(Debug)]
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

/// Wraps a byte stream into a message sink/stream
pub fn framed<T>(io: T) -> Framed<T, MessageCodec>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, MessageCodec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::Node;
    use crate::dto::message::{Body, ExecuteRequest, JobRef};
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (a, b) = tokio::io::duplex(1024);
        let mut sender = framed(a);
        let mut receiver = framed(b);
        let node = Node::new("w1", "127.0.0.1");

        let sent = vec![
            Message::register(node.clone()),
            Message::new(
                node.clone(),
                Body::Execute(ExecuteRequest {
                    job_name: "build".into(),
                    pipeline_file: "name: build\n".into(),
                    job_id: 1,
                }),
            ),
            Message::new(node.clone(), Body::Cancel(JobRef::new("build", 1))),
            Message::heartbeat(node),
        ];

        let to_send = sent.clone();
        let writer = tokio::spawn(async move {
            for msg in to_send {
                sender.send(msg).await.unwrap();
            }
        });

        let mut received = Vec::new();
        for _ in 0..sent.len() {
            received.push(receiver.next().await.unwrap().unwrap());
        }
        writer.await.unwrap();

        assert_eq!(received, sent);
    }

    #[test]
    fn test_garbage_frame_is_a_codec_error() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();
        assert!(matches!(codec.decode(&mut buf), Err(TransportError::Codec(_))));
    }
}
