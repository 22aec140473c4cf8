//! Pipe transport.
//!
//! Carries envelopes over a reader/writer pair, normally the process's stdin
//! and stdout. Frames are newline-delimited JSON by default or prefixed with a
//! 4-byte big-endian length. A pipe has exactly one connection.

use super::{Connection, Inbound, Listener, MessageSink, decode_frame};
use crate::codec::{self, DecodeError};
use crate::error::TransportError;
use crate::protocol::Envelope;
use async_trait::async_trait;
use futures::StreamExt;
use moba_core::config::Framing;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

enum FrameReader<R> {
    Lines(FramedRead<R, LinesCodec>),
    LengthDelimited(FramedRead<R, LengthDelimitedCodec>),
}

/// Listener yielding the single pipe connection.
pub struct PipeListener<R, W> {
    connection: Option<PipeConnection<R, W>>,
}

impl<R, W> PipeListener<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, framing: Framing, max_message_bytes: usize) -> Self {
        Self {
            connection: Some(PipeConnection::new(reader, writer, framing, max_message_bytes)),
        }
    }
}

/// Listener over the process's stdin and stdout.
pub fn stdio(
    framing: Framing,
    max_message_bytes: usize,
) -> PipeListener<tokio::io::Stdin, tokio::io::Stdout> {
    PipeListener::new(tokio::io::stdin(), tokio::io::stdout(), framing, max_message_bytes)
}

#[async_trait]
impl<R, W> Listener for PipeListener<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn accept(&mut self) -> Option<Box<dyn Connection>> {
        self.connection
            .take()
            .map(|c| Box::new(c) as Box<dyn Connection>)
    }
}

/// The one connection of a pipe.
pub struct PipeConnection<R, W> {
    reader: FrameReader<R>,
    sink: Arc<PipeSink<W>>,
    closed: bool,
}

impl<R, W> PipeConnection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, framing: Framing, max_message_bytes: usize) -> Self {
        let reader = match framing {
            Framing::Newline => FrameReader::Lines(FramedRead::new(
                reader,
                LinesCodec::new_with_max_length(max_message_bytes),
            )),
            Framing::LengthDelimited => FrameReader::LengthDelimited(FramedRead::new(
                reader,
                LengthDelimitedCodec::builder()
                    .length_field_length(4)
                    .max_frame_length(max_message_bytes)
                    .new_codec(),
            )),
        };
        Self {
            reader,
            sink: Arc::new(PipeSink {
                writer: Mutex::new(Some(writer)),
                framing,
            }),
            closed: false,
        }
    }
}

#[async_trait]
impl<R, W> Connection for PipeConnection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Inbound {
        if self.closed {
            return Inbound::Closed;
        }
        loop {
            let inbound = match &mut self.reader {
                FrameReader::Lines(lines) => match lines.next().await {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        decode_frame(line.as_bytes())
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        Inbound::Malformed(oversized())
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        debug!(error = %e, "Pipe read failed");
                        Inbound::Closed
                    }
                    None => Inbound::Closed,
                },
                FrameReader::LengthDelimited(frames) => match frames.next().await {
                    Some(Ok(frame)) => decode_frame(&frame),
                    Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                        // Oversized frames leave the stream unsynchronized.
                        warn!(error = %e, "Rejecting oversized frame");
                        self.closed = true;
                        Inbound::Malformed(oversized())
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "Pipe read failed");
                        Inbound::Closed
                    }
                    None => Inbound::Closed,
                },
            };
            if matches!(inbound, Inbound::Closed) {
                self.closed = true;
            }
            return inbound;
        }
    }

    fn sink(&self) -> Arc<dyn MessageSink> {
        self.sink.clone()
    }

    async fn close(&mut self) {
        self.closed = true;
        self.sink.shutdown().await;
    }
}

fn oversized() -> DecodeError {
    DecodeError {
        offset: 0,
        snippet: String::new(),
        reason: "message exceeds the maximum frame size".to_string(),
        id: None,
    }
}

/// Serialized writer half of a pipe.
pub struct PipeSink<W> {
    writer: Mutex<Option<W>>,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin + Send> PipeSink<W> {
    async fn shutdown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.flush().await;
            let _ = writer.shutdown().await;
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for PipeSink<W> {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let text = codec::encode(&envelope)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        match self.framing {
            Framing::Newline => {
                writer.write_all(text.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            Framing::LengthDelimited => {
                let len = u32::try_from(text.len()).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
                })?;
                writer.write_all(&len.to_be_bytes()).await?;
                writer.write_all(text.as_bytes()).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, duplex};

    #[tokio::test]
    async fn test_newline_round_trip() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        let mut listener = PipeListener::new(server_read, server_write, Framing::Newline, 1024);
        let mut conn = listener.accept().await.unwrap();
        assert!(listener.accept().await.is_none());

        client_write
            .write_all(b"\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        match conn.recv().await {
            Inbound::Message(e) => assert_eq!(e, Envelope::request(1, "ping", None)),
            other => panic!("unexpected {:?}", other),
        }

        conn.sink()
            .send(Envelope::response(1.into(), json!({})))
            .await
            .unwrap();
        let mut lines = BufReader::new(client_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 1);

        drop(client_write);
        assert!(matches!(conn.recv().await, Inbound::Closed));
    }

    #[tokio::test]
    async fn test_malformed_line_is_reported() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let mut conn = PipeConnection::new(server_read, server_write, Framing::Newline, 1024);

        client_write.write_all(b"{\"id\":3,\"method\":\n").await.unwrap();
        match conn.recv().await {
            Inbound::Malformed(e) => assert_eq!(e.id, Some(3.into())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_line_is_malformed() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let mut conn = PipeConnection::new(server_read, server_write, Framing::Newline, 16);

        client_write
            .write_all(b"{\"id\":1,\"method\":\"a-very-long-method\"}\n")
            .await
            .unwrap();
        assert!(matches!(conn.recv().await, Inbound::Malformed(_)));
    }

    #[tokio::test]
    async fn test_length_delimited_framing() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let mut conn =
            PipeConnection::new(server_read, server_write, Framing::LengthDelimited, 1024);

        let body = br#"{"id":"a","method":"tools/list"}"#;
        client_write
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client_write.write_all(body).await.unwrap();
        match conn.recv().await {
            Inbound::Message(e) => assert_eq!(e, Envelope::request("a", "tools/list", None)),
            other => panic!("unexpected {:?}", other),
        }

        conn.sink()
            .send(Envelope::response("a".into(), json!(null)))
            .await
            .unwrap();
        let mut len = [0u8; 4];
        client_read.read_exact(&mut len).await.unwrap();
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        client_read.read_exact(&mut frame).await.unwrap();
        assert_eq!(codec::decode(&frame).unwrap(), Envelope::response("a".into(), json!(null)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (_client, server) = duplex(64);
        let (server_read, server_write) = tokio::io::split(server);
        let mut conn = PipeConnection::new(server_read, server_write, Framing::Newline, 64);
        let sink = conn.sink();
        conn.close().await;
        assert!(matches!(
            sink.send(Envelope::notification("x", None)).await,
            Err(TransportError::Closed)
        ));
    }
}
