//! Transport adapters.
//!
//! Every transport turns its wire into a stream of [`Connection`]s. A
//! connection yields decoded envelopes in receipt order and exposes a
//! [`MessageSink`] that any task may use to send outbound envelopes.
//!
//! - [`pipe`]: one connection over a reader/writer pair (stdin/stdout).
//! - [`push_stream`]: SSE outbound channel with resumable replay.
//! - [`http`]: streamable HTTP, stateless or session-tracked.

pub mod http;
pub mod pipe;
pub mod push_stream;
mod replay;

pub use replay::{ReplayBuffer, ReplayEvent, ResumeOutcome};

use crate::codec::DecodeError;
use crate::error::TransportError;
use crate::protocol::Envelope;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Result of one receive on a connection.
#[derive(Debug)]
pub enum Inbound {
    Message(Envelope),
    /// A frame arrived but did not decode.
    Malformed(DecodeError),
    /// The peer went away or the connection was closed.
    Closed,
}

/// Outbound half of a connection. Cheap to clone via `Arc`.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// One client connection.
#[async_trait]
pub trait Connection: Send {
    /// Next inbound message, in receipt order.
    async fn recv(&mut self) -> Inbound;

    fn sink(&self) -> Arc<dyn MessageSink>;

    /// Session token assigned by the transport, if it tracks sessions itself.
    fn session_hint(&self) -> Option<String> {
        None
    }

    /// Whether this connection is a one-shot stateless exchange.
    fn is_stateless(&self) -> bool {
        false
    }

    /// Release transport resources. Idempotent.
    async fn close(&mut self);
}

/// Source of new connections.
#[async_trait]
pub trait Listener: Send {
    /// Next accepted connection, or `None` once the transport has stopped.
    async fn accept(&mut self) -> Option<Box<dyn Connection>>;
}

/// Listener backed by a channel fed from request handlers.
pub struct ChannelListener {
    rx: mpsc::Receiver<Box<dyn Connection>>,
}

impl ChannelListener {
    pub fn new(rx: mpsc::Receiver<Box<dyn Connection>>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn accept(&mut self) -> Option<Box<dyn Connection>> {
        self.rx.recv().await
    }
}

/// Connection whose inbound side is an mpsc channel, used by the HTTP
/// transports where request handlers push decoded messages.
pub(crate) struct ChannelConnection {
    inbound: mpsc::Receiver<Inbound>,
    sink: Arc<dyn MessageSink>,
    session_hint: Option<String>,
    stateless: bool,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelConnection {
    pub(crate) fn new(
        inbound: mpsc::Receiver<Inbound>,
        sink: Arc<dyn MessageSink>,
        session_hint: Option<String>,
        stateless: bool,
    ) -> Self {
        Self {
            inbound,
            sink,
            session_hint,
            stateless,
            on_close: None,
        }
    }

    pub(crate) fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn recv(&mut self) -> Inbound {
        self.inbound.recv().await.unwrap_or(Inbound::Closed)
    }

    fn sink(&self) -> Arc<dyn MessageSink> {
        Arc::clone(&self.sink)
    }

    fn session_hint(&self) -> Option<String> {
        self.session_hint.clone()
    }

    fn is_stateless(&self) -> bool {
        self.stateless
    }

    async fn close(&mut self) {
        self.inbound.close();
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

/// Bind `addr` and serve `router` until `shutdown` fires.
///
/// Returns the bound address once the socket is listening; a bind failure is
/// reported immediately.
pub(crate) async fn serve(
    router: axum::Router,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<SocketAddr, TransportError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| TransportError::BindFailed {
            address: addr.to_string(),
            source,
        })?;
    let local = listener.local_addr()?;

    let app = router.layer(TraceLayer::new_for_http());
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server failed");
        }
    });

    Ok(local)
}

/// Decode a raw frame into an [`Inbound`].
pub(crate) fn decode_frame(bytes: &[u8]) -> Inbound {
    match crate::codec::decode(bytes) {
        Ok(envelope) => Inbound::Message(envelope),
        Err(e) => Inbound::Malformed(e),
    }
}
