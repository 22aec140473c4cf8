//! MCP server.
//!
//! Owns the registry, the dispatcher and every live session. Each accepted
//! connection gets its own task that reads envelopes in receipt order and
//! hands them to the dispatcher; handler execution happens on separate tasks.

use crate::dispatcher::{Dispatcher, DispatcherOptions, Disposition};
use crate::error::McpError;
use crate::protocol::{Envelope, ErrorKind, ErrorObject, methods};
use crate::registry::Registry;
use crate::session::{Session, SessionState};
use crate::transport::{Connection, Inbound, Listener, http, pipe, push_stream};
use moba_core::config::{LimitsConfig, MobaConfig, TransportConfig, TransportKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Live sessions keyed by connection number.
type SessionTable = RwLock<HashMap<u64, Arc<Session>>>;

/// MCP server.
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    limits: LimitsConfig,
    sessions: Arc<SessionTable>,
    next_connection: AtomicU64,
    notify_lock: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

impl McpServer {
    /// Create a new MCP server around a built registry.
    pub fn new(registry: Arc<Registry>, config: &MobaConfig) -> Self {
        let options = DispatcherOptions {
            server_name: config.server.name.clone(),
            server_version: config.server.version.clone(),
            invocation_timeout: config.limits.invocation_timeout(),
            max_concurrent_global: config.limits.max_concurrent_global,
        };
        Self {
            dispatcher: Arc::new(Dispatcher::new(registry, options)),
            limits: config.limits.clone(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_connection: AtomicU64::new(1),
            notify_lock: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.dispatcher.registry()
    }

    /// Handle for collaborators and the process entry point.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            sessions: Arc::clone(&self.sessions),
            notify_lock: Arc::clone(&self.notify_lock),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Bind the configured transport and serve until shutdown.
    pub async fn serve(&self, transport: &TransportConfig) -> Result<(), McpError> {
        let max = transport.max_message_bytes;
        let listener: Box<dyn Listener> = match transport.kind {
            TransportKind::Pipe => {
                info!(framing = ?transport.framing, "Serving over stdio");
                Box::new(pipe::stdio(transport.framing, max))
            }
            TransportKind::PushStream => {
                let (listener, _) = push_stream::bind(
                    &transport.bind_addr(),
                    self.limits.replay_buffer_size,
                    max,
                    self.shutdown.child_token(),
                )
                .await?;
                Box::new(listener)
            }
            TransportKind::StatelessHttp => {
                let options = http::HttpOptions {
                    stateless: transport.stateless,
                    json_response: transport.json_response,
                };
                let (listener, _) = http::bind(
                    &transport.bind_addr(),
                    options,
                    max,
                    self.shutdown.child_token(),
                )
                .await?;
                Box::new(listener)
            }
        };
        self.run(listener).await
    }

    /// Accept connections from `listener` until it stops or shutdown is
    /// requested, then wait for every session to close.
    pub async fn run(&self, mut listener: Box<dyn Listener>) -> Result<(), McpError> {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Some(conn) => {
                        let number = self.next_connection.fetch_add(1, Ordering::Relaxed);
                        let worker = ConnectionWorker {
                            number,
                            dispatcher: Arc::clone(&self.dispatcher),
                            limits: self.limits.clone(),
                            sessions: Arc::clone(&self.sessions),
                            shutdown: self.shutdown.clone(),
                        };
                        tasks.spawn(worker.run(conn));
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        debug!(connections = tasks.len(), "Waiting for connections to close");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Connection task failed");
            }
        }
        info!("MCP server stopped");
        Ok(())
    }
}

/// Cloneable handle to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    sessions: Arc<SessionTable>,
    notify_lock: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Tell every session subscribed to `uri` that the resource changed.
    ///
    /// Calls are delivered in the order they were made.
    pub async fn notify_resource_updated(&self, uri: &str) -> usize {
        let _ordered = self.notify_lock.lock().await;
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();

        let mut delivered = 0;
        for session in sessions {
            if session.state() != SessionState::Ready || !session.is_subscribed(uri) {
                continue;
            }
            let notification = Envelope::notification(
                methods::NOTIFY_RESOURCE_UPDATED,
                Some(json!({ "uri": uri })),
            );
            match session.sink().send(notification).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(session_id = ?session.id(), error = %e, "Failed to deliver update"),
            }
        }
        debug!(uri, delivered, "Resource update broadcast");
        delivered
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drain every session and stop accepting connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Drives one connection.
struct ConnectionWorker {
    number: u64,
    dispatcher: Arc<Dispatcher>,
    limits: LimitsConfig,
    sessions: Arc<SessionTable>,
    shutdown: CancellationToken,
}

enum Exit {
    /// Peer went away; let outstanding work finish.
    Closed,
    Drain,
    Abort,
}

impl ConnectionWorker {
    async fn run(self, mut conn: Box<dyn Connection>) {
        let session = Arc::new(Session::new(
            conn.sink(),
            conn.is_stateless(),
            conn.session_hint(),
            self.limits.max_concurrent_per_session,
        ));
        self.sessions.write().await.insert(self.number, Arc::clone(&session));
        debug!(connection = self.number, stateless = session.is_stateless(), "Connection accepted");

        let exit = self.read_loop(&session, conn.as_mut()).await;
        let grace = self.limits.drain_grace();
        match exit {
            Exit::Drain => self.drain_loop(&session, conn.as_mut(), grace).await,
            Exit::Closed => session.drain(grace).await,
            Exit::Abort => {}
        }

        session.close();
        conn.close().await;
        self.sessions.write().await.remove(&self.number);
        debug!(connection = self.number, session_id = ?session.id(), "Connection closed");
    }

    async fn read_loop(&self, session: &Arc<Session>, conn: &mut dyn Connection) -> Exit {
        let idle = self.limits.session_idle_timeout();
        loop {
            let inbound = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(session_id = ?session.id(), "Server shutting down; draining session");
                    return Exit::Drain;
                }
                received = tokio::time::timeout(idle, conn.recv()) => match received {
                    Ok(inbound) => inbound,
                    Err(_) if session.outstanding_count() > 0 => continue,
                    Err(_) => {
                        info!(session_id = ?session.id(), idle_secs = idle.as_secs(), "Closing idle session");
                        return Exit::Abort;
                    }
                },
            };

            match inbound {
                Inbound::Closed => return Exit::Closed,
                Inbound::Malformed(e) => match e.id.clone() {
                    Some(id) => {
                        warn!(request_id = %id, reason = %e.reason, "Malformed message");
                        let error = decode_error_object(&e);
                        if session.sink().send(Envelope::error(Some(id), error)).await.is_err() {
                            return Exit::Abort;
                        }
                    }
                    None => {
                        warn!(offset = e.offset, reason = %e.reason, "Malformed message without id; closing connection");
                        let _ = session
                            .sink()
                            .send(Envelope::error(None, decode_error_object(&e)))
                            .await;
                        return Exit::Abort;
                    }
                },
                Inbound::Message(envelope) => match self.dispatcher.handle(session, envelope).await {
                    Ok(Disposition::Continue) => {}
                    Ok(Disposition::Drain) => {
                        info!(session_id = ?session.id(), "Client requested shutdown");
                        return Exit::Drain;
                    }
                    Ok(Disposition::Abort(reason)) => {
                        warn!(session_id = ?session.id(), reason = %reason, "Aborting session");
                        return Exit::Abort;
                    }
                    Err(e) => {
                        warn!(session_id = ?session.id(), error = %e, "Transport failed");
                        return Exit::Abort;
                    }
                },
            }
        }
    }

    /// Keep reading while outstanding invocations finish. New requests are
    /// rejected by the dispatcher because the session is draining.
    async fn drain_loop(&self, session: &Arc<Session>, conn: &mut dyn Connection, grace: Duration) {
        session.begin_drain();
        let drained = session.drain(grace);
        tokio::pin!(drained);
        loop {
            tokio::select! {
                _ = &mut drained => return,
                inbound = conn.recv() => match inbound {
                    Inbound::Message(envelope) => {
                        if let Ok(Disposition::Abort(_)) | Err(_) =
                            self.dispatcher.handle(session, envelope).await
                        {
                            session.cancel_all();
                            return;
                        }
                    }
                    Inbound::Malformed(_) => {}
                    Inbound::Closed => {
                        drained.as_mut().await;
                        return;
                    }
                },
            }
        }
    }
}

fn decode_error_object(e: &crate::codec::DecodeError) -> ErrorObject {
    ErrorObject::new(ErrorKind::DecodeError, format!("Parse error: {}", e.reason))
        .with_data(json!({ "offset": e.offset, "snippet": e.snippet }))
}
