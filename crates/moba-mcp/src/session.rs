//! Per-connection session state.
//!
//! A session tracks the handshake, the outstanding request ids and the
//! resource subscriptions of one client. All mutable state sits behind one
//! mutex scoped to the session; nothing is shared across sessions.
//!
//! The outstanding-id map is also the gate that guarantees at most one
//! terminal envelope per request: whoever removes the entry first (the
//! handler, the deadline or a cancellation) decides the outcome, and every
//! later attempt is discarded.

use crate::error::TransportError;
use crate::protocol::{ClientInfo, Envelope, ErrorKind, ErrorObject, RequestId};
use crate::registry::InvocationContext;
use crate::transport::MessageSink;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Handshaking,
    Ready,
    Draining,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Handle to an in-flight invocation.
#[derive(Debug, Clone)]
pub struct PendingInvocation {
    pub method: String,
    pub started_at: Instant,
    token: CancellationToken,
}

/// Why a request could not be registered as outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    /// The session is not in `Ready`.
    NotReady(SessionState),
    /// The id is already outstanding.
    DuplicateId,
}

/// Outcome of the handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub session_id: Option<String>,
    pub protocol_version: String,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    id: Option<String>,
    protocol_version: Option<String>,
    client_info: Option<ClientInfo>,
    client_capabilities: Value,
    pending: HashMap<RequestId, PendingInvocation>,
    subscriptions: BTreeSet<String>,
    last_activity: Instant,
}

/// One logical conversation with a client.
pub struct Session {
    stateless: bool,
    hint: Option<String>,
    sink: Arc<dyn MessageSink>,
    permits: Arc<Semaphore>,
    idle: Notify,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("stateless", &self.stateless)
            .field("inner", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in `Handshaking`.
    ///
    /// `hint` is a transport-assigned token that becomes the session id.
    pub fn new(
        sink: Arc<dyn MessageSink>,
        stateless: bool,
        hint: Option<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            stateless,
            hint,
            sink,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            idle: Notify::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Handshaking,
                id: None,
                protocol_version: None,
                client_info: None,
                client_capabilities: Value::Null,
                pending: HashMap::new(),
                subscriptions: BTreeSet::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn id(&self) -> Option<String> {
        self.lock().id.clone()
    }

    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.lock().protocol_version.clone()
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.lock().client_info.clone()
    }

    pub fn client_capabilities(&self) -> Value {
        self.lock().client_capabilities.clone()
    }

    pub fn sink(&self) -> Arc<dyn MessageSink> {
        Arc::clone(&self.sink)
    }

    pub(crate) fn permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }

    /// Record inbound activity for idle tracking.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Complete the handshake and move to `Ready`.
    ///
    /// Returns `None` when the session is past `Handshaking`.
    pub fn complete_handshake(
        &self,
        protocol_version: &str,
        client_info: Option<ClientInfo>,
        client_capabilities: Value,
    ) -> Option<Handshake> {
        let mut inner = self.lock();
        if inner.state != SessionState::Handshaking {
            return None;
        }
        let id = if self.stateless {
            None
        } else {
            Some(
                self.hint
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            )
        };
        inner.id = id.clone();
        inner.protocol_version = Some(protocol_version.to_string());
        inner.client_info = client_info;
        inner.client_capabilities = client_capabilities;
        inner.state = SessionState::Ready;
        debug!(session_id = ?id, protocol_version, "Session ready");
        Some(Handshake {
            session_id: id,
            protocol_version: protocol_version.to_string(),
        })
    }

    /// Register `id` as outstanding and return its invocation context.
    pub fn admit(&self, id: &RequestId, method: &str) -> Result<InvocationContext, AdmitError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Ready {
            return Err(AdmitError::NotReady(inner.state));
        }
        if inner.pending.contains_key(id) {
            return Err(AdmitError::DuplicateId);
        }
        let token = CancellationToken::new();
        inner.pending.insert(
            id.clone(),
            PendingInvocation {
                method: method.to_string(),
                started_at: Instant::now(),
                token: token.clone(),
            },
        );
        Ok(InvocationContext::new(id.clone(), inner.id.clone(), token))
    }

    /// Whether `id` is currently outstanding.
    pub fn is_outstanding(&self, id: &RequestId) -> bool {
        self.lock().pending.contains_key(id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn take_pending(&self, id: &RequestId) -> Option<PendingInvocation> {
        let mut inner = self.lock();
        let taken = inner.pending.remove(id);
        if taken.is_some() && inner.pending.is_empty() {
            self.idle.notify_waiters();
        }
        taken
    }

    /// Send the terminal envelope for `id` if it is still outstanding.
    ///
    /// Returns `Ok(false)` when the result was discarded because the request
    /// was cancelled, timed out or already answered.
    pub async fn settle(&self, id: &RequestId, envelope: Envelope) -> Result<bool, TransportError> {
        let Some(pending) = self.take_pending(id) else {
            debug!(request_id = %id, "Discarding late result");
            return Ok(false);
        };
        debug!(
            request_id = %id,
            method = %pending.method,
            elapsed_ms = pending.started_at.elapsed().as_millis() as u64,
            "Request settled"
        );
        self.sink.send(envelope).await?;
        Ok(true)
    }

    /// Fail `id` with a timeout and signal its handler to stop.
    pub async fn time_out(&self, id: &RequestId, after: Duration) -> Result<bool, TransportError> {
        let Some(pending) = self.take_pending(id) else {
            return Ok(false);
        };
        pending.token.cancel();
        warn!(request_id = %id, method = %pending.method, "Invocation timed out");
        let error = ErrorObject::new(
            ErrorKind::Timeout,
            format!("{} exceeded its deadline of {}ms", pending.method, after.as_millis()),
        );
        self.sink.send(Envelope::error(Some(id.clone()), error)).await?;
        Ok(true)
    }

    /// Cancel `id` at the client's request. No terminal envelope is sent.
    pub fn cancel(&self, id: &RequestId, reason: Option<&str>) -> bool {
        match self.take_pending(id) {
            Some(pending) => {
                pending.token.cancel();
                debug!(request_id = %id, reason = reason.unwrap_or(""), "Request cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding invocation.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.pending.drain().collect()
        };
        for (_, pending) in &drained {
            pending.token.cancel();
        }
        self.idle.notify_waiters();
        drained.len()
    }

    /// Stop accepting requests. Returns `false` if already draining or closed.
    pub fn begin_drain(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Handshaking | SessionState::Ready => {
                inner.state = SessionState::Draining;
                true
            }
            SessionState::Draining | SessionState::Closed => false,
        }
    }

    /// Wait until no invocation is outstanding or `grace` elapses, then
    /// cancel whatever remains.
    pub async fn drain(&self, grace: Duration) {
        self.begin_drain();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            if self.outstanding_count() == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let cancelled = self.cancel_all();
                if cancelled > 0 {
                    warn!(cancelled, "Drain deadline elapsed; cancelling outstanding invocations");
                }
                return;
            }
        }
    }

    /// Move to `Closed`, cancelling anything still outstanding.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.subscriptions.clear();
        }
        self.cancel_all();
    }

    pub fn subscribe(&self, uri: &str) -> bool {
        self.lock().subscriptions.insert(uri.to_string())
    }

    pub fn unsubscribe(&self, uri: &str) -> bool {
        self.lock().subscriptions.remove(uri)
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.lock().subscriptions.contains(uri)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.iter().cloned().collect()
    }
}
