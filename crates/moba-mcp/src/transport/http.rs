//! Streamable HTTP transport.
//!
//! Clients post each message to `POST /mcp`. The reply is either a single
//! JSON body (json-response mode) or a short SSE stream that ends with the
//! terminal message for the request. Cancelling a request ends its open reply
//! with no terminal message: `204 No Content`, or an SSE stream that closes.
//!
//! In stateless mode every POST is an independent one-shot connection and no
//! session token is issued. Otherwise an `initialize` POST opens a session
//! whose token is returned in the `Mcp-Session-Id` header; later POSTs must
//! carry it, `GET /mcp` opens a stream for server notifications and
//! `DELETE /mcp` ends the session.

use super::{
    ChannelConnection, ChannelListener, Connection, Inbound, MessageSink, decode_frame,
};
use crate::codec;
use crate::error::TransportError;
use crate::protocol::{Envelope, ErrorKind, ErrorObject, RequestId, methods};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header carrying the session token.
pub const SESSION_HEADER: &str = "mcp-session-id";

const INBOUND_BUFFER: usize = 64;
const ACCEPT_BUFFER: usize = 64;
const STREAM_BUFFER: usize = 32;

/// How POST replies are shaped and whether sessions are tracked.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpOptions {
    pub stateless: bool,
    pub json_response: bool,
}

/// Shared state of the HTTP routes.
pub struct HttpState {
    options: HttpOptions,
    sessions: RwLock<HashMap<String, Arc<HttpSession>>>,
    connections: mpsc::Sender<Box<dyn Connection>>,
}

impl HttpState {
    pub fn new(connections: mpsc::Sender<Box<dyn Connection>>, options: HttpOptions) -> Self {
        Self {
            options,
            sessions: RwLock::new(HashMap::new()),
            connections,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Default)]
struct Routes {
    /// Open POST replies keyed by the request they wait for.
    waiters: HashMap<RequestId, Vec<mpsc::Sender<Envelope>>>,
    /// `GET /mcp` notification stream.
    standalone: Option<mpsc::Sender<Envelope>>,
    closed: bool,
}

/// Transport side of one HTTP connection.
struct HttpSession {
    id: Option<String>,
    stateless: bool,
    inbound: Mutex<Option<mpsc::Sender<Inbound>>>,
    routes: Mutex<Routes>,
}

impl HttpSession {
    fn new(id: Option<String>, stateless: bool, inbound: mpsc::Sender<Inbound>) -> Self {
        Self {
            id,
            stateless,
            inbound: Mutex::new(Some(inbound)),
            routes: Mutex::new(Routes::default()),
        }
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn inbound(&self) -> Option<mpsc::Sender<Inbound>> {
        self.inbound
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Drop the inbound sender so the connection sees end of stream.
    fn finish_inbound(&self) {
        self.inbound.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    fn wait_for(&self, id: RequestId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut routes = self.routes();
        let list = routes.waiters.entry(id).or_default();
        list.retain(|waiter| !waiter.is_closed());
        list.push(tx);
        rx
    }

    /// End every open reply waiting on `id`. Their POSTs finish without a body.
    fn release(&self, id: &RequestId) -> usize {
        self.routes().waiters.remove(id).map_or(0, |list| list.len())
    }

    fn is_closed(&self) -> bool {
        self.routes().closed
    }

    fn close(&self) {
        let mut routes = self.routes();
        routes.closed = true;
        routes.waiters.clear();
        routes.standalone = None;
    }
}

struct HttpSink {
    session: Arc<HttpSession>,
}

#[async_trait]
impl MessageSink for HttpSink {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let targets: Vec<mpsc::Sender<Envelope>> = {
            let mut routes = self.session.routes();
            if routes.closed {
                return Err(TransportError::Closed);
            }
            match (&envelope, envelope.id()) {
                (Envelope::Response(_) | Envelope::Error(_), Some(id)) => {
                    let mut target = Vec::new();
                    if let Some(list) = routes.waiters.get_mut(id) {
                        list.retain(|waiter| !waiter.is_closed());
                        if !list.is_empty() {
                            target.push(list.remove(0));
                        }
                        if list.is_empty() {
                            routes.waiters.remove(id);
                        }
                    }
                    target
                }
                // An error that names no request concerns every open reply.
                (Envelope::Error(_), None) => {
                    let all: Vec<_> = routes.waiters.values().flatten().cloned().collect();
                    all.into_iter().chain(routes.standalone.clone()).collect()
                }
                _ if self.session.stateless => {
                    routes.waiters.values().flatten().cloned().collect()
                }
                _ => routes.standalone.clone().into_iter().collect(),
            }
        };

        if targets.is_empty() {
            debug!(
                session_id = self.session.id.as_deref().unwrap_or("-"),
                method = envelope.method().unwrap_or(""),
                "No open stream for outbound message; dropping"
            );
        }
        for target in targets {
            let _ = target.send(envelope.clone()).await;
        }
        Ok(())
    }
}

/// Build the HTTP router.
pub fn create_router(state: Arc<HttpState>, max_message_bytes: usize) -> Router {
    Router::new()
        .route(
            "/mcp",
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_message_bytes))
        .with_state(state)
}

/// Bind the HTTP transport and start serving.
pub async fn bind(
    addr: &str,
    options: HttpOptions,
    max_message_bytes: usize,
    shutdown: CancellationToken,
) -> Result<(ChannelListener, SocketAddr), TransportError> {
    let (tx, rx) = mpsc::channel(ACCEPT_BUFFER);
    let state = Arc::new(HttpState::new(tx, options));
    let local = super::serve(create_router(state, max_message_bytes), addr, shutdown).await?;
    info!(
        address = %local,
        stateless = options.stateless,
        json_response = options.json_response,
        "HTTP transport listening"
    );
    Ok((ChannelListener::new(rx), local))
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn envelope_json(envelope: &Envelope) -> serde_json::Value {
    codec::encode(envelope)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(serde_json::Value::Null)
}

fn error_reply(status: StatusCode, id: Option<RequestId>, kind: ErrorKind, message: &str) -> Response {
    let envelope = Envelope::error(id, ErrorObject::new(kind, message));
    (status, Json(envelope_json(&envelope))).into_response()
}

async fn register(state: &Arc<HttpState>, session: Arc<HttpSession>, inbound: mpsc::Receiver<Inbound>) -> bool {
    let cleanup_state = Arc::clone(state);
    let cleanup_session = Arc::clone(&session);
    let connection = ChannelConnection::new(
        inbound,
        Arc::new(HttpSink {
            session: Arc::clone(&session),
        }),
        session.id.clone(),
        session.stateless,
    )
    .on_close(move || {
        cleanup_session.close();
        if let Some(id) = cleanup_session.id.clone() {
            tokio::spawn(async move {
                cleanup_state.sessions.write().await.remove(&id);
            });
        }
    });
    state.connections.send(Box::new(connection)).await.is_ok()
}

async fn handle_post(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = match decode_frame(&body) {
        Inbound::Message(envelope) => envelope,
        Inbound::Malformed(e) => {
            debug!(error = %e, "Rejecting malformed POST body");
            return error_reply(StatusCode::BAD_REQUEST, e.id.clone(), ErrorKind::DecodeError, &e.to_string());
        }
        Inbound::Closed => return StatusCode::BAD_REQUEST.into_response(),
    };

    let (session, created) = if state.options.stateless {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let session = Arc::new(HttpSession::new(None, true, tx));
        if !register(&state, Arc::clone(&session), rx).await {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        (session, false)
    } else {
        match session_header(&headers) {
            Some(id) => match state.sessions.read().await.get(&id).cloned() {
                Some(session) => (session, false),
                None => {
                    return error_reply(
                        StatusCode::NOT_FOUND,
                        envelope.id().cloned(),
                        ErrorKind::InvalidRequest,
                        "unknown session",
                    );
                }
            },
            None if envelope.method() == Some(methods::INITIALIZE) => {
                let id = uuid::Uuid::new_v4().to_string();
                let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
                let session = Arc::new(HttpSession::new(Some(id.clone()), false, tx));
                state.sessions.write().await.insert(id.clone(), Arc::clone(&session));
                if !register(&state, Arc::clone(&session), rx).await {
                    state.sessions.write().await.remove(&id);
                    return StatusCode::SERVICE_UNAVAILABLE.into_response();
                }
                info!(session_id = %id, "HTTP session opened");
                (session, true)
            }
            None => {
                return error_reply(
                    StatusCode::BAD_REQUEST,
                    envelope.id().cloned(),
                    ErrorKind::InvalidRequest,
                    "missing Mcp-Session-Id header",
                );
            }
        }
    };

    let waiter = match &envelope {
        Envelope::Request(r) => Some(session.wait_for(r.id.clone())),
        Envelope::Notification(n) if n.method == methods::NOTIFY_CANCELLED => {
            if let Some(id) = cancelled_request(n.params.as_ref()) {
                let released = session.release(&id);
                debug!(request_id = %id, released, "Released replies for cancelled request");
            }
            None
        }
        _ => None,
    };

    let Some(inbound) = session.inbound() else {
        return error_reply(StatusCode::GONE, envelope.id().cloned(), ErrorKind::Internal, "session is closed");
    };
    if inbound.send(Inbound::Message(envelope)).await.is_err() {
        return StatusCode::GONE.into_response();
    }
    drop(inbound);

    let mut response = match waiter {
        None => {
            if session.stateless {
                session.finish_inbound();
            }
            StatusCode::ACCEPTED.into_response()
        }
        Some(rx) if state.options.json_response => json_reply(session.clone(), rx).await,
        Some(rx) => sse_reply(session.clone(), rx),
    };

    if created {
        if let Some(value) = session.id.as_deref().and_then(|id| HeaderValue::from_str(id).ok()) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    response
}

fn cancelled_request(params: Option<&serde_json::Value>) -> Option<RequestId> {
    params
        .and_then(|p| p.get("requestId"))
        .and_then(RequestId::from_value)
}

/// Wait for the terminal message and answer with it as the body.
async fn json_reply(session: Arc<HttpSession>, mut rx: mpsc::Receiver<Envelope>) -> Response {
    let mut terminal = None;
    while let Some(envelope) = rx.recv().await {
        if envelope.is_terminal() {
            terminal = Some(envelope);
            break;
        }
    }
    if session.stateless {
        session.finish_inbound();
    }
    match terminal {
        Some(envelope) => (StatusCode::OK, Json(envelope_json(&envelope))).into_response(),
        // Released by a cancellation; the request has no terminal message.
        None if !session.is_closed() => StatusCode::NO_CONTENT.into_response(),
        None => error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            None,
            ErrorKind::Internal,
            "connection closed before a reply was produced",
        ),
    }
}

/// Stream messages for the request until its terminal message.
fn sse_reply(session: Arc<HttpSession>, rx: mpsc::Receiver<Envelope>) -> Response {
    let stream = async_stream::stream! {
        let mut rx = rx;
        while let Some(envelope) = rx.recv().await {
            let terminal = envelope.is_terminal();
            match codec::encode(&envelope) {
                Ok(data) => yield Ok::<_, Infallible>(Event::default().event("message").data(data)),
                Err(e) => warn!(error = %e, "Failed to encode outbound message"),
            }
            if terminal {
                break;
            }
        }
        if session.stateless {
            session.finish_inbound();
        }
    };
    Sse::new(stream).into_response()
}

async fn handle_get(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if state.options.stateless {
        return (StatusCode::METHOD_NOT_ALLOWED, "stateless mode has no notification stream")
            .into_response();
    }
    let Some(id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id header").into_response();
    };
    let Some(session) = state.sessions.read().await.get(&id).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    {
        let mut routes = session.routes();
        if routes.closed {
            return (StatusCode::GONE, "session is closed").into_response();
        }
        routes.standalone = Some(tx);
    }
    debug!(session_id = %id, "Notification stream opened");

    let stream = async_stream::stream! {
        let mut rx = rx;
        while let Some(envelope) = rx.recv().await {
            match codec::encode(&envelope) {
                Ok(data) => yield Ok::<_, Infallible>(Event::default().event("message").data(data)),
                Err(e) => warn!(error = %e, "Failed to encode outbound message"),
            }
        }
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("ping"))
        .into_response()
}

async fn handle_delete(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if state.options.stateless {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id header").into_response();
    };
    let Some(session) = state.sessions.write().await.remove(&id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    if let Some(inbound) = session.inbound() {
        let _ = inbound.send(Inbound::Closed).await;
    }
    session.finish_inbound();
    info!(session_id = %id, "HTTP session deleted by client");
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_health(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "moba-mcp",
        "transport": "stateless-http",
        "stateless": state.options.stateless,
        "sessions": state.session_count().await,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn setup(options: HttpOptions) -> (Router, mpsc::Receiver<Box<dyn Connection>>) {
        let (tx, rx) = mpsc::channel(4);
        let state = Arc::new(HttpState::new(tx, options));
        (create_router(state, 4096), rx)
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Answer every request on accepted connections with `{"ok": true}`.
    fn spawn_echo_server(mut rx: mpsc::Receiver<Box<dyn Connection>>) {
        tokio::spawn(async move {
            while let Some(mut conn) = rx.recv().await {
                tokio::spawn(async move {
                    loop {
                        match conn.recv().await {
                            Inbound::Message(Envelope::Request(r)) => {
                                let _ = conn
                                    .sink()
                                    .send(Envelope::response(r.id, json!({"ok": true})))
                                    .await;
                            }
                            Inbound::Message(_) | Inbound::Malformed(_) => {}
                            Inbound::Closed => break,
                        }
                    }
                    conn.close().await;
                });
            }
        });
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_stateless_json_reply() {
        let (app, rx) = setup(HttpOptions {
            stateless: true,
            json_response: true,
        });
        spawn_echo_server(rx);

        let response = app
            .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SESSION_HEADER).is_none());
        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["ok"], true);
    }

    #[tokio::test]
    async fn test_stateless_connection_ends_after_reply() {
        let (app, mut rx) = setup(HttpOptions {
            stateless: true,
            json_response: true,
        });
        let server = tokio::spawn(async move {
            let mut conn = rx.recv().await.unwrap();
            assert!(conn.is_stateless());
            let id = match conn.recv().await {
                Inbound::Message(Envelope::Request(r)) => r.id,
                other => panic!("unexpected {:?}", other),
            };
            conn.sink().send(Envelope::response(id, json!(null))).await.unwrap();
            assert!(matches!(conn.recv().await, Inbound::Closed));
        });

        let response = app
            .oneshot(post(r#"{"id":"x","method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_is_accepted() {
        let (app, rx) = setup(HttpOptions {
            stateless: true,
            json_response: true,
        });
        spawn_echo_server(rx);
        let response = app
            .oneshot(post(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let (app, _rx) = setup(HttpOptions::default());
        let response = app.oneshot(post(r#"{"id":4,"method":"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["id"], 4);
        assert_eq!(body["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_stateful_session_lifecycle() {
        let (app, rx) = setup(HttpOptions {
            stateless: false,
            json_response: true,
        });
        spawn_echo_server(rx);

        // Non-initialize without a session is rejected.
        let response = app
            .clone()
            .oneshot(post(r#"{"id":1,"method":"tools/list"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post(
                r#"{"id":1,"method":"initialize","params":{"protocolVersion":"2025-06-18"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let mut request = post(r#"{"id":2,"method":"tools/list"}"#);
        request
            .headers_mut()
            .insert(SESSION_HEADER, HeaderValue::from_str(&session_id).unwrap());
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], 2);

        let mut request = post(r#"{"id":3,"method":"tools/list"}"#);
        request
            .headers_mut()
            .insert(SESSION_HEADER, HeaderValue::from_static("not-a-session"));
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let delete = Request::builder()
            .method("DELETE")
            .uri("/mcp")
            .header(SESSION_HEADER, &session_id)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let mut request = post(r#"{"id":4,"method":"tools/list"}"#);
        request
            .headers_mut()
            .insert(SESSION_HEADER, HeaderValue::from_str(&session_id).unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sse_reply_ends_after_terminal() {
        let (app, rx) = setup(HttpOptions {
            stateless: true,
            json_response: false,
        });
        spawn_echo_server(rx);
        let response = app
            .oneshot(post(r#"{"id":9,"method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: message"));
        assert!(text.contains(r#""id":9"#));
    }

    #[tokio::test]
    async fn test_abandoned_and_released_waiters_get_no_reply() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Arc::new(HttpSession::new(Some("s".into()), false, tx));
        let sink = HttpSink {
            session: session.clone(),
        };

        // A POST whose client went away is skipped.
        drop(session.wait_for(RequestId::Number(1)));
        let mut live = session.wait_for(RequestId::Number(1));
        sink.send(Envelope::response(RequestId::Number(1), json!("a")))
            .await
            .unwrap();
        assert_eq!(
            live.recv().await,
            Some(Envelope::response(RequestId::Number(1), json!("a")))
        );

        // A released POST ends, and the id no longer routes to it.
        let mut cancelled = session.wait_for(RequestId::Number(2));
        assert_eq!(session.release(&RequestId::Number(2)), 1);
        assert_eq!(cancelled.recv().await, None);
        assert!(session.routes().waiters.is_empty());
    }

    #[test]
    fn test_cancelled_request_id() {
        assert_eq!(
            cancelled_request(Some(&json!({"requestId": 3, "reason": "user"}))),
            Some(RequestId::Number(3))
        );
        assert_eq!(cancelled_request(Some(&json!({}))), None);
        assert_eq!(cancelled_request(None), None);
    }

    #[tokio::test]
    async fn test_stateless_has_no_notification_stream() {
        let (app, _rx) = setup(HttpOptions {
            stateless: true,
            json_response: false,
        });
        let response = app
            .oneshot(Request::builder().uri("/mcp").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
