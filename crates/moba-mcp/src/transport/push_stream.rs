//! Push-stream (SSE) transport.
//!
//! Clients open `GET /sse` to receive outbound messages as server-sent events
//! and post inbound messages to `POST /messages?session_id=<id>`. Every
//! outbound event carries its sequence number as the SSE event id; a client
//! that reconnects with `GET /sse?session_id=<id>` and a `Last-Event-ID`
//! header receives everything it missed that is still in the replay window,
//! in order and exactly once, before live delivery resumes.

use super::{
    ChannelConnection, ChannelListener, Connection, Inbound, MessageSink, ReplayBuffer,
    ReplayEvent, ResumeOutcome, decode_frame,
};
use crate::codec;
use crate::error::TransportError;
use crate::protocol::Envelope;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header carrying the client's resume cursor.
pub const LAST_EVENT_ID: &str = "last-event-id";

const INBOUND_BUFFER: usize = 64;
const ACCEPT_BUFFER: usize = 64;

/// Shared state of the push-stream routes.
pub struct PushStreamState {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    connections: mpsc::Sender<Box<dyn Connection>>,
    replay_capacity: usize,
}

impl PushStreamState {
    pub fn new(connections: mpsc::Sender<Box<dyn Connection>>, replay_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            connections,
            replay_capacity,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

struct Outbound {
    replay: ReplayBuffer,
    live: Option<mpsc::Sender<ReplayEvent>>,
    closed: bool,
}

/// Server side of one push-stream session.
struct StreamSession {
    id: String,
    inbound: mpsc::Sender<Inbound>,
    outbound: Mutex<Outbound>,
    live_capacity: usize,
}

impl StreamSession {
    fn outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the live subscriber, replaying events after `cursor` first.
    fn attach(&self, cursor: u64) -> (ResumeOutcome, mpsc::Receiver<ReplayEvent>) {
        let (tx, rx) = mpsc::channel(self.live_capacity);
        let mut outbound = self.outbound();
        let outcome = outbound.replay.resume_after(cursor);
        outbound.live = Some(tx);
        (outcome, rx)
    }

    fn close(&self) {
        let mut outbound = self.outbound();
        outbound.closed = true;
        outbound.live = None;
    }
}

/// Outbound half handed to the session engine.
struct StreamSink {
    session: Arc<StreamSession>,
}

#[async_trait]
impl MessageSink for StreamSink {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let data = codec::encode(&envelope)?;
        let mut outbound = self.session.outbound();
        if outbound.closed {
            return Err(TransportError::Closed);
        }
        let event = outbound.replay.push(data);
        if let Some(live) = &outbound.live {
            match live.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!(
                        session_id = %self.session.id,
                        seq = event.seq,
                        "Subscriber is lagging; detaching until it reconnects"
                    );
                    outbound.live = None;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id = %self.session.id, "Subscriber went away");
                    outbound.live = None;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    session_id: Option<String>,
}

/// Build the push-stream router.
pub fn create_router(state: Arc<PushStreamState>, max_message_bytes: usize) -> Router {
    Router::new()
        .route("/sse", get(handle_sse))
        .route("/messages", post(handle_message))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_message_bytes))
        .with_state(state)
}

/// Bind the push-stream transport and start serving.
pub async fn bind(
    addr: &str,
    replay_capacity: usize,
    max_message_bytes: usize,
    shutdown: CancellationToken,
) -> Result<(ChannelListener, SocketAddr), TransportError> {
    let (tx, rx) = mpsc::channel(ACCEPT_BUFFER);
    let state = Arc::new(PushStreamState::new(tx, replay_capacity));
    let local = super::serve(create_router(state, max_message_bytes), addr, shutdown).await?;
    info!(address = %local, "Push-stream transport listening");
    Ok((ChannelListener::new(rx), local))
}

fn parse_cursor(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn message_event(event: ReplayEvent) -> Event {
    Event::default()
        .event("message")
        .id(event.seq.to_string())
        .data(event.data)
}

async fn handle_sse(
    State(state): State<Arc<PushStreamState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    match query.session_id {
        Some(id) => resume_stream(&state, &id, parse_cursor(&headers)).await,
        None => open_stream(&state).await,
    }
}

async fn open_stream(state: &Arc<PushStreamState>) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let session = Arc::new(StreamSession {
        id: id.clone(),
        inbound: inbound_tx,
        outbound: Mutex::new(Outbound {
            replay: ReplayBuffer::new(state.replay_capacity),
            live: None,
            closed: false,
        }),
        live_capacity: state.replay_capacity.max(1),
    });

    let (_, live) = session.attach(0);
    state.sessions.write().await.insert(id.clone(), session.clone());

    let cleanup_state = Arc::clone(state);
    let cleanup_session = Arc::clone(&session);
    let cleanup_id = id.clone();
    let connection = ChannelConnection::new(
        inbound_rx,
        Arc::new(StreamSink { session }),
        Some(id.clone()),
        false,
    )
    .on_close(move || {
        cleanup_session.close();
        tokio::spawn(async move {
            cleanup_state.sessions.write().await.remove(&cleanup_id);
        });
    });

    if state.connections.send(Box::new(connection)).await.is_err() {
        state.sessions.write().await.remove(&id);
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    info!(session_id = %id, "Push-stream session opened");

    let endpoint = format!("/messages?session_id={}", id);
    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint));
        let mut live = live;
        while let Some(event) = live.recv().await {
            yield Ok(message_event(event));
        }
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("ping"))
        .into_response()
}

async fn resume_stream(state: &Arc<PushStreamState>, id: &str, cursor: Option<u64>) -> Response {
    let Some(session) = state.sessions.read().await.get(id).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    let cursor = cursor.unwrap_or(0);
    let (outcome, live) = session.attach(cursor);
    if let ResumeOutcome::Gap { missed, .. } = &outcome {
        warn!(
            session_id = %id,
            cursor,
            missed,
            "Resume cursor is older than the replay window; replaying from the oldest retained event"
        );
    }
    let replay = outcome.into_events();
    debug!(session_id = %id, cursor, replayed = replay.len(), "Push-stream session resumed");

    let stream = async_stream::stream! {
        for event in replay {
            yield Ok::<_, Infallible>(message_event(event));
        }
        let mut live = live;
        while let Some(event) = live.recv().await {
            yield Ok(message_event(event));
        }
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("ping"))
        .into_response()
}

async fn handle_message(
    State(state): State<Arc<PushStreamState>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Response {
    let Some(id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };
    let Some(session) = state.sessions.read().await.get(&id).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    if session.inbound.send(decode_frame(&body)).await.is_err() {
        return (StatusCode::GONE, "session is closed").into_response();
    }
    StatusCode::ACCEPTED.into_response()
}

async fn handle_health(State(state): State<Arc<PushStreamState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "moba-mcp",
        "transport": "push-stream",
        "sessions": state.session_count().await,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn setup() -> (Router, Arc<PushStreamState>, mpsc::Receiver<Box<dyn Connection>>) {
        let (tx, rx) = mpsc::channel(4);
        let state = Arc::new(PushStreamState::new(tx, 8));
        (create_router(state.clone(), 1024), state, rx)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _, _rx) = setup();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_post_to_unknown_session_is_404() {
        let (app, _, _rx) = setup();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/messages?session_id=nope")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_open_post_and_receive() {
        let (app, state, mut rx) = setup();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut conn = rx.recv().await.unwrap();
        let id = conn.session_hint().unwrap();
        assert_eq!(state.session_count().await, 1);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/messages?session_id={}", id))
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        match conn.recv().await {
            Inbound::Message(e) => assert_eq!(e, Envelope::request(1, "ping", None)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_replays_missed_events_once() {
        let (tx, _rx) = mpsc::channel(4);
        let state = Arc::new(PushStreamState::new(tx, 8));
        let (inbound, _inbound_rx) = mpsc::channel(1);
        let session = Arc::new(StreamSession {
            id: "s".into(),
            inbound,
            outbound: Mutex::new(Outbound {
                replay: ReplayBuffer::new(8),
                live: None,
                closed: false,
            }),
            live_capacity: 8,
        });
        state.sessions.write().await.insert("s".into(), session.clone());

        let (_, first) = session.attach(0);
        let sink = StreamSink {
            session: session.clone(),
        };
        for i in 1..=3 {
            sink.send(Envelope::notification("n", Some(json!({"i": i}))))
                .await
                .unwrap();
        }
        drop(first);

        // Client saw event 1, then dropped.
        let (outcome, _live) = session.attach(1);
        let seqs: Vec<_> = outcome.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);

        // Reconnecting at the same cursor after 3 was acknowledged yields nothing old.
        let (outcome, _live) = session.attach(3);
        assert!(outcome.events().is_empty());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_detached() {
        let (inbound, _inbound_rx) = mpsc::channel(1);
        let session = Arc::new(StreamSession {
            id: "s".into(),
            inbound,
            outbound: Mutex::new(Outbound {
                replay: ReplayBuffer::new(8),
                live: None,
                closed: false,
            }),
            live_capacity: 1,
        });
        let (_, mut live) = session.attach(0);
        let sink = StreamSink {
            session: session.clone(),
        };
        sink.send(Envelope::notification("a", None)).await.unwrap();
        sink.send(Envelope::notification("b", None)).await.unwrap();
        assert!(session.outbound().live.is_none());
        assert_eq!(live.recv().await.unwrap().seq, 1);

        // Both events remain available for replay.
        let (outcome, _) = session.attach(0);
        assert_eq!(outcome.events().len(), 2);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (inbound, _inbound_rx) = mpsc::channel(1);
        let session = Arc::new(StreamSession {
            id: "s".into(),
            inbound,
            outbound: Mutex::new(Outbound {
                replay: ReplayBuffer::new(8),
                live: None,
                closed: false,
            }),
            live_capacity: 1,
        });
        session.close();
        let sink = StreamSink { session };
        assert!(matches!(
            sink.send(Envelope::notification("a", None)).await,
            Err(TransportError::Closed)
        ));
    }
}
