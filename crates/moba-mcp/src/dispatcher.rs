//! Request dispatch.
//!
//! The dispatcher routes each inbound envelope of a session: protocol methods
//! are answered inline, tool calls and resource reads are validated and then
//! run as independent tasks bounded by a per-session and a global permit
//! pool. Every admitted request ends in exactly one terminal envelope unless
//! the client cancels it.

use crate::error::{HandlerError, TransportError};
use crate::protocol::{
    CallToolParams, CancelledParams, Envelope, ErrorKind, ErrorObject, InitializeParams,
    Notification, Request, RequestId, ResourceUriParams, SUPPORTED_PROTOCOL_VERSIONS, methods,
};
use crate::registry::{InvocationContext, Registry, RegisteredTool};
use crate::session::{AdmitError, Session, SessionState};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// What the connection loop should do after a message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The client asked for shutdown; drain the session.
    Drain,
    /// A protocol violation; close the session.
    Abort(String),
}

/// Static dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub server_name: String,
    pub server_version: String,
    pub invocation_timeout: Duration,
    pub max_concurrent_global: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            server_name: "moba-mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            invocation_timeout: Duration::from_secs(30),
            max_concurrent_global: 64,
        }
    }
}

/// Routes envelopes to the registry.
pub struct Dispatcher {
    registry: Arc<Registry>,
    options: DispatcherOptions,
    global_permits: Arc<Semaphore>,
}

type Work = BoxFuture<'static, Result<Value, ErrorObject>>;

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, options: DispatcherOptions) -> Self {
        let global_permits = Arc::new(Semaphore::new(options.max_concurrent_global.max(1)));
        Self {
            registry,
            options,
            global_permits,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one inbound envelope.
    pub async fn handle(
        &self,
        session: &Arc<Session>,
        envelope: Envelope,
    ) -> Result<Disposition, TransportError> {
        session.touch();
        match envelope {
            Envelope::Request(request) => self.handle_request(session, request).await,
            Envelope::Notification(notification) => {
                Ok(self.handle_notification(session, notification))
            }
            Envelope::Response(_) | Envelope::Error(_) => {
                let id = envelope
                    .id()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "null".to_string());
                warn!(id = %id, "Received a reply for a request this server never issued");
                Ok(Disposition::Abort(format!("unexpected reply with id {}", id)))
            }
        }
    }

    async fn handle_request(
        &self,
        session: &Arc<Session>,
        request: Request,
    ) -> Result<Disposition, TransportError> {
        let Request { id, method, params } = request;
        debug!(request_id = %id, method = %method, "Handling request");

        if method == methods::INITIALIZE {
            self.handle_initialize(session, id, params).await?;
            return Ok(Disposition::Continue);
        }

        if session.is_stateless() && session.state() == SessionState::Handshaking {
            session.complete_handshake(SUPPORTED_PROTOCOL_VERSIONS[0], None, Value::Null);
        }

        let ctx = match session.admit(&id, &method) {
            Ok(ctx) => ctx,
            Err(AdmitError::NotReady(state)) => {
                let error = ErrorObject::new(
                    ErrorKind::ProtocolStateError,
                    format!("cannot handle {} while the session is {}", method, state),
                )
                .with_data(json!({ "state": state.to_string() }));
                session.sink().send(Envelope::error(Some(id), error)).await?;
                return Ok(Disposition::Continue);
            }
            Err(AdmitError::DuplicateId) => {
                let error = ErrorObject::new(
                    ErrorKind::ProtocolStateError,
                    format!("request id {} is already outstanding", id),
                );
                session.sink().send(Envelope::error(None, error)).await?;
                return Ok(Disposition::Abort(format!("duplicate request id {}", id)));
            }
        };

        match method.as_str() {
            methods::PING => {
                session.settle(&id, Envelope::response(id.clone(), json!({}))).await?;
            }
            methods::SHUTDOWN => {
                session.settle(&id, Envelope::response(id.clone(), Value::Null)).await?;
                return Ok(Disposition::Drain);
            }
            methods::TOOLS_LIST => {
                let result = json!({ "tools": self.registry.tool_definitions() });
                session.settle(&id, Envelope::response(id.clone(), result)).await?;
            }
            methods::RESOURCES_LIST => {
                let result = json!({ "resources": self.registry.resource_definitions() });
                session.settle(&id, Envelope::response(id.clone(), result)).await?;
            }
            methods::RESOURCES_TEMPLATES_LIST => {
                let result = json!({ "resourceTemplates": self.registry.template_definitions() });
                session.settle(&id, Envelope::response(id.clone(), result)).await?;
            }
            methods::RESOURCES_SUBSCRIBE | methods::RESOURCES_UNSUBSCRIBE => {
                let outcome = self.handle_subscription(session, &method, params);
                self.settle_outcome(session, &id, outcome.map(|_| json!({}))).await?;
            }
            methods::TOOLS_CALL => match self.prepare_tool_call(params, ctx.clone()) {
                Ok(work) => self.spawn_invocation(session, ctx, work),
                Err(error) => self.settle_outcome(session, &id, Err(error)).await?,
            },
            methods::RESOURCES_READ => match self.prepare_resource_read(params, ctx.clone()) {
                Ok(work) => self.spawn_invocation(session, ctx, work),
                Err(error) => self.settle_outcome(session, &id, Err(error)).await?,
            },
            name => match self.registry.resolve_tool(name) {
                Some(tool) => match prepare_tool(tool, params, ctx.clone(), false) {
                    Ok(work) => self.spawn_invocation(session, ctx, work),
                    Err(error) => self.settle_outcome(session, &id, Err(error)).await?,
                },
                None => {
                    let error = ErrorObject::new(
                        ErrorKind::NotFound,
                        format!("Method not found: {}", name),
                    );
                    self.settle_outcome(session, &id, Err(error)).await?;
                }
            },
        }

        Ok(Disposition::Continue)
    }

    async fn handle_initialize(
        &self,
        session: &Arc<Session>,
        id: RequestId,
        params: Option<Value>,
    ) -> Result<(), TransportError> {
        let sink = session.sink();

        if session.state() != SessionState::Handshaking {
            let error = ErrorObject::new(
                ErrorKind::ProtocolStateError,
                format!("session is already {}", session.state()),
            );
            return sink.send(Envelope::error(Some(id), error)).await;
        }

        let params: InitializeParams = match parse_params(params) {
            Ok(p) => p,
            Err(error) => return sink.send(Envelope::error(Some(id), error)).await,
        };

        let version = negotiate_version(&params.protocol_version);
        let client = params.client_info.as_ref().map(|c| c.name.clone());
        let Some(handshake) =
            session.complete_handshake(version, params.client_info, params.capabilities)
        else {
            let error = ErrorObject::new(ErrorKind::ProtocolStateError, "session is already initialized");
            return sink.send(Envelope::error(Some(id), error)).await;
        };

        info!(
            session_id = handshake.session_id.as_deref().unwrap_or("-"),
            client = client.as_deref().unwrap_or("unknown"),
            protocol_version = version,
            "Session initialized"
        );

        let result = json!({
            "protocolVersion": version,
            "serverInfo": {
                "name": self.options.server_name,
                "version": self.options.server_version
            },
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": true, "listChanged": false }
            }
        });
        sink.send(Envelope::response(id, result)).await
    }

    fn handle_notification(&self, session: &Arc<Session>, notification: Notification) -> Disposition {
        match notification.method.as_str() {
            methods::NOTIFY_INITIALIZED => {
                debug!(session_id = ?session.id(), "Client finished initialization");
                Disposition::Continue
            }
            methods::NOTIFY_CANCELLED => {
                match parse_params::<CancelledParams>(notification.params) {
                    Ok(p) => {
                        if !session.cancel(&p.request_id, p.reason.as_deref()) {
                            debug!(request_id = %p.request_id, "Cancellation for unknown or finished request");
                        }
                    }
                    Err(e) => warn!(error = %e.message, "Ignoring malformed cancellation"),
                }
                Disposition::Continue
            }
            methods::NOTIFY_SHUTDOWN | methods::SHUTDOWN => Disposition::Drain,
            other => {
                debug!(method = other, "Ignoring unknown notification");
                Disposition::Continue
            }
        }
    }

    fn handle_subscription(
        &self,
        session: &Arc<Session>,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ErrorObject> {
        let ResourceUriParams { uri } = parse_params(params)?;
        let (descriptor, _) = self.registry.resolve_resource(&uri).ok_or_else(|| {
            ErrorObject::new(ErrorKind::NotFound, format!("Resource not found: {}", uri))
        })?;
        if !descriptor.subscribable {
            return Err(ErrorObject::new(
                ErrorKind::InvalidRequest,
                format!("Resource does not support subscriptions: {}", uri),
            ));
        }
        if method == methods::RESOURCES_SUBSCRIBE {
            session.subscribe(&uri);
        } else {
            session.unsubscribe(&uri);
        }
        Ok(())
    }

    fn prepare_tool_call(&self, params: Option<Value>, ctx: InvocationContext) -> Result<Work, ErrorObject> {
        let CallToolParams { name, arguments } = parse_params(params)?;
        let tool = self.registry.resolve_tool(&name).ok_or_else(|| {
            ErrorObject::new(ErrorKind::NotFound, format!("Tool not found: {}", name))
        })?;
        prepare_tool(tool, arguments, ctx, true)
    }

    fn prepare_resource_read(
        &self,
        params: Option<Value>,
        ctx: InvocationContext,
    ) -> Result<Work, ErrorObject> {
        let ResourceUriParams { uri } = parse_params(params)?;
        let (descriptor, vars) = self.registry.resolve_resource(&uri).ok_or_else(|| {
            ErrorObject::new(ErrorKind::NotFound, format!("Resource not found: {}", uri))
        })?;
        let handler = Arc::clone(&descriptor.handler);
        Ok(Box::pin(async move {
            handler
                .read(&uri, vars, ctx)
                .await
                .map(|contents| json!({ "contents": contents }))
                .map_err(|e| e.to_error_object())
        }))
    }

    async fn settle_outcome(
        &self,
        session: &Arc<Session>,
        id: &RequestId,
        outcome: Result<Value, ErrorObject>,
    ) -> Result<(), TransportError> {
        let envelope = match outcome {
            Ok(result) => Envelope::response(id.clone(), result),
            Err(error) => Envelope::error(Some(id.clone()), error),
        };
        session.settle(id, envelope).await.map(|_| ())
    }

    /// Run `work` on its own task under the session and global limits.
    ///
    /// The handler always runs to completion; when the deadline passes or the
    /// client cancels first, its result is discarded.
    fn spawn_invocation(&self, session: &Arc<Session>, ctx: InvocationContext, work: Work) {
        let session = Arc::clone(session);
        let session_permits = session.permits();
        let global_permits = Arc::clone(&self.global_permits);
        let timeout = self.options.invocation_timeout;
        let id = ctx.request_id.clone();

        let run_ctx = ctx.clone();
        let mut task = tokio::spawn(async move {
            let _session_permit = session_permits
                .acquire_owned()
                .await
                .map_err(|_| ErrorObject::new(ErrorKind::Internal, "session is closing"))?;
            let _global_permit = global_permits
                .acquire_owned()
                .await
                .map_err(|_| ErrorObject::new(ErrorKind::Internal, "server is closing"))?;
            if run_ctx.is_cancelled() {
                return Err(HandlerError::cancelled().to_error_object());
            }
            work.await
        });

        tokio::spawn(async move {
            let outcome = tokio::select! {
                joined = &mut task => Some(joined),
                _ = tokio::time::sleep(timeout) => {
                    if let Err(e) = session.time_out(&id, timeout).await {
                        warn!(request_id = %id, error = %e, "Failed to send timeout error");
                    }
                    None
                }
                _ = ctx.cancelled() => None,
            };

            let joined = match outcome {
                Some(joined) => joined,
                None => task.await,
            };

            let result = joined.unwrap_or_else(|e| {
                Err(ErrorObject::new(
                    ErrorKind::Internal,
                    format!("handler task failed: {}", e),
                ))
            });
            let envelope = match result {
                Ok(value) => Envelope::response(id.clone(), value),
                Err(error) => Envelope::error(Some(id.clone()), error),
            };
            if let Err(e) = session.settle(&id, envelope).await {
                warn!(request_id = %id, error = %e, "Failed to send response");
            }
        });
    }
}

fn prepare_tool(
    tool: &RegisteredTool,
    arguments: Option<Value>,
    ctx: InvocationContext,
    wrap: bool,
) -> Result<Work, ErrorObject> {
    let arguments = or_empty_object(arguments);
    tool.validate(&arguments).map_err(|e| e.to_error_object())?;

    let handler = tool.handler();
    Ok(Box::pin(async move {
        let value = handler
            .invoke(arguments, ctx)
            .await
            .map_err(|e| e.to_error_object())?;
        Ok(if wrap { call_tool_result(value) } else { value })
    }))
}

/// Wrap a raw tool result in the `tools/call` result shape.
fn call_tool_result(value: Value) -> Value {
    let text = match &value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": value,
        "isError": false
    })
}

/// Echo the client's version when supported, otherwise offer the newest.
pub fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

/// Absent and `null` params both mean "no arguments".
fn or_empty_object(params: Option<Value>) -> Value {
    match params {
        None | Some(Value::Null) => json!({}),
        Some(value) => value,
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorObject> {
    serde_json::from_value(or_empty_object(params)).map_err(|e| {
        ErrorObject::new(ErrorKind::ValidationError, format!("Invalid params: {}", e))
    })
}
