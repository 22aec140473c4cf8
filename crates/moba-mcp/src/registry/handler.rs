//! Handler interfaces for tools and resources.
//!
//! Handlers are opaque callables supplied at startup. They receive an
//! [`InvocationContext`] carrying a cancellation token; well-behaved handlers
//! check it at their own yield points. Handlers that ignore it run to
//! completion and their results are discarded.

use crate::error::HandlerError;
use crate::protocol::{RequestId, ResourceContents};
use crate::registry::template::TemplateVars;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to handlers.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub request_id: RequestId,
    pub session_id: Option<String>,
    pub started_at: Instant,
    cancellation: CancellationToken,
}

impl InvocationContext {
    pub fn new(
        request_id: RequestId,
        session_id: Option<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            session_id,
            started_at: Instant::now(),
            cancellation,
        }
    }

    /// Whether the client cancelled or the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the invocation is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Return `Err(HandlerError::cancelled())` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// A callable tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with already-validated arguments.
    async fn invoke(&self, arguments: Value, ctx: InvocationContext) -> Result<Value, HandlerError>;
}

/// A readable resource family.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Produce the contents of `uri`; `vars` holds the template captures.
    async fn read(
        &self,
        uri: &str,
        vars: TemplateVars,
        ctx: InvocationContext,
    ) -> Result<Vec<ResourceContents>, HandlerError>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnTool<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a tool handler.
pub fn tool_fn<F, Fut>(f: F) -> FnTool<F, Fut>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    FnTool {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F, Fut>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn invoke(&self, arguments: Value, ctx: InvocationContext) -> Result<Value, HandlerError> {
        (self.f)(arguments, ctx).await
    }
}

/// Adapter turning an async closure into a [`ResourceHandler`].
pub struct FnResource<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a resource handler.
pub fn resource_fn<F, Fut>(f: F) -> FnResource<F, Fut>
where
    F: Fn(String, TemplateVars, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<ResourceContents>, HandlerError>> + Send,
{
    FnResource {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> ResourceHandler for FnResource<F, Fut>
where
    F: Fn(String, TemplateVars, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<ResourceContents>, HandlerError>> + Send,
{
    async fn read(
        &self,
        uri: &str,
        vars: TemplateVars,
        ctx: InvocationContext,
    ) -> Result<Vec<ResourceContents>, HandlerError> {
        (self.f)(uri.to_string(), vars, ctx).await
    }
}
