//! # moba-mcp
//!
//! MCP (Model Context Protocol) session and dispatch engine for Moba.
//!
//! The crate turns a registry of tools and resources into an MCP server that
//! any number of clients can talk to concurrently. It provides:
//!
//! - **Message codec**: JSON envelopes with salvage of request ids from
//!   malformed input
//! - **Sessions**: handshake, outstanding-id tracking, cancellation, drain
//! - **Dispatcher**: schema validation, per-session and global concurrency
//!   limits, deadlines, at most one terminal reply per request
//! - **Transports**: stdio pipe, push-stream (SSE with replay) and
//!   streamable HTTP (stateless or session-tracked)
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   │  pipe / push-stream / HTTP
//!   ▼
//! ┌──────────────┐
//! │  Transport   │  frames ⇄ envelopes
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │  Session     │  handshake, pending ids, subscriptions
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐
//! │  Dispatcher  │  validate → invoke → settle
//! └──────┬───────┘
//!        ▼
//!    Registry (tool and resource handlers)
//! ```
//!
//! ## Example Usage
//!
//! ```ignore
//! use moba_mcp::{McpServer, Registry};
//!
//! let mut builder = Registry::builder();
//! builder.register_tool(descriptor)?;
//! let server = McpServer::new(Arc::new(builder.build()), &config);
//! server.serve(&config.transport).await?;
//! ```

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use codec::{DecodeError, decode, encode};
pub use dispatcher::{Dispatcher, DispatcherOptions, Disposition};
pub use error::{HandlerError, McpError, RegistryError, TransportError, ValidationError};
pub use protocol::{Envelope, ErrorKind, ErrorObject, RequestId, ResourceContents};
pub use registry::{
    InvocationContext, Registry, RegistryBuilder, ResourceDescriptor, ResourceHandler, SideEffect,
    TemplateVars, ToolDescriptor, ToolHandler, resource_fn, tool_fn,
};
pub use server::{McpServer, ServerHandle};
pub use session::{Session, SessionState};
