//! Error types for the MCP crate.

use crate::protocol::{ErrorKind, ErrorObject};
use serde_json::json;
use thiserror::Error;

/// Errors that can occur in the MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    /// Failed to start the server.
    #[error("failed to start MCP server: {0}")]
    StartupFailed(String),

    /// Registry could not be built.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Transport-level faults. Any of these closes the affected connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Failed to bind a listening socket.
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised while building the registry at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    #[error("resource template already registered: {0}")]
    DuplicateResource(String),

    #[error("invalid input schema for tool {tool}: {reason}")]
    InvalidSchema { tool: String, reason: String },

    #[error("invalid resource template {template}: {reason}")]
    InvalidTemplate { template: String, reason: String },
}

/// Failure reported by a tool or resource handler.
///
/// `classification` is chosen by the collaborator and travels to the client
/// unchanged in `error.data.classification`.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{classification}: {message}")]
pub struct HandlerError {
    pub classification: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(classification: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            classification: classification.into(),
            message: message.into(),
        }
    }

    /// The handler observed cancellation and stopped early.
    pub fn cancelled() -> Self {
        Self::new("Cancelled", "invocation was cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.classification == "Cancelled"
    }

    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject::new(ErrorKind::HandlerError, self.message.clone())
            .with_data(json!({ "classification": self.classification }))
    }
}

/// Argument validation failure for a tool call.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid arguments for tool {tool}: {}", .errors.join("; "))]
pub struct ValidationError {
    pub tool: String,
    pub errors: Vec<String>,
}

impl ValidationError {
    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject::new(ErrorKind::ValidationError, self.to_string())
            .with_data(json!({ "tool": self.tool, "errors": self.errors }))
    }
}
