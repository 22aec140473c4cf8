//! Transport configuration.
//!
//! Selects which transport adapter the server binds at startup and how the
//! network transports behave.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Configuration for the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport type: "pipe", "push-stream" or "stateless-http".
    #[serde(default)]
    pub kind: TransportKind,

    /// Bind host (network transports only).
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port (network transports only).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Serve every HTTP request as an independent one-shot session.
    #[serde(default)]
    pub stateless: bool,

    /// Answer HTTP requests with a single JSON body instead of an event stream.
    #[serde(default)]
    pub json_response: bool,

    /// Message framing for the pipe transport.
    #[serde(default)]
    pub framing: Framing,

    /// Largest inbound message accepted by any transport, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

/// Transport adapter selected at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Duplex byte stream over stdin/stdout.
    #[default]
    Pipe,
    /// Long-lived server-sent event stream plus inbound POST channel.
    PushStream,
    /// Request/response HTTP (streamable HTTP).
    StatelessHttp,
}

/// Framing used on the pipe transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One JSON message per line.
    #[default]
    Newline,
    /// 4-byte big-endian length prefix followed by the payload.
    LengthDelimited,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            host: default_host(),
            port: default_port(),
            stateless: false,
            json_response: false,
            framing: Framing::default(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl TransportConfig {
    /// Socket address string for network transports.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the selected transport listens on a socket.
    pub fn is_network(&self) -> bool {
        self.kind != TransportKind::Pipe
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Pipe => "pipe",
            TransportKind::PushStream => "push-stream",
            TransportKind::StatelessHttp => "stateless-http",
        };
        f.write_str(s)
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pipe" | "stdio" => Ok(TransportKind::Pipe),
            "push-stream" | "sse" => Ok(TransportKind::PushStream),
            "stateless-http" | "streamable-http" | "http" => Ok(TransportKind::StatelessHttp),
            other => Err(format!(
                "unknown transport '{}': use pipe, push-stream or stateless-http",
                other
            )),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newline" | "lines" => Ok(Framing::Newline),
            "length-delimited" | "length" => Ok(Framing::LengthDelimited),
            other => Err(format!(
                "unknown framing '{}': use newline or length-delimited",
                other
            )),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_message_bytes() -> usize {
    4 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_aliases() {
        assert_eq!("stdio".parse::<TransportKind>(), Ok(TransportKind::Pipe));
        assert_eq!("sse".parse::<TransportKind>(), Ok(TransportKind::PushStream));
        assert_eq!(
            "streamable-http".parse::<TransportKind>(),
            Ok(TransportKind::StatelessHttp)
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_kind_yaml() {
        let config: TransportConfig = serde_yaml::from_str("kind: push-stream\nport: 9000").unwrap();
        assert_eq!(config.kind, TransportKind::PushStream);
        assert_eq!(config.bind_addr(), "localhost:9000");
        assert!(config.is_network());
    }
}
