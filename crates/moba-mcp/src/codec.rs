//! Message codec.
//!
//! Converts [`Envelope`] values to and from their JSON wire form. Decoding
//! never panics: malformed input yields a [`DecodeError`] with the offending
//! offset, a short snippet and, when recoverable, the request id so the caller
//! can still answer with an error.

use crate::protocol::{
    Envelope, ErrorObject, ErrorResponse, JSONRPC_VERSION, Notification, Request, RequestId,
    Response,
};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

const SNIPPET_RADIUS: usize = 20;

static ID_MEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^"id"\s*:\s*(-?\d+|"(?:[^"\\]|\\.)*")"#).expect("id pattern is valid")
});

/// A payload that could not be decoded into an envelope.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed message at offset {offset}: {reason} (near `{snippet}`)")]
pub struct DecodeError {
    /// Byte offset of the failure within the payload.
    pub offset: usize,
    /// Text surrounding the offset.
    pub snippet: String,
    /// What was wrong.
    pub reason: String,
    /// Request id recovered from the payload, if any.
    pub id: Option<RequestId>,
}

/// Wire shape shared by every envelope kind.
///
/// `present` distinguishes an absent member from an explicit `null`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Serialize an envelope to its JSON text form.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let mut wire = WireEnvelope {
        jsonrpc: Some(JSONRPC_VERSION.to_string()),
        ..Default::default()
    };

    match envelope {
        Envelope::Request(r) => {
            wire.id = Some(r.id.to_value());
            wire.method = Some(r.method.clone());
            wire.params = r.params.clone();
        }
        Envelope::Notification(n) => {
            wire.method = Some(n.method.clone());
            wire.params = n.params.clone();
        }
        Envelope::Response(r) => {
            wire.id = Some(r.id.to_value());
            wire.result = Some(r.result.clone());
        }
        Envelope::Error(e) => {
            wire.id = Some(e.id.as_ref().map_or(Value::Null, RequestId::to_value));
            wire.error = Some(serde_json::to_value(&e.error)?);
        }
    }

    serde_json::to_string(&wire)
}

/// Parse one wire message.
pub fn decode(input: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = match serde_json::from_slice(input) {
        Ok(v) => v,
        Err(e) => {
            let offset = error_offset(input, e.line(), e.column());
            return Err(DecodeError {
                offset,
                snippet: snippet(input, offset),
                reason: e.to_string(),
                id: salvage_id(input),
            });
        }
    };

    let salvaged = value.get("id").and_then(RequestId::from_value);

    if !value.is_object() {
        let reason = if value.is_array() {
            "batched messages are not supported"
        } else {
            "message must be a JSON object"
        };
        return Err(structural(input, reason, None));
    }

    let wire: WireEnvelope = serde_json::from_value(value)
        .map_err(|e| structural(input, &e.to_string(), salvaged.clone()))?;

    classify(wire).map_err(|reason| structural(input, reason, salvaged))
}

fn classify(wire: WireEnvelope) -> Result<Envelope, &'static str> {
    if let Some(version) = &wire.jsonrpc {
        if version != JSONRPC_VERSION {
            return Err("unsupported jsonrpc version");
        }
    }

    if let Some(method) = wire.method {
        if wire.result.is_some() || wire.error.is_some() {
            return Err("a message cannot carry both a method and a result or error");
        }
        let params = wire.params;
        return match wire.id {
            None => Ok(Envelope::Notification(Notification { method, params })),
            Some(raw) => {
                let id = RequestId::from_value(&raw)
                    .ok_or("request id must be a string or an integer")?;
                Ok(Envelope::Request(Request { id, method, params }))
            }
        };
    }

    match (wire.result, wire.error) {
        (Some(_), Some(_)) => Err("a message cannot carry both a result and an error"),
        (Some(result), None) => {
            let id = wire
                .id
                .as_ref()
                .and_then(RequestId::from_value)
                .ok_or("response id must be a string or an integer")?;
            Ok(Envelope::Response(Response { id, result }))
        }
        (None, Some(raw_error)) => {
            let error: ErrorObject =
                serde_json::from_value(raw_error).map_err(|_| "malformed error object")?;
            let id = match wire.id {
                None | Some(Value::Null) => None,
                Some(raw) => Some(
                    RequestId::from_value(&raw).ok_or("error id must be a string or an integer")?,
                ),
            };
            Ok(Envelope::Error(ErrorResponse { id, error }))
        }
        (None, None) => Err("message has neither a method, a result nor an error"),
    }
}

fn structural(input: &[u8], reason: &str, id: Option<RequestId>) -> DecodeError {
    DecodeError {
        offset: 0,
        snippet: snippet(input, 0),
        reason: reason.to_string(),
        id,
    }
}

/// Convert serde_json's 1-based line/column into a byte offset.
fn error_offset(input: &[u8], line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let mut offset = 0;
    for (i, l) in input.split(|b| *b == b'\n').enumerate() {
        if i + 1 == line {
            offset += column.saturating_sub(1).min(l.len());
            break;
        }
        offset += l.len() + 1;
    }
    offset.min(input.len())
}

fn snippet(input: &[u8], offset: usize) -> String {
    let start = offset.saturating_sub(SNIPPET_RADIUS);
    let end = (offset + SNIPPET_RADIUS).min(input.len());
    String::from_utf8_lossy(&input[start.min(end)..end]).into_owned()
}

/// Recover an id from text that is not valid JSON.
///
/// Only members of the outermost object count; an `id` nested inside
/// `params` is skipped.
fn salvage_id(input: &[u8]) -> Option<RequestId> {
    let text = String::from_utf8_lossy(input);
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (pos, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '{' | '[' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            '"' => {
                if depth == 1 {
                    if let Some(raw) = ID_MEMBER.captures(&text[pos..]).and_then(|c| c.get(1)) {
                        let value: Value = serde_json::from_str(raw.as_str()).ok()?;
                        return RequestId::from_value(&value);
                    }
                }
                in_string = true;
            }
            _ => {}
        }
    }
    None
}
