//! Envelope types for the JSON wire protocol.
//!
//! One envelope per WebSocket text message, three shapes:
//! - Request (client to peer): `{"id": n, "method": "...", "params": ...}`
//! - Response (peer to client): `{"id": n, "result": ...}` or `{"id": n, "error": "..."}`
//! - Notification (peer to client): `{"method": "...", "params": ...}`, no id

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outbound request envelope.
#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

/// Serialize a request envelope. `params` is omitted entirely when absent.
pub(crate) fn encode_request(
    id: u64,
    method: &str,
    params: Option<&Value>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Request { id, method, params })
}

/// The raw shape of any inbound envelope: every field optional, classified
/// after parsing.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<String>,
}

/// A response to a prior request. `body` carries the `result` value or the
/// `error` message, whichever field the peer sent (`error` wins if both are
/// present; a response with neither resolves to `Value::Null`).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub body: Result<Value, String>,
}

/// An unsolicited notification pushed by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A classified inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Response(Response),
    Notification(Notification),
    /// Parsed as JSON but carries neither an id nor a method.
    Invalid,
}

impl Envelope {
    /// Parse one wire message and classify it.
    ///
    /// An id, when present, always classifies the envelope as a response,
    /// even if a method field rides along.
    pub fn parse(text: &str) -> Result<Envelope, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Ok(match raw {
            RawEnvelope {
                id: Some(id),
                result,
                error,
                ..
            } => Envelope::Response(Response {
                id,
                body: match error {
                    Some(message) => Err(message),
                    None => Ok(result.unwrap_or(Value::Null)),
                },
            }),
            RawEnvelope {
                method: Some(method),
                params,
                ..
            } => Envelope::Notification(Notification { method, params }),
            _ => Envelope::Invalid,
        })
    }
}
