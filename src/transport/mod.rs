//! Transport layer
//!
//! Two interchangeable transports carry the protocol: stdio (one
//! persistent newline-delimited channel) and streamable HTTP (POST
//! plus a resumable SSE stream). [`Transport`] is the sum type the
//! rest of the server programs against; the dispatcher never knows
//! which variant it is running under.

use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::session::SessionManager;

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::HttpStreamTransport;
pub use stdio::StdioTransport;

pub enum Transport {
    Stdio(StdioTransport),
    HttpStream(HttpStreamTransport),
}

impl Transport {
    /// Run until shutdown. Blocking in the async sense; returns after
    /// a clean stop or with the fatal transport error.
    pub async fn run(&self) -> Result<()> {
        match self {
            Transport::Stdio(transport) => transport.run().await,
            Transport::HttpStream(transport) => transport.run().await,
        }
    }

    /// Push a server-initiated notification to one session.
    pub async fn send_notification(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> bool {
        match self {
            Transport::Stdio(transport) => {
                transport.send_notification(session_id, method, params).await
            },
            Transport::HttpStream(transport) => {
                transport.send_notification(session_id, method, params)
            },
        }
    }

    /// Notify every reachable client; returns the number of recipients
    /// successfully delivered to.
    pub async fn broadcast_notification(&self, method: &str, params: Option<Value>) -> usize {
        match self {
            Transport::Stdio(transport) => transport.broadcast_notification(method, params).await,
            Transport::HttpStream(transport) => transport.broadcast_notification(method, params),
        }
    }

    /// Signal the transport to stop accepting work and wind down.
    pub fn stop(&self) {
        match self {
            Transport::Stdio(transport) => transport.stop(),
            Transport::HttpStream(transport) => transport.stop(),
        }
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        match self {
            Transport::Stdio(transport) => transport.sessions(),
            Transport::HttpStream(transport) => transport.sessions(),
        }
    }
}

/// Best-effort id recovery from a malformed JSON-RPC buffer, so parse
/// error replies can still carry the caller's id. Finds the first
/// `"id"` key and reads an integer or quoted string after the colon.
pub(crate) fn extract_request_id(raw: &str) -> Option<Value> {
    let key = raw.find("\"id\"")?;
    let rest = raw[key + 4..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();

    let mut chars = rest.chars();
    match chars.next()? {
        '"' => {
            let mut out = String::new();
            let mut escaped = false;
            for c in chars {
                if escaped {
                    out.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    return Some(Value::String(out));
                } else {
                    out.push(c);
                }
            }
            None
        },
        c if c.is_ascii_digit() || c == '-' => {
            let digits: String = std::iter::once(c)
                .chain(chars.take_while(|c| c.is_ascii_digit()))
                .collect();
            digits.parse::<i64>().ok().map(Value::from)
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_numeric_id() {
        assert_eq!(
            extract_request_id("{\"jsonrpc\":\"2.0\",\"id\":123,\"met"),
            Some(Value::from(123))
        );
        assert_eq!(
            extract_request_id("{\"id\" : -5, garbage"),
            Some(Value::from(-5))
        );
    }

    #[test]
    fn test_extract_string_id() {
        assert_eq!(
            extract_request_id("{\"id\": \"req-9\", nope"),
            Some(Value::from("req-9"))
        );
        // Escapes inside the id survive.
        assert_eq!(
            extract_request_id("{\"id\":\"a\\\"b\"}"),
            Some(Value::from("a\"b"))
        );
    }

    #[test]
    fn test_extract_id_absent_or_hopeless() {
        assert_eq!(extract_request_id("not json at all"), None);
        assert_eq!(extract_request_id("{\"id\":}"), None);
        assert_eq!(extract_request_id("{\"id\":null}"), None);
        assert_eq!(extract_request_id("{\"id\":\"unterminated"), None);
    }
}
