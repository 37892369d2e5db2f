//! Stdio transport: newline-delimited JSON-RPC on stdin/stdout.
//!
//! A single fixed session serves the whole connection. Input framing
//! must survive messages that span read chunks, so the framer tracks
//! brace depth with string and escape state instead of trusting
//! newlines alone. Replies are written one per line and flushed.

use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::server::{Dispatcher, McpServer};
use crate::session::{SessionManager, STDIO_SESSION_ID};
use crate::transport::extract_request_id;
use crate::types::{codes, JsonRpcRequest, JsonRpcResponse, TransportKind};

/// Incremental message framer.
///
/// Feeds on raw chunks and yields complete message candidates: either
/// a balanced JSON object (which may have arrived across any number of
/// chunks) or a non-JSON line, passed through so the caller can answer
/// it with a parse error.
#[derive(Default)]
pub struct MessageFramer {
    buf: Vec<u8>,
    in_object: bool,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every message completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut complete = Vec::new();

        for &byte in chunk {
            if self.in_object {
                self.buf.push(byte);

                if self.in_string {
                    if self.escaped {
                        self.escaped = false;
                    } else if byte == b'\\' {
                        self.escaped = true;
                    } else if byte == b'"' {
                        self.in_string = false;
                    }
                } else {
                    match byte {
                        b'"' => self.in_string = true,
                        b'{' => self.depth += 1,
                        b'}' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                self.emit(&mut complete);
                            }
                        },
                        _ => {},
                    }
                }
            } else if self.buf.is_empty() {
                match byte {
                    b' ' | b'\t' | b'\r' | b'\n' => {},
                    b'{' => {
                        self.in_object = true;
                        self.depth = 1;
                        self.buf.push(byte);
                    },
                    // Start of a garbage line; keep it so the caller
                    // can reply with a parse error.
                    _ => self.buf.push(byte),
                }
            } else if byte == b'\n' {
                self.emit(&mut complete);
            } else {
                self.buf.push(byte);
            }
        }

        complete
    }

    fn emit(&mut self, complete: &mut Vec<String>) {
        let text = String::from_utf8_lossy(&self.buf).trim().to_string();
        if !text.is_empty() {
            complete.push(text);
        }
        self.buf.clear();
        self.in_object = false;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

pub struct StdioTransport {
    server: Arc<McpServer>,
    sessions: Arc<SessionManager>,
    out: Arc<Mutex<tokio::io::Stdout>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StdioTransport {
    pub fn new(server: Arc<McpServer>, config: &Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            server,
            sessions: Arc::new(SessionManager::new(&config.session, TransportKind::Stdio)),
            out: Arc::new(Mutex::new(tokio::io::stdout())),
            shutdown_tx,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Read loop: frame stdin into messages, dispatch each one
    /// synchronously, write the reply. A SIGINT routed through the
    /// shutdown channel ends the loop cleanly, as does EOF.
    pub async fn run(&self) -> Result<()> {
        // Stdio serves exactly one client; the session id is fixed and
        // the minimal context is built fresh by the manager.
        let session = self.sessions.create(Some(STDIO_SESSION_ID.to_string()), None);
        info!("Stdio transport ready");

        let mut stdin = tokio::io::stdin();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut framer = MessageFramer::new();
        let mut chunk = [0u8; 8192];

        loop {
            tokio::select! {
                read = stdin.read(&mut chunk) => {
                    let n = read.map_err(Error::Io)?;
                    if n == 0 {
                        info!("Stdin closed, shutting down");
                        break;
                    }

                    for raw in framer.push(&chunk[..n]) {
                        if let Some(reply) = self.handle_message(&session, &raw).await {
                            self.write_line(&reply).await?;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping stdio transport");
                    break;
                }
            }
        }

        self.sessions.cleanup_all();
        Ok(())
    }

    /// Parse and dispatch one framed message. Parse failures produce a
    /// -32700 reply whose id is best-effort extracted from the raw
    /// buffer; structurally invalid requests produce -32600.
    async fn handle_message(
        &self,
        session: &Arc<crate::session::Session>,
        raw: &str,
    ) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "Unparseable stdio message");
                return Some(JsonRpcResponse::error(
                    extract_request_id(raw),
                    codes::PARSE_ERROR,
                    format!("Parse error: {}", err),
                ));
            },
        };

        let id = value.get("id").cloned();
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                return Some(JsonRpcResponse::error(
                    id,
                    codes::INVALID_REQUEST,
                    format!("Invalid request: {}", err),
                ));
            },
        };

        Dispatcher::dispatch(&self.server, session, request).await
    }

    async fn write_line(&self, reply: &JsonRpcResponse) -> Result<()> {
        let line = serde_json::to_string(reply)?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }

    /// Server-initiated notification on stdout. The session id is
    /// accepted for interface parity; stdio has exactly one session.
    pub async fn send_notification(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> bool {
        if session_id != STDIO_SESSION_ID {
            warn!(session_id, "Unknown stdio session");
            return false;
        }
        self.emit_notification(method, params).await
    }

    pub async fn broadcast_notification(&self, method: &str, params: Option<Value>) -> usize {
        usize::from(self.emit_notification(method, params).await)
    }

    async fn emit_notification(&self, method: &str, params: Option<Value>) -> bool {
        let note = JsonRpcRequest::notification(method, params);
        let line = match serde_json::to_string(&note) {
            Ok(line) => line,
            Err(_) => return false,
        };

        let mut out = self.out.lock().await;
        let wrote = async {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await
        }
        .await;

        wrote.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_message() {
        let mut framer = MessageFramer::new();
        let messages = framer.push(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with('{'));
    }

    #[test]
    fn test_message_spanning_chunks() {
        let mut framer = MessageFramer::new();
        assert!(framer.push(b"{\"jsonrpc\":\"2.0\",\"id\":1,").is_empty());
        assert!(framer.push(b"\"method\":\"ping\",\"params\"").is_empty());
        let messages = framer.push(b":{}}");

        assert_eq!(messages.len(), 1);
        let value: Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(value["method"], "ping");
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let mut framer = MessageFramer::new();
        let raw = b"{\"method\":\"x\",\"params\":{\"text\":\"}}{{\\\"}\"}}";
        let messages = framer.push(raw);

        assert_eq!(messages.len(), 1);
        let value: Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(value["params"]["text"], "}}{{\"}");
    }

    #[test]
    fn test_escaped_quote_in_string() {
        let mut framer = MessageFramer::new();
        // The escaped quote must not end the string early.
        let messages = framer.push(b"{\"a\":\"say \\\"hi\\\"\"}");
        assert_eq!(messages.len(), 1);
        let value: Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(value["a"], "say \"hi\"");
    }

    #[test]
    fn test_multiple_messages_one_chunk() {
        let mut framer = MessageFramer::new();
        let messages = framer.push(b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}");
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn test_garbage_line_surfaced() {
        let mut framer = MessageFramer::new();
        let messages = framer.push(b"server starting up...\n{\"id\":1}\n");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "server starting up...");
        assert!(messages[1].starts_with('{'));
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut framer = MessageFramer::new();
        assert!(framer.push(b"\n\n  \r\n").is_empty());
    }

    #[test]
    fn test_nested_objects() {
        let mut framer = MessageFramer::new();
        let messages = framer.push(b"{\"a\":{\"b\":{\"c\":1}},\"d\":[{\"e\":2}]}");
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_extract_id_for_parse_errors() {
        assert_eq!(extract_request_id("{\"id\": 42, \"method"), Some(Value::from(42)));
        assert_eq!(
            extract_request_id("{\"id\":\"abc\",\"met"),
            Some(Value::from("abc"))
        );
        assert_eq!(extract_request_id("total garbage"), None);
    }

    #[tokio::test]
    async fn test_handle_message_parse_error_reply() {
        let config = Config::default();
        let server = Arc::new(McpServer::new(&config));
        let transport = StdioTransport::new(server, &config);
        let session = transport.sessions.create(Some(STDIO_SESSION_ID.to_string()), None);

        let reply = transport
            .handle_message(&session, "{\"id\": 7, bad json")
            .await
            .unwrap();
        assert_eq!(reply.error.as_ref().unwrap().code, codes::PARSE_ERROR);
        assert_eq!(reply.id, Some(Value::from(7)));
    }

    #[tokio::test]
    async fn test_handle_message_roundtrip() {
        let config = Config::default();
        let server = Arc::new(McpServer::new(&config));
        let transport = StdioTransport::new(server, &config);
        let session = transport.sessions.create(Some(STDIO_SESSION_ID.to_string()), None);

        let reply = transport
            .handle_message(&session, "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}")
            .await
            .unwrap();
        assert!(reply.error.is_none());
        assert_eq!(reply.id, Some(Value::from(1)));
    }

    #[tokio::test]
    async fn test_invalid_shape_is_invalid_request() {
        let config = Config::default();
        let server = Arc::new(McpServer::new(&config));
        let transport = StdioTransport::new(server, &config);
        let session = transport.sessions.create(Some(STDIO_SESSION_ID.to_string()), None);

        // Valid JSON, but no method field.
        let reply = transport
            .handle_message(&session, "{\"jsonrpc\":\"2.0\",\"id\":2}")
            .await
            .unwrap();
        assert_eq!(reply.error.as_ref().unwrap().code, codes::INVALID_REQUEST);
        assert_eq!(reply.id, Some(Value::from(2)));
    }
}
