//! HTTP surface over `tiny_http`.
//!
//! Each request gets its own thread, which decodes and validates the body,
//! forwards an `ApiRequest` to the dispatch loop, and waits for the reply.
//! No handler thread touches engine state directly.

use companion_daemon_protocol::{
    parse_body, ErrorInfo, QueueItem, QueueKind, Validate, MAX_REQUEST_BYTES,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, info, warn};

use crate::dispatch::{error_body, ApiReply, ApiRequest, Command};
use crate::error::{CompanionError, Result};

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_HEARTBEAT: Duration = Duration::from_secs(15);

pub fn bind(address: &str) -> Result<Server> {
    Server::http(address).map_err(|err| {
        CompanionError::io(
            format!("bind {}", address),
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, err.to_string()),
        )
    })
}

pub fn local_addr(server: &Server) -> Option<SocketAddr> {
    server.server_addr().to_ip()
}

/// Accept loop. Returns when the server is unblocked or dropped.
pub fn serve(server: Arc<Server>, commands: Sender<Command>) {
    for request in server.incoming_requests() {
        let commands = commands.clone();
        let spawned = thread::Builder::new()
            .name("http-request".to_string())
            .spawn(move || handle_request(request, commands));
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn request handler");
        }
    }
    info!("HTTP accept loop stopped");
}

fn handle_request(mut request: Request, commands: Sender<Command>) {
    let method = request.method().clone();
    let url = request.url().to_string();
    debug!(method = %method, url = %url, "HTTP request received");

    let body = if method == Method::Post {
        match read_body(&mut request) {
            Ok(body) => body,
            Err(err) => {
                respond_json(request, status_for(&err), &error_body(err));
                return;
            }
        }
    } else {
        Vec::new()
    };

    let api_request = match route(&method, &url, &body) {
        Ok(api_request) => api_request,
        Err((status, err)) => {
            respond_json(request, status, &error_body(err));
            return;
        }
    };

    let (reply_tx, reply_rx) = mpsc::channel();
    let sent = commands.send(Command::Api {
        request: api_request,
        reply: reply_tx,
    });
    if sent.is_err() {
        let err = CompanionError::Shutdown.to_error_info();
        respond_json(request, 503, &error_body(err));
        return;
    }

    match reply_rx.recv_timeout(REPLY_TIMEOUT) {
        Ok(ApiReply::Json { status, body }) => respond_json(request, status, &body),
        Ok(ApiReply::Stream { backlog, live }) => stream_events(request, backlog, live),
        Err(_) => {
            let err = ErrorInfo::new("unavailable", "daemon did not reply in time");
            respond_json(request, 503, &error_body(err));
        }
    }
}

fn read_body(request: &mut Request) -> std::result::Result<Vec<u8>, ErrorInfo> {
    let mut body = Vec::new();
    request
        .as_reader()
        .take(MAX_REQUEST_BYTES as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|err| ErrorInfo::new("read_error", format!("failed to read body: {}", err)))?;
    if body.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            "request_too_large",
            "request exceeded maximum size",
        ));
    }
    Ok(body)
}

/// Maps method, path, and body onto a validated request.
pub fn route(
    method: &Method,
    url: &str,
    body: &[u8],
) -> std::result::Result<ApiRequest, (u16, ErrorInfo)> {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    let expected = match path {
        "/health" | "/queue" | "/conversations" | "/workspaces" | "/stream" => Method::Get,
        "/ack" | "/mcp/log-code-change" | "/mcp/log-prompt-response" | "/prompts"
        | "/clipboard" => Method::Post,
        _ => {
            return Err((
                404,
                ErrorInfo::new("not_found", format!("no route for {}", path)),
            ))
        }
    };
    if *method != expected {
        return Err((
            405,
            ErrorInfo::new(
                "method_not_allowed",
                format!("{} expects {}", path, expected),
            ),
        ));
    }

    let request = match path {
        "/health" => ApiRequest::Health,
        "/workspaces" => ApiRequest::Workspaces,
        "/queue" => ApiRequest::Queue {
            since: since_param(query)?,
        },
        "/conversations" => ApiRequest::Conversations {
            since: since_param(query)?,
        },
        "/stream" => ApiRequest::Subscribe {
            since: since_param(query)?,
        },
        "/ack" => ApiRequest::Ack(decode(body)?),
        "/mcp/log-code-change" => ApiRequest::LogCodeChange(decode(body)?),
        "/mcp/log-prompt-response" => ApiRequest::LogPromptResponse(decode(body)?),
        "/prompts" => ApiRequest::CapturePrompt(decode(body)?),
        _ => ApiRequest::Clipboard(decode(body)?),
    };
    Ok(request)
}

fn decode<T>(body: &[u8]) -> std::result::Result<T, (u16, ErrorInfo)>
where
    T: DeserializeOwned + Validate,
{
    parse_body(body).map_err(|err| (status_for(&err), err))
}

fn since_param(query: &str) -> std::result::Result<u64, (u16, ErrorInfo)> {
    let raw = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "since")
        .map(|(_, value)| value);

    match raw {
        None | Some("") => Ok(0),
        Some(value) => value.parse::<u64>().map_err(|_| {
            (
                400,
                ErrorInfo::new(
                    "invalid_params",
                    format!("since must be a non-negative integer, got {:?}", value),
                ),
            )
        }),
    }
}

fn status_for(err: &ErrorInfo) -> u16 {
    match err.code.as_str() {
        "request_too_large" => 413,
        _ => 400,
    }
}

fn respond_json(request: Request, status: u16, body: &Value) {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::from_data(bytes).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    if let Err(err) = request.respond(response) {
        debug!(error = %err, "Failed to write response");
    }
}

/// Server-Sent Events. Writes go straight to the socket and are flushed per
/// event; a heartbeat comment detects clients that have gone away.
fn stream_events(request: Request, backlog: Vec<QueueItem>, live: Receiver<QueueItem>) {
    let mut writer = request.into_writer();
    let head = "HTTP/1.1 200 OK\r\n\
                Content-Type: text/event-stream\r\n\
                Cache-Control: no-cache\r\n\
                Connection: close\r\n\r\n";
    if writer.write_all(head.as_bytes()).and_then(|_| writer.flush()).is_err() {
        return;
    }

    for item in &backlog {
        if write_frame(&mut writer, &format_sse(item)).is_err() {
            return;
        }
    }

    loop {
        let frame = match live.recv_timeout(STREAM_HEARTBEAT) {
            Ok(item) => format_sse(&item),
            Err(RecvTimeoutError::Timeout) => ": keepalive\n\n".to_string(),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if write_frame(&mut writer, &frame).is_err() {
            debug!("Stream client disconnected");
            break;
        }
    }
}

fn write_frame(writer: &mut dyn Write, frame: &str) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes())?;
    writer.flush()
}

pub fn format_sse(item: &QueueItem) -> String {
    let kind = match item.kind {
        QueueKind::Entry => "entry",
        QueueKind::Event => "event",
    };
    let data = serde_json::to_string(item).unwrap_or_else(|_| "{}".to_string());
    format!("id: {}\nevent: {}\ndata: {}\n\n", item.seq, kind, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn route_err(method: Method, url: &str, body: &[u8]) -> (u16, String) {
        match route(&method, url, body) {
            Ok(request) => panic!("expected error, got {:?}", request),
            Err((status, err)) => (status, err.code),
        }
    }

    #[test]
    fn routes_queries_with_since() {
        assert!(matches!(
            route(&Method::Get, "/queue?since=41", b""),
            Ok(ApiRequest::Queue { since: 41 })
        ));
        assert!(matches!(
            route(&Method::Get, "/queue", b""),
            Ok(ApiRequest::Queue { since: 0 })
        ));
        assert!(matches!(
            route(&Method::Get, "/stream?foo=1&since=7", b""),
            Ok(ApiRequest::Subscribe { since: 7 })
        ));
        assert!(matches!(
            route(&Method::Get, "/health/", b""),
            Ok(ApiRequest::Health)
        ));
    }

    #[test]
    fn rejects_bad_cursor() {
        assert_eq!(
            route_err(Method::Get, "/queue?since=-1", b""),
            (400, "invalid_params".to_string())
        );
    }

    #[test]
    fn unknown_paths_and_wrong_methods() {
        assert_eq!(
            route_err(Method::Get, "/nope", b""),
            (404, "not_found".to_string())
        );
        assert_eq!(
            route_err(Method::Get, "/ack", b""),
            (405, "method_not_allowed".to_string())
        );
        assert_eq!(
            route_err(Method::Post, "/queue", b"{}"),
            (405, "method_not_allowed".to_string())
        );
    }

    #[test]
    fn decodes_and_validates_post_bodies() {
        let body = br#"{"file_path": "/repo/a.rs", "before_code": "a", "after_code": "b"}"#;
        assert!(matches!(
            route(&Method::Post, "/mcp/log-code-change", body),
            Ok(ApiRequest::LogCodeChange(_))
        ));

        assert_eq!(
            route_err(Method::Post, "/ack", b"not json"),
            (400, "invalid_json".to_string())
        );
        assert_eq!(
            route_err(Method::Post, "/prompts", br#"{"text": ""}"#),
            (400, "missing_field".to_string())
        );
    }

    #[test]
    fn formats_sse_frames() {
        let item = QueueItem {
            seq: 3,
            kind: QueueKind::Entry,
            payload: json!({"id": "e-1"}),
            enqueued_at: Utc::now(),
        };
        let frame = format_sse(&item);
        assert!(frame.starts_with("id: 3\nevent: entry\ndata: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"e-1\""));
    }
}
