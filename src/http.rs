/*! fleetlink::http — the HTTP/1.1 front end
 *
 * One listener, one spawned task per connection, one request per
 * connection (every response carries `Connection: close`). No framework:
 * the surface is a dozen fixed routes with tiny bodies, served straight
 * off `tokio::net::TcpListener`.
 *
 * Policy applied to every response:
 *   Content-Type, exact Content-Length, Cache-Control: no-store,
 *   Connection: close; public endpoints additionally get
 *   Access-Control-Allow-Origin: * and Vary: Origin. JSON bodies end with
 *   a single newline.
 */

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::api;
use crate::state::AppState;

/// Declared request bodies above this fail with 413.
pub const MAX_BODY_BYTES: usize = 262_144;
/// Request line + headers cap.
const MAX_HEAD_BYTES: usize = 8 * 1024;

// ── Request ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Request {
    pub method: String,
    /// Path only; any query string is stripped at parse time.
    pub path: String,
    /// Header names are lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote_ip: String,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Host header without any :port suffix.
    pub fn host(&self) -> Option<&str> {
        self.header("host").map(|h| h.split(':').next().unwrap_or(h))
    }
}

/// Why a request could not be read off the wire.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("malformed or oversized request head")]
    BadHead,
    #[error("declared body too large")]
    BodyTooLarge,
    #[error("body shorter than declared")]
    BodyReadFailed,
}

// ── Response ──────────────────────────────────────────────────────────────────

enum Body {
    Bytes(Vec<u8>),
    File { file: tokio::fs::File, len: u64 },
}

pub struct Response {
    status: u16,
    content_type: String,
    body: Body,
    /// Adds the CORS headers when set.
    pub public: bool,
    extra: Vec<(String, String)>,
}

impl Response {
    pub fn json(status: u16, value: &Value) -> Self {
        let mut body = value.to_string().into_bytes();
        body.push(b'\n');
        Response {
            status,
            content_type: "application/json".into(),
            body: Body::Bytes(body),
            public: true,
            extra: Vec::new(),
        }
    }

    /// The 4xx/5xx envelope: `{"error":"<code>"}`.
    pub fn error(status: u16, code: &str) -> Self {
        Response::json(status, &json!({ "error": code }))
    }

    pub fn error_detail(status: u16, code: &str, detail: &str) -> Self {
        Response::json(status, &json!({ "error": code, "detail": detail }))
    }

    pub fn file(file: tokio::fs::File, len: u64, content_type: &str) -> Self {
        Response {
            status: 200,
            content_type: content_type.into(),
            body: Body::File { file, len },
            public: false,
            extra: Vec::new(),
        }
    }

    /// CORS preflight: 204, no body, the fixed allow set.
    pub fn preflight() -> Self {
        let mut resp = Response {
            status: 204,
            content_type: "text/plain".into(),
            body: Body::Bytes(Vec::new()),
            public: true,
            extra: Vec::new(),
        };
        resp.extra.push(("Access-Control-Allow-Methods".into(), "GET,POST,OPTIONS".into()));
        resp.extra.push(("Access-Control-Allow-Headers".into(), "Content-Type".into()));
        resp.extra.push(("Access-Control-Max-Age".into(), "600".into()));
        resp
    }

    pub fn with_header(mut self, name: &str, value: String) -> Self {
        self.extra.push((name.into(), value));
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    fn body_len(&self) -> u64 {
        match &self.body {
            Body::Bytes(b) => b.len() as u64,
            Body::File { len, .. } => *len,
        }
    }

    fn render_head(&self) -> String {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n",
            self.status,
            reason(self.status),
            self.content_type,
            self.body_len(),
        );
        if self.public {
            head.push_str("Access-Control-Allow-Origin: *\r\nVary: Origin\r\n");
        }
        for (name, value) in &self.extra {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head
    }

    /// Write head and, unless this answers a HEAD, the body.
    async fn write_to(self, stream: &mut TcpStream, head_only: bool) -> std::io::Result<()> {
        stream.write_all(self.render_head().as_bytes()).await?;
        if !head_only {
            match self.body {
                Body::Bytes(bytes) => stream.write_all(&bytes).await?,
                Body::File { mut file, .. } => {
                    tokio::io::copy(&mut file, stream).await.map(|_| ())?;
                }
            }
        }
        stream.flush().await
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Content type by file extension, for the UI and media trees.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" | "log" => "text/plain; charset=utf-8",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "ts" => "video/mp2t",
        _ => "application/octet-stream",
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Split the head into (method, path, headers). Query strings are dropped
/// from the path. Returns None on anything that is not a plausible
/// HTTP/1.x request head.
fn parse_head(head: &str) -> Option<(String, String, Vec<(String, String)>)> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let path = target.split('?').next().unwrap_or(target).to_string();
    if !path.starts_with('/') {
        return None;
    }
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Some((method, path, headers))
}

/// Read one full request off the stream: head up to the cap, then exactly
/// Content-Length body bytes.
async fn read_request(stream: &mut TcpStream, remote_ip: String) -> Result<Request, ReadError> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ReadError::BadHead);
        }
        let mut chunk = [0u8; 2048];
        let n = stream.read(&mut chunk).await.map_err(|_| ReadError::BadHead)?;
        if n == 0 {
            return Err(ReadError::BadHead);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let (method, path, headers) = parse_head(&head).ok_or(ReadError::BadHead)?;

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(ReadError::BodyTooLarge);
    }

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 8192];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|_| ReadError::BodyReadFailed)?;
        if n == 0 {
            return Err(ReadError::BodyReadFailed);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request {
        method,
        path,
        headers,
        body,
        remote_ip,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

// ── Server loop ───────────────────────────────────────────────────────────────

pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("[http] accept: {e}");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    handle_connection(stream, peer.ip().to_string(), state).await;
                });
            }
            _ = state.stopped() => break,
        }
    }
    debug!("[http] listener stopped");
}

async fn handle_connection(mut stream: TcpStream, remote_ip: String, state: Arc<AppState>) {
    let _ = stream.set_nodelay(true);
    let (response, head_only) = match read_request(&mut stream, remote_ip).await {
        Ok(req) => {
            let head_only = req.method == "HEAD";
            (api::dispatch(&state, &req).await, head_only)
        }
        Err(ReadError::BodyTooLarge) => (Response::error(413, "body_too_large"), false),
        Err(ReadError::BodyReadFailed) => (Response::error(400, "body_read_failed"), false),
        Err(ReadError::BadHead) => (Response::error(400, "bad_request"), false),
    };
    if let Err(e) = response.write_to(&mut stream, head_only).await {
        debug!("[http] write: {e}");
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head_basic() {
        let (method, path, headers) = parse_head(
            "POST /exec?x=1 HTTP/1.1\r\nHost: 10.0.0.2:8080\r\nContent-Length: 12",
        )
        .unwrap();
        assert_eq!(method, "POST");
        assert_eq!(path, "/exec");
        assert_eq!(headers[0], ("host".into(), "10.0.0.2:8080".into()));
        assert_eq!(headers[1].1, "12");
    }

    #[test]
    fn test_parse_head_rejects_garbage() {
        assert!(parse_head("").is_none());
        assert!(parse_head("GET /x SPDY/3").is_none());
        assert!(parse_head("GET http-no-slash HTTP/1.1").is_none());
        assert!(parse_head("weird").is_none());
    }

    #[test]
    fn test_request_host_strips_port() {
        let req = Request {
            method: "GET".into(),
            path: "/caps".into(),
            headers: vec![("host".into(), "192.168.1.9:8080".into())],
            body: Vec::new(),
            remote_ip: "10.0.0.1".into(),
        };
        assert_eq!(req.host(), Some("192.168.1.9"));
    }

    #[test]
    fn test_health_body_is_sixteen_bytes() {
        let resp = Response::json(200, &json!({"status": "ok"}));
        match &resp.body {
            Body::Bytes(b) => {
                assert_eq!(b.len(), 16);
                assert_eq!(b.as_slice(), b"{\"status\":\"ok\"}\n");
            }
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn test_render_head_policy() {
        let head = Response::json(200, &json!({"status": "ok"})).render_head();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: application/json\r\n"));
        assert!(head.contains("Content-Length: 16\r\n"));
        assert!(head.contains("Cache-Control: no-store\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(head.contains("Vary: Origin\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_private_response_has_no_cors() {
        let head = Response::error(404, "not_found").with_public(false).render_head();
        assert!(!head.contains("Access-Control-Allow-Origin"));
    }

    #[test]
    fn test_preflight_headers() {
        let head = Response::preflight().render_head();
        assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(head.contains("Access-Control-Allow-Methods: GET,POST,OPTIONS\r\n"));
        assert!(head.contains("Access-Control-Allow-Headers: Content-Type\r\n"));
        assert!(head.contains("Access-Control-Max-Age: 600\r\n"));
        assert!(head.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("app.js"), "application/javascript");
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("stuff.bin"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(14));
        assert_eq!(find_head_end(b"partial\r\n"), None);
    }
}
