/*! fleetlink::api — endpoint handlers behind the HTTP front end
 *
 * Routing is a match on (method, exact path) with two prefix trees behind
 * it: /media/ and the UI asset fallback. Handlers take a config snapshot
 * up front and work entirely from it; the one exception is /sync/bind,
 * which exists to mutate the config.
 */

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Config, SyncRole};
use crate::exec;
use crate::http::{content_type_for, Request, Response};
use crate::slave;
use crate::state::AppState;
use crate::sync::{PushError, PushRequest, RegisterRequest};
use crate::sysinfo;

pub async fn dispatch(state: &Arc<AppState>, req: &Request) -> Response {
    if req.method == "OPTIONS" {
        return Response::preflight();
    }
    let cfg = state.cfg.snapshot().await;

    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/health") => Response::json(200, &json!({"status": "ok"})),
        (_, "/health") => method_not_allowed(),

        ("GET", "/caps") => caps(&cfg, req),
        (_, "/caps") => method_not_allowed(),

        ("POST", "/exec") => exec_handler(&cfg, req).await,
        (_, "/exec") => method_not_allowed(),

        ("POST", "/udp") => udp_handler(req).await,
        (_, "/udp") => method_not_allowed(),

        ("GET", "/nodes") => nodes_get(state).await,
        ("POST", "/nodes") => nodes_post(state, cfg),
        (_, "/nodes") => method_not_allowed(),

        ("POST", "/sync/register") => sync_register(state, &cfg, req).await,
        ("GET", "/sync/slaves") => sync_slaves(state, &cfg).await,
        ("POST", "/sync/push") => sync_push(state, &cfg, req).await,
        ("POST", "/sync/bind") => sync_bind(state, &cfg, req).await,
        (_, "/sync/register" | "/sync/slaves" | "/sync/push" | "/sync/bind") => {
            method_not_allowed()
        }

        _ if req.path.starts_with("/media/") => media_handler(&cfg, req).await,
        ("GET" | "HEAD", _) => ui_handler(&cfg, req).await,
        _ => Response::error(404, "not_found"),
    }
}

fn method_not_allowed() -> Response {
    Response::error(405, "method_not_allowed")
}

fn parse_body<T: for<'de> Deserialize<'de>>(req: &Request) -> Result<T, Response> {
    serde_json::from_slice(&req.body).map_err(|e| {
        debug!("[api] {} {}: bad json ({e})", req.method, req.path);
        Response::error(400, "bad_json")
    })
}

// ── /caps ─────────────────────────────────────────────────────────────────────

/// `http://IP` / `{IP}` tokens in announced stream URLs are replaced with
/// the host the client itself used to reach us.
fn substitute_ip(url: &str, host: Option<&str>) -> String {
    let Some(host) = host else {
        return url.to_string();
    };
    url.replace("http://IP", &format!("http://{host}"))
        .replace("{IP}", host)
}

fn caps(cfg: &Config, req: &Request) -> Response {
    let mut caps_list = cfg.caps.clone();
    match cfg.sync_role {
        SyncRole::Master => caps_list.push("sync-master".into()),
        SyncRole::Slave => caps_list.push("sync-slave".into()),
        SyncRole::Unset => {}
    }

    let rt = sysinfo::runtime_info();
    let mut body = json!({
        "device": cfg.device,
        "role": cfg.role,
        "version": cfg.version,
        "caps": caps_list,
        "ts": rt.ts,
        "scan_feature_enabled": cfg.enable_scan,
    });
    if !cfg.sync_id.is_empty() {
        body["id"] = json!(cfg.sync_id);
    }
    if let Some(v) = rt.uptime_s {
        body["uptime_s"] = json!(v);
    }
    if let Some(v) = rt.load {
        body["load"] = json!(v);
    }
    if let Some(v) = rt.mem_free_kib {
        body["mem_free_kib"] = json!(v);
    }
    if let Some(v) = rt.mem_available_kib {
        body["mem_available_kib"] = json!(v);
    }
    if cfg.include_net_info {
        body["net"] = serde_json::to_value(sysinfo::interfaces_v4()).unwrap_or(Value::Null);
    }
    if !cfg.sse.is_empty() {
        let streams: Vec<Value> = cfg
            .sse
            .iter()
            .map(|s| json!({"name": s.name, "url": substitute_ip(&s.url, req.host())}))
            .collect();
        body["streams"] = json!(streams);
    }
    if cfg.serve_ui && !cfg.ui_path.is_empty() {
        body["ui"] = json!({"served": true, "public": cfg.ui_public});
    }
    Response::json(200, &body)
}

// ── /exec ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ExecBody {
    path: String,
    #[serde(default)]
    args: Vec<String>,
}

async fn exec_handler(cfg: &Config, req: &Request) -> Response {
    let body: ExecBody = match parse_body(req) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match exec::run(
        &cfg.interpreter,
        &body.path,
        &body.args,
        cfg.timeout_ms,
        cfg.max_output_bytes,
    )
    .await
    {
        Ok(out) => Response::json(
            200,
            &json!({
                "rc": out.rc,
                "elapsed_ms": out.elapsed_ms,
                "stdout": out.stdout,
                "stderr": out.stderr,
            }),
        ),
        Err(e) => {
            warn!("[api] /exec {}: {e:#}", body.path);
            Response::error(500, "exec_failed")
        }
    }
}

// ── /udp ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UdpBody {
    #[serde(default)]
    host: String,
    port: i64,
    payload: Option<String>,
    payload_base64: Option<String>,
}

async fn udp_handler(req: &Request) -> Response {
    let body: UdpBody = match parse_body(req) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if body.host.trim().is_empty() {
        return Response::error(400, "bad_host");
    }
    if body.port < 1 || body.port > 65_535 {
        return Response::error(400, "bad_port");
    }
    let payload = match (&body.payload, &body.payload_base64) {
        (Some(p), None) => p.clone().into_bytes(),
        (None, Some(b64)) => {
            use base64::Engine as _;
            match base64::engine::general_purpose::STANDARD.decode(b64) {
                Ok(bytes) => bytes,
                Err(_) => return Response::error(400, "bad_base64"),
            }
        }
        _ => return Response::error(400, "bad_payload"),
    };

    let port = body.port as u16;
    let target = match tokio::net::lookup_host((body.host.as_str(), port)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(a) => a,
            None => return Response::error_detail(502, "resolve_failed", "no addresses"),
        },
        Err(e) => return Response::error_detail(502, "resolve_failed", &e.to_string()),
    };
    let socket = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => return Response::error_detail(502, "send_failed", &e.to_string()),
    };
    match socket.send_to(&payload, target).await {
        Ok(sent) => Response::json(
            200,
            &json!({
                "status": "sent",
                "bytes_sent": sent,
                "payload_length": payload.len(),
                "host": body.host,
                "port": port,
            }),
        ),
        Err(e) => Response::error_detail(502, "send_failed", &e.to_string()),
    }
}

// ── /nodes ────────────────────────────────────────────────────────────────────

async fn nodes_get(state: &Arc<AppState>) -> Response {
    let nodes = state.scanner.nodes().await;
    Response::json(
        200,
        &json!({
            "nodes": serde_json::to_value(&nodes).unwrap_or(Value::Null),
            "scan": serde_json::to_value(state.scanner.status()).unwrap_or(Value::Null),
        }),
    )
}

fn nodes_post(state: &Arc<AppState>, cfg: Config) -> Response {
    if !cfg.enable_scan {
        return Response::error(400, "scan_disabled");
    }
    let started = state.scanner.try_start(cfg);
    let scan = serde_json::to_value(state.scanner.status()).unwrap_or(Value::Null);
    Response::json(
        202,
        &json!({
            "status": if started { "started" } else { "already_running" },
            "scan": scan,
        }),
    )
}

// ── /sync/* ───────────────────────────────────────────────────────────────────

async fn sync_register(state: &Arc<AppState>, cfg: &Config, req: &Request) -> Response {
    if cfg.sync_role != SyncRole::Master {
        return Response::error(503, "not_master");
    }
    let body: RegisterRequest = match parse_body(req) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if body.id.trim().is_empty() {
        return Response::error(400, "missing_id");
    }
    let resp = state
        .sync
        .register(cfg, &body, &req.remote_ip, sysinfo::unix_now_ms())
        .await;
    // The slave is a live endpoint; let the next scan confirm it.
    if let Ok(ip) = req.remote_ip.parse::<Ipv4Addr>() {
        state.scanner.add_known_host(ip, cfg.port).await;
    }
    Response::json(200, &resp)
}

async fn sync_slaves(state: &Arc<AppState>, cfg: &Config) -> Response {
    if cfg.sync_role != SyncRole::Master {
        return Response::error(503, "not_master");
    }
    Response::json(200, &state.sync.view(cfg).await)
}

async fn sync_push(state: &Arc<AppState>, cfg: &Config, req: &Request) -> Response {
    if cfg.sync_role != SyncRole::Master {
        return Response::error(503, "not_master");
    }
    let body: PushRequest = match parse_body(req) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.sync.push(cfg, &body).await {
        Ok(resp) => Response::json(200, &resp),
        Err(PushError::UnknownSlave(id)) => Response::error_detail(404, "unknown_slave", &id),
        Err(PushError::BadSlot(_)) => Response::error(400, "bad_slot"),
    }
}

#[derive(Deserialize)]
struct BindBody {
    master_url: String,
    register_interval_s: Option<u64>,
}

async fn sync_bind(state: &Arc<AppState>, cfg: &Config, req: &Request) -> Response {
    if cfg.sync_role != SyncRole::Slave {
        return Response::error(503, "not_slave");
    }
    if !cfg.allow_bind {
        return Response::error(403, "bind_disabled");
    }
    let body: BindBody = match parse_body(req) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let Some(normalized) = slave::resolve_master(&body.master_url, &state.scanner).await else {
        return if body.master_url.trim().starts_with("sync://") {
            Response::error(502, "unresolved_sync_id")
        } else {
            Response::error(400, "bad_master_url")
        };
    };
    state
        .cfg
        .set_master_override(normalized.clone(), body.register_interval_s)
        .await;
    state.slave.clear_ack().await;
    Response::json(200, &json!({"status": "bound", "master_url": normalized}))
}

// ── Static trees (/media/, UI) ────────────────────────────────────────────────

fn http_date(t: std::time::SystemTime) -> String {
    let dt: chrono::DateTime<chrono::Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Serve a regular file from under `root`. The joined path is
/// canonicalized and must stay inside the canonical root; `..` components
/// are refused outright.
async fn serve_under_root(root: &str, rel: &str) -> Response {
    if Path::new(rel)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Response::error(403, "forbidden");
    }
    let Ok(root_canon) = tokio::fs::canonicalize(root).await else {
        return Response::error(404, "not_found");
    };
    let Ok(target) = tokio::fs::canonicalize(root_canon.join(rel)).await else {
        return Response::error(404, "not_found");
    };
    if !target.starts_with(&root_canon) {
        return Response::error(403, "forbidden");
    }
    let Ok(meta) = tokio::fs::metadata(&target).await else {
        return Response::error(404, "not_found");
    };
    if !meta.is_file() {
        return Response::error(404, "not_found");
    }
    let Ok(file) = tokio::fs::File::open(&target).await else {
        return Response::error(404, "not_found");
    };
    let mut resp = Response::file(file, meta.len(), content_type_for(rel));
    if let Ok(mtime) = meta.modified() {
        resp = resp.with_header("Last-Modified", http_date(mtime));
    }
    resp
}

async fn media_handler(cfg: &Config, req: &Request) -> Response {
    if req.method != "GET" && req.method != "HEAD" {
        return method_not_allowed();
    }
    if !cfg.has_cap("dvr") || cfg.media_path.is_empty() {
        return Response::error(404, "not_found");
    }
    let rel = &req.path["/media/".len()..];
    if rel.is_empty() {
        return Response::error(404, "not_found");
    }
    serve_under_root(&cfg.media_path, rel).await.with_public(true)
}

async fn ui_handler(cfg: &Config, req: &Request) -> Response {
    if !cfg.serve_ui || cfg.ui_path.is_empty() {
        return if req.path == "/" {
            Response::error(503, "ui_disabled")
        } else {
            Response::error(404, "not_found")
        };
    }
    let rel = if req.path == "/" {
        "index.html"
    } else {
        &req.path[1..]
    };
    serve_under_root(&cfg.ui_path, rel)
        .await
        .with_public(cfg.ui_public)
}

// ── End-to-end tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http;
    use std::io::Write as _;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn spawn_app(ini: &str) -> (SocketAddr, Arc<AppState>) {
        let state = AppState::new(Config::from_ini(ini), None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::clone(&state);
        tokio::spawn(async move {
            http::serve(listener, served).await;
        });
        (addr, state)
    }

    async fn send_raw(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        // Half-close so a server waiting on more body sees EOF.
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn request(
        addr: SocketAddr,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> (u16, String, Value) {
        let body = body.unwrap_or_default();
        let raw = format!(
            "{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let text = send_raw(addr, raw.as_bytes()).await;
        let status: u16 = text
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let (head, payload) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));
        let parsed = serde_json::from_str(payload).unwrap_or(Value::Null);
        (status, head.to_string(), parsed)
    }

    #[tokio::test]
    async fn test_health_contract() {
        let (addr, _state) = spawn_app("").await;
        let (status, head, body) = request(addr, "GET", "/health", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert!(head.contains("Content-Length: 16"));
        assert!(head.contains("Access-Control-Allow-Origin: *"));
        assert!(head.contains("Connection: close"));
    }

    #[tokio::test]
    async fn test_method_gating() {
        let (addr, _state) = spawn_app("").await;
        let (status, _, body) = request(addr, "POST", "/health", Some("{}")).await;
        assert_eq!(status, 405);
        assert_eq!(body["error"], "method_not_allowed");
        let (status, _, _) = request(addr, "DELETE", "/exec", None).await;
        assert_eq!(status, 405);
    }

    #[tokio::test]
    async fn test_preflight_any_path() {
        let (addr, _state) = spawn_app("").await;
        let (status, head, _) = request(addr, "OPTIONS", "/whatever", None).await;
        assert_eq!(status, 204);
        assert!(head.contains("Access-Control-Allow-Methods: GET,POST,OPTIONS"));
    }

    #[tokio::test]
    async fn test_unknown_path_404() {
        let (addr, _state) = spawn_app("").await;
        let (status, _, body) = request(addr, "GET", "/no/such/thing", None).await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_caps_identity_and_substitution() {
        let ini = "\
[caps]
device = cam-7
role = relay
caps = dvr
[announce]
sse = status@http://IP:8600/ev
sse = alt@{IP}:9/x
[sync]
role = master
id = hub-1
";
        let (addr, _state) = spawn_app(ini).await;
        let (status, _, body) = request(addr, "GET", "/caps", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["device"], "cam-7");
        assert_eq!(body["id"], "hub-1");
        let caps: Vec<String> = body["caps"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(caps.contains(&"dvr".to_string()));
        assert!(caps.contains(&"sync-master".to_string()));
        assert_eq!(body["streams"][0]["url"], "http://127.0.0.1:8600/ev");
        assert_eq!(body["streams"][1]["url"], "127.0.0.1:9/x");
        assert_eq!(body["scan_feature_enabled"], true);
        assert!(body["ts"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_exec_round_trip() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        script.write_all(b"echo hi\n").unwrap();
        let (addr, _state) = spawn_app("").await;
        let body = json!({"path": script.path(), "args": []}).to_string();
        let (status, _, resp) = request(addr, "POST", "/exec", Some(&body)).await;
        assert_eq!(status, 200);
        assert_eq!(resp["rc"], 0);
        assert_eq!(resp["stdout"], "hi\n");
        assert_eq!(resp["stderr"], "");
        assert!(resp["elapsed_ms"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_exec_bad_json_and_spawn_failure() {
        let (addr, _state) = spawn_app("").await;
        let (status, _, body) = request(addr, "POST", "/exec", Some("{nope")).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "bad_json");

        let (addr, _state) = spawn_app("[exec]\ninterpreter = /no/such/interp\n").await;
        let req = json!({"path": "/x"}).to_string();
        let (status, _, body) = request(addr, "POST", "/exec", Some(&req)).await;
        assert_eq!(status, 500);
        assert_eq!(body["error"], "exec_failed");
    }

    #[tokio::test]
    async fn test_udp_send_and_validation() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rx_port = receiver.local_addr().unwrap().port();
        let (addr, _state) = spawn_app("").await;

        let body = json!({"host": "127.0.0.1", "port": rx_port, "payload": "hello"}).to_string();
        let (status, _, resp) = request(addr, "POST", "/udp", Some(&body)).await;
        assert_eq!(status, 200);
        assert_eq!(resp["status"], "sent");
        assert_eq!(resp["bytes_sent"], 5);
        assert_eq!(resp["payload_length"], 5);
        assert_eq!(resp["host"], "127.0.0.1");
        assert_eq!(resp["port"], rx_port);

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        // Validation: port bounds, payload exclusivity, base64.
        for bad in [
            json!({"host": "127.0.0.1", "port": 0, "payload": "x"}),
            json!({"host": "127.0.0.1", "port": 65536, "payload": "x"}),
            json!({"host": "", "port": 1, "payload": "x"}),
            json!({"host": "127.0.0.1", "port": 1}),
            json!({"host": "127.0.0.1", "port": 1, "payload": "x", "payload_base64": "eA=="}),
            json!({"host": "127.0.0.1", "port": 1, "payload_base64": "!!!"}),
        ] {
            let (status, _, _) = request(addr, "POST", "/udp", Some(&bad.to_string())).await;
            assert_eq!(status, 400, "expected 400 for {bad}");
        }
    }

    #[tokio::test]
    async fn test_udp_base64_payload() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rx_port = receiver.local_addr().unwrap().port();
        let (addr, _state) = spawn_app("").await;
        let body =
            json!({"host": "127.0.0.1", "port": rx_port, "payload_base64": "AAEC"}).to_string();
        let (status, _, resp) = request(addr, "POST", "/udp", Some(&body)).await;
        assert_eq!(status, 200);
        assert_eq!(resp["bytes_sent"], 3);
        let mut buf = [0u8; 8];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0u8, 1, 2]);
    }

    #[tokio::test]
    async fn test_nodes_get_and_scan_disabled() {
        let (addr, _state) = spawn_app("[server]\nenable_scan = no\n").await;
        let (status, _, body) = request(addr, "GET", "/nodes", None).await;
        assert_eq!(status, 200);
        assert!(body["nodes"].is_array());
        assert_eq!(body["scan"]["running"], false);
        assert_eq!(body["scan"]["progress_pct"], 0);

        let (status, _, body) = request(addr, "POST", "/nodes", Some("{}")).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "scan_disabled");
    }

    #[tokio::test]
    async fn test_body_size_guard() {
        let (addr, _state) = spawn_app("").await;
        // Declared over the cap: rejected before any read.
        let raw = format!(
            "POST /exec HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            http::MAX_BODY_BYTES + 1
        );
        let text = send_raw(addr, raw.as_bytes()).await;
        assert!(text.starts_with("HTTP/1.1 413"));
        assert!(text.contains("body_too_large"));

        // Exactly at the cap: accepted and parsed.
        let mut script = tempfile::NamedTempFile::new().unwrap();
        script.write_all(b"exit 0\n").unwrap();
        let skeleton = json!({"path": script.path(), "pad": ""}).to_string();
        let pad = "a".repeat(http::MAX_BODY_BYTES - skeleton.len());
        let body = json!({"path": script.path(), "pad": pad}).to_string();
        assert_eq!(body.len(), http::MAX_BODY_BYTES);
        let (status, _, resp) = request(addr, "POST", "/exec", Some(&body)).await;
        assert_eq!(status, 200);
        assert_eq!(resp["rc"], 0);
    }

    #[tokio::test]
    async fn test_truncated_body_fails() {
        let (addr, _state) = spawn_app("").await;
        let raw = b"POST /exec HTTP/1.1\r\nHost: x\r\nContent-Length: 50\r\n\r\n{\"short";
        let text = send_raw(addr, raw).await;
        assert!(text.starts_with("HTTP/1.1 400"));
        assert!(text.contains("body_read_failed"));
    }

    const MASTER_INI: &str = "\
[sync]
role = master
id = hub-1
[sync.slot1]
name = primary
prefer_id = slaveA
exec = {\"path\":\"/sys/ping\",\"args\":[\"1.2.3.4\"]}
";

    #[tokio::test]
    async fn test_sync_register_full_cycle() {
        let (addr, _state) = spawn_app(MASTER_INI).await;
        let (status, _, resp) =
            request(addr, "POST", "/sync/register", Some(r#"{"id":"slaveA"}"#)).await;
        assert_eq!(status, 200);
        assert_eq!(resp["status"], "registered");
        assert_eq!(resp["slot"], 1);
        assert_eq!(resp["slot_generation"], 1);
        assert_eq!(resp["generation"], 1);
        assert_eq!(resp["slot_label"], "primary");
        assert_eq!(resp["commands"][0]["path"], "/sys/ping");
        assert_eq!(resp["commands"][0]["args"][0], "1.2.3.4");

        let (_, _, resp) = request(
            addr,
            "POST",
            "/sync/register",
            Some(r#"{"id":"slaveA","ack_generation":1}"#),
        )
        .await;
        assert_eq!(resp["generation"], 0);
        assert!(resp.get("commands").is_none());
    }

    #[tokio::test]
    async fn test_sync_push_and_slaves_view() {
        let ini = format!("{MASTER_INI}[sync.slot2]\nname = spare\nexec = {{\"path\":\"/sys/arm\"}}\n");
        let (addr, _state) = spawn_app(&ini).await;
        request(addr, "POST", "/sync/register", Some(r#"{"id":"slaveA"}"#)).await;

        let push = r#"{"moves":[{"slave_id":"slaveA","slot":2}]}"#;
        let (status, _, resp) = request(addr, "POST", "/sync/push", Some(push)).await;
        assert_eq!(status, 200);
        assert_eq!(resp["status"], "updated");
        assert_eq!(resp["assignments"][0]["slave_id"], Value::Null);
        assert_eq!(resp["assignments"][0]["generation"], 2);
        assert_eq!(resp["assignments"][1]["slave_id"], "slaveA");
        assert_eq!(resp["assignments"][1]["generation"], 1);

        let (status, _, view) = request(addr, "GET", "/sync/slaves", None).await;
        assert_eq!(status, 200);
        assert_eq!(view["slaves"][0]["id"], "slaveA");
        assert_eq!(view["slaves"][0]["slot"], 2);
        assert_eq!(view["slots"][0]["prefer_id"], "slaveA");

        let (status, _, body) = request(
            addr,
            "POST",
            "/sync/push",
            Some(r#"{"moves":[{"slave_id":"ghost","slot":1}]}"#),
        )
        .await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "unknown_slave");

        let (status, _, body) = request(
            addr,
            "POST",
            "/sync/push",
            Some(r#"{"moves":[{"slave_id":"slaveA","slot":7}]}"#),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "bad_slot");
    }

    #[tokio::test]
    async fn test_sync_role_gating() {
        let (addr, _state) = spawn_app("[sync]\nrole = slave\n").await;
        let (status, _, body) =
            request(addr, "POST", "/sync/register", Some(r#"{"id":"x"}"#)).await;
        assert_eq!(status, 503);
        assert_eq!(body["error"], "not_master");

        let (addr, _state) = spawn_app(MASTER_INI).await;
        let (status, _, body) =
            request(addr, "POST", "/sync/bind", Some(r#"{"master_url":"http://x"}"#)).await;
        assert_eq!(status, 503);
        assert_eq!(body["error"], "not_slave");
    }

    #[tokio::test]
    async fn test_sync_bind_overrides_config() {
        let ini = "[sync]\nrole = slave\nmaster_url = http://old:1\nallow_bind = yes\n";
        let (addr, state) = spawn_app(ini).await;
        let (status, _, resp) = request(
            addr,
            "POST",
            "/sync/bind",
            Some(r#"{"master_url":"http://10.0.0.9:8080/","register_interval_s":3}"#),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(resp["status"], "bound");
        assert_eq!(resp["master_url"], "http://10.0.0.9:8080");
        let cfg = state.cfg.snapshot().await;
        assert_eq!(cfg.master_url, "http://10.0.0.9:8080");
        assert_eq!(cfg.register_interval_s, 3);

        // Unresolvable sync id is a backend error, not a bind.
        let (status, _, resp) = request(
            addr,
            "POST",
            "/sync/bind",
            Some(r#"{"master_url":"sync://ghost"}"#),
        )
        .await;
        assert_eq!(status, 502);
        assert_eq!(resp["error"], "unresolved_sync_id");
    }

    #[tokio::test]
    async fn test_bind_disabled_without_flag() {
        let (addr, _state) = spawn_app("[sync]\nrole = slave\n").await;
        let (status, _, body) =
            request(addr, "POST", "/sync/bind", Some(r#"{"master_url":"http://x"}"#)).await;
        assert_eq!(status, 403);
        assert_eq!(body["error"], "bind_disabled");
    }

    #[tokio::test]
    async fn test_ui_serving_and_containment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>ok</h1>").unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        let ini = format!(
            "[ui]\nui_path = {}\nserve_ui = yes\nui_public = yes\n",
            dir.path().display()
        );
        let (addr, _state) = spawn_app(&ini).await;

        let text = send_raw(addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains("Content-Type: text/html"));
        assert!(text.contains("Access-Control-Allow-Origin: *"));
        assert!(text.ends_with("<h1>ok</h1>"));

        let text = send_raw(addr, b"GET /app.js HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains("Content-Type: application/javascript"));

        // HEAD: same head, no body.
        let text = send_raw(addr, b"HEAD /app.js HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains("Content-Length: 14"));
        assert!(text.ends_with("\r\n\r\n"));

        let text = send_raw(addr, b"GET /../secret HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 403"));

        let text = send_raw(addr, b"GET /missing.css HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_ui_disabled() {
        let (addr, _state) = spawn_app("").await;
        let (status, _, body) = request(addr, "GET", "/", None).await;
        assert_eq!(status, 503);
        assert_eq!(body["error"], "ui_disabled");
    }

    #[tokio::test]
    async fn test_media_serving_gated_on_dvr_cap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"fakevideo").unwrap();

        // Without the dvr capability the whole tree is invisible.
        let ini = format!("[server]\nmedia_path = {}\n", dir.path().display());
        let (addr, _state) = spawn_app(&ini).await;
        let (status, _, _) = request(addr, "GET", "/media/clip.mp4", None).await;
        assert_eq!(status, 404);

        let ini = format!(
            "[server]\nmedia_path = {}\n[caps]\ncaps = dvr\n",
            dir.path().display()
        );
        let (addr, _state) = spawn_app(&ini).await;
        let text = send_raw(addr, b"GET /media/clip.mp4 HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains("Content-Type: video/mp4"));
        assert!(text.contains("Last-Modified: "));
        assert!(text.ends_with("fakevideo"));

        let text = send_raw(addr, b"GET /media/../clip.mp4 HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 403"));
    }
}
