/*! fleetlink::slave — the slave-side registration loop
 *
 * One long-lived task: resolve the master reference, POST a registration
 * carrying our acknowledged generation, run whatever command set comes
 * back through the execution runner, acknowledge on the next round, sleep,
 * repeat. Every state transition is logged once; repeats are suppressed so
 * an unreachable master does not flood the journal.
 *
 * Master references come in two shapes:
 *   http://host:port[/prefix]   used as-is
 *   sync://<id>[/prefix]        resolved against the scan registry by the
 *                               id the peer announces in /caps
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, SyncRole};
use crate::exec;
use crate::scan::Scanner;
use crate::state::AppState;
use crate::sysinfo;

/// Flat backoff after any resolution or registration failure.
const RETRY_DELAY_S: u64 = 5;
/// Registration POST deadline.
const REGISTER_TIMEOUT_S: u64 = 5;

// ── Loop state ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Progress {
    pub last_received_generation: u64,
    pub applied_generation: u64,
    pub slot: i64,
    pub slot_label: String,
    last_logged: String,
}

pub struct SlaveControl {
    pub running: AtomicBool,
    progress: Mutex<Progress>,
}

impl SlaveControl {
    pub fn new() -> Self {
        SlaveControl {
            running: AtomicBool::new(false),
            progress: Mutex::new(Progress::default()),
        }
    }

    /// Forget everything we acknowledged; the next registration replays.
    pub async fn clear_ack(&self) {
        let mut p = self.progress.lock().await;
        p.applied_generation = 0;
        p.last_received_generation = 0;
        p.slot = -1;
        p.slot_label.clear();
    }

    pub async fn applied_generation(&self) -> u64 {
        self.progress.lock().await.applied_generation
    }

    /// Log a state transition exactly once per change.
    async fn log_state(&self, new_state: &str) {
        let mut p = self.progress.lock().await;
        if p.last_logged != new_state {
            info!("[slave] state: {new_state}");
            p.last_logged = new_state.to_string();
        }
    }
}

// ── Master resolution ─────────────────────────────────────────────────────────

/// Turn a configured master reference into a base URL, or None when a
/// sync:// id is not (yet) in the registry.
pub async fn resolve_master(master_url: &str, scanner: &Scanner) -> Option<String> {
    let raw = master_url.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.trim_end_matches('/').to_string());
    }
    let rest = raw.strip_prefix("sync://")?;
    let (id, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    if id.is_empty() {
        return None;
    }
    let (ip, port) = scanner.lookup_sync_id(id).await?;
    Some(format!("http://{ip}:{port}{}", path.trim_end_matches('/')))
}

// ── One registration round ────────────────────────────────────────────────────

fn registration_body(cfg: &Config, ack: u64) -> Value {
    let mut body = json!({
        "id": cfg.sync_id,
        "ack_generation": ack,
    });
    if !cfg.device.is_empty() {
        body["device"] = json!(cfg.device);
    }
    if !cfg.role.is_empty() {
        body["role"] = json!(cfg.role);
    }
    if !cfg.version.is_empty() {
        body["version"] = json!(cfg.version);
    }
    if !cfg.caps.is_empty() {
        body["caps"] = json!(cfg.caps);
    }
    if let Some(ifa) = sysinfo::interfaces_v4().first() {
        body["callback_url"] = json!(format!("http://{}:{}", ifa.ip, cfg.port));
    }
    body
}

/// Run one generation's command set in configured order. All commands must
/// exit 0 for the set to count as applied.
async fn apply_commands(cfg: &Config, commands: &[Value]) -> bool {
    for (i, cmd) in commands.iter().enumerate() {
        let Some(path) = cmd.get("path").and_then(|p| p.as_str()) else {
            warn!("[slave] command {} has no path, set rejected", i + 1);
            return false;
        };
        let args: Vec<String> = cmd
            .get("args")
            .and_then(|a| a.as_array())
            .map(|a| {
                a.iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        match exec::run(&cfg.interpreter, path, &args, cfg.timeout_ms, cfg.max_output_bytes).await {
            Ok(out) if out.rc == 0 => {
                debug!("[slave] command {} ok ({} ms)", i + 1, out.elapsed_ms);
            }
            Ok(out) => {
                warn!(
                    "[slave] command {} ({path}) failed rc={} stderr={:?}",
                    i + 1,
                    out.rc,
                    out.stderr.trim()
                );
                return false;
            }
            Err(e) => {
                warn!("[slave] command {} ({path}) spawn failed: {e}", i + 1);
                return false;
            }
        }
    }
    true
}

/// Digest a registration response: remember the slot, apply any delivered
/// command set, and advance the generation watermarks. The applied
/// generation only moves when the whole set succeeded.
async fn handle_response(ctl: &SlaveControl, cfg: &Config, resp: &Value) {
    let slot = resp.get("slot").and_then(|s| s.as_i64()).unwrap_or(-1);
    let label = resp
        .get("slot_label")
        .and_then(|l| l.as_str())
        .unwrap_or_default()
        .to_string();
    {
        let mut p = ctl.progress.lock().await;
        if p.slot != slot {
            info!("[slave] slot is now {}", if slot > 0 { slot.to_string() } else { "none".into() });
        }
        p.slot = slot;
        p.slot_label = label;
    }

    let generation = resp.get("generation").and_then(|g| g.as_u64()).unwrap_or(0);
    let Some(commands) = resp.get("commands").and_then(|c| c.as_array()) else {
        return;
    };
    if generation == 0 {
        return;
    }
    {
        let mut p = ctl.progress.lock().await;
        if generation > p.last_received_generation {
            p.last_received_generation = generation;
        }
        if p.applied_generation >= generation {
            return; // already applied this generation
        }
    }
    info!("[slave] applying generation {generation} ({} commands)", commands.len());
    if apply_commands(cfg, commands).await {
        let mut p = ctl.progress.lock().await;
        if generation > p.applied_generation {
            p.applied_generation = generation;
        }
        info!("[slave] generation {generation} applied");
    } else {
        warn!("[slave] generation {generation} not applied, will retry");
    }
}

// ── The loop ──────────────────────────────────────────────────────────────────

/// Sleep in one-second slices so a stop request is honoured promptly.
async fn sleep_sliced(state: &AppState, seconds: u64) {
    for _ in 0..seconds.max(1) {
        if state.stopping() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

pub async fn run_loop(state: Arc<AppState>) {
    let ctl = &state.slave;
    ctl.running.store(true, Ordering::SeqCst);
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(REGISTER_TIMEOUT_S))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("[slave] http client build failed: {e}");
            ctl.running.store(false, Ordering::SeqCst);
            return;
        }
    };

    while !state.stopping() {
        let cfg = state.cfg.snapshot().await;
        if cfg.sync_role != SyncRole::Slave {
            // Role can change under us on a reload; stay idle until it is
            // slave again.
            ctl.log_state("idle").await;
            sleep_sliced(&state, RETRY_DELAY_S).await;
            continue;
        }

        ctl.log_state("resolving").await;
        let Some(base) = resolve_master(&cfg.master_url, &state.scanner).await else {
            if cfg.enable_scan {
                state.scanner.try_start(cfg.clone());
            }
            ctl.log_state("waiting_for_master").await;
            sleep_sliced(&state, RETRY_DELAY_S).await;
            continue;
        };

        ctl.log_state("registering").await;
        let ack = ctl.applied_generation().await;
        let body = registration_body(&cfg, ack);
        let url = format!("{base}/sync/register");
        let resp = client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(REGISTER_TIMEOUT_S.min(cfg.register_interval_s.max(1))))
            .send()
            .await;
        let parsed: Option<Value> = match resp {
            Ok(r) if r.status().is_success() => r.json().await.ok(),
            Ok(r) => {
                debug!("[slave] {url} answered {}", r.status());
                None
            }
            Err(e) => {
                debug!("[slave] {url}: {e}");
                None
            }
        };
        let Some(parsed) = parsed else {
            ctl.log_state("master_unreachable").await;
            sleep_sliced(&state, RETRY_DELAY_S).await;
            continue;
        };

        ctl.log_state("registered").await;
        handle_response(ctl, &cfg, &parsed).await;

        sleep_sliced(&state, cfg.register_interval_s.max(1)).await;
    }

    ctl.running.store(false, Ordering::SeqCst);
    info!("[slave] loop stopped");
}

// ── Unit tests ────────────────────────────────────────────────────────────────
