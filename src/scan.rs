/*! fleetlink::scan — LAN discovery and the node registry
 *
 * A scan plans a deduplicated probe list from four sources (current
 * registry, the known-hosts set fed by slave registrations, /proc/net/arp,
 * and the host subnets plus any configured extra CIDRs), then fans it out to
 * a small pool of probe workers that pull targets off a shared atomic index.
 * A peer counts as discovered when it answers `/health` with 200 and then
 * serves a parsable `/caps`.
 *
 * Exactly one scan runs at a time (compare-and-set on the running flag).
 * Registry freshness is tracked per scan sequence: nodes unseen by the
 * finishing scan accrue misses and are dropped once they exceed the limit.
 * Records for the host's own interfaces are never dropped.
 */

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::Config;
use crate::sysinfo::{self, IfaceV4};

// ── Tuning ────────────────────────────────────────────────────────────────────

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const HEALTH_TIMEOUT: Duration = Duration::from_millis(150);
const CAPS_TIMEOUT: Duration = Duration::from_millis(400);
const WORKERS: usize = 16;
const WORKERS_HARD_CAP: usize = 64;
const MAX_TARGETS: usize = 2048;
const STALE_MAX_MISSES: u32 = 2;
/// Probe responses larger than this are cut off; /caps bodies are small.
const MAX_PROBE_RESPONSE: u64 = 64 * 1024;

// ── Records ───────────────────────────────────────────────────────────────────

/// One reachable peer, keyed by (ip, port).
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub role: String,
    pub device: String,
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sync_id: String,
    pub last_seen: u64,
    pub seen_scan: u64,
    pub misses: u32,
    pub is_self: bool,
}

/// Progress of the current or most recent scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub running: bool,
    pub targets: usize,
    pub done: usize,
    pub progress_pct: u32,
    pub last_started: u64,
    pub last_finished: u64,
}

// ── Scanner ───────────────────────────────────────────────────────────────────

pub struct Scanner {
    registry: Mutex<HashMap<(Ipv4Addr, u16), NodeRecord>>,
    known_hosts: Mutex<HashSet<(Ipv4Addr, u16)>>,
    running: AtomicBool,
    targets: AtomicUsize,
    done: AtomicUsize,
    seq: AtomicU64,
    last_started: AtomicU64,
    last_finished: AtomicU64,
}

impl Scanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Scanner {
            registry: Mutex::new(HashMap::new()),
            known_hosts: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            targets: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            last_started: AtomicU64::new(0),
            last_finished: AtomicU64::new(0),
        })
    }

    /// Progress counters are read relaxed; slightly stale is fine, torn is
    /// impossible.
    pub fn status(&self) -> ScanStatus {
        let targets = self.targets.load(Ordering::Relaxed);
        let done = self.done.load(Ordering::Relaxed).min(targets);
        ScanStatus {
            running: self.running.load(Ordering::Relaxed),
            targets,
            done,
            progress_pct: if targets == 0 {
                0
            } else {
                (100 * done / targets) as u32
            },
            last_started: self.last_started.load(Ordering::Relaxed),
            last_finished: self.last_finished.load(Ordering::Relaxed),
        }
    }

    /// All node records, ordered by address for stable output.
    pub async fn nodes(&self) -> Vec<NodeRecord> {
        let reg = self.registry.lock().await;
        let mut out: Vec<NodeRecord> = reg.values().cloned().collect();
        out.sort_by_key(|n| (n.ip, n.port));
        out
    }

    /// Remember an endpoint worth probing on the next scan.
    pub async fn add_known_host(&self, ip: Ipv4Addr, port: u16) {
        self.known_hosts.lock().await.insert((ip, port));
    }

    /// Resolve a sync identifier to the node that announced it.
    pub async fn lookup_sync_id(&self, id: &str) -> Option<(Ipv4Addr, u16)> {
        let reg = self.registry.lock().await;
        reg.values()
            .find(|n| !n.is_self && n.sync_id == id)
            .or_else(|| reg.values().find(|n| n.sync_id == id))
            .map(|n| (n.ip, n.port))
    }

    /// Start a scan unless one is already running. Returns false when the
    /// running flag was already set.
    pub fn try_start(self: &Arc<Self>, cfg: Config) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.targets.store(0, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        self.last_started.store(sysinfo::unix_now(), Ordering::Relaxed);
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            scanner.run_scan(cfg).await;
        });
        true
    }

    async fn run_scan(self: Arc<Self>, cfg: Config) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let ifaces = sysinfo::interfaces_v4();
        let now = sysinfo::unix_now();

        // Seed one self record per interface so peers and the UI always see
        // this node regardless of scan outcome.
        {
            let mut reg = self.registry.lock().await;
            for ifa in &ifaces {
                let rec = reg.entry((ifa.ip, cfg.port)).or_insert_with(|| NodeRecord {
                    ip: ifa.ip,
                    port: cfg.port,
                    role: String::new(),
                    device: String::new(),
                    version: String::new(),
                    sync_id: String::new(),
                    last_seen: 0,
                    seen_scan: 0,
                    misses: 0,
                    is_self: true,
                });
                rec.is_self = true;
                rec.role = cfg.role.clone();
                rec.device = cfg.device.clone();
                rec.version = cfg.version.clone();
                rec.sync_id = cfg.sync_id.clone();
                rec.last_seen = now;
                rec.seen_scan = seq;
                rec.misses = 0;
            }
        }

        let self_ips: HashSet<Ipv4Addr> = ifaces.iter().map(|i| i.ip).collect();
        let registry_ips: Vec<Ipv4Addr> = {
            let reg = self.registry.lock().await;
            reg.values()
                .filter(|n| n.port == cfg.port && !n.is_self)
                .map(|n| n.ip)
                .collect()
        };
        let known_ips: Vec<Ipv4Addr> = {
            let known = self.known_hosts.lock().await;
            known
                .iter()
                .filter(|(_, p)| *p == cfg.port)
                .map(|(ip, _)| *ip)
                .collect()
        };
        let arp = sysinfo::arp_ipv4();

        let targets = plan_targets(
            &registry_ips,
            &known_ips,
            &arp,
            &ifaces,
            &cfg.extra_subnets,
            &self_ips,
        );
        info!("[scan] #{seq}: {} targets, {} interfaces", targets.len(), ifaces.len());
        self.targets.store(targets.len(), Ordering::Relaxed);

        let targets = Arc::new(targets);
        let next = Arc::new(AtomicUsize::new(0));
        let pool = WORKERS.min(WORKERS_HARD_CAP).min(targets.len().max(1));
        let mut workers = Vec::with_capacity(pool);
        for _ in 0..pool {
            let scanner = Arc::clone(&self);
            let targets = Arc::clone(&targets);
            let next = Arc::clone(&next);
            let port = cfg.port;
            workers.push(tokio::spawn(async move {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(ip) = targets.get(i) else { break };
                    scanner.probe_one(*ip, port, seq).await;
                    scanner.done.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for w in workers {
            let _ = w.await;
        }

        let dropped = self.prune(seq).await;
        self.last_finished.store(sysinfo::unix_now(), Ordering::Relaxed);
        self.running.store(false, Ordering::SeqCst);
        info!(
            "[scan] #{seq}: finished, {} probed, {} stale dropped",
            targets.len(),
            dropped
        );
    }

    /// Probe one endpoint: /health must answer 200, then /caps must parse.
    /// Failures are silent; discovery is best-effort by design.
    async fn probe_one(&self, ip: Ipv4Addr, port: u16, seq: u64) {
        let addr = SocketAddr::from((ip, port));
        let Some(health) = http_get(addr, "/health", HEALTH_TIMEOUT).await else {
            return;
        };
        if !status_is_200(&health) {
            return;
        }
        let Some(caps) = http_get(addr, "/caps", CAPS_TIMEOUT).await else {
            return;
        };
        if !status_is_200(&caps) {
            return;
        }
        let Some(body) = caps.split_once("\r\n\r\n").map(|(_, b)| b) else {
            return;
        };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) else {
            return;
        };
        self.upsert_from_caps(ip, port, &parsed, seq).await;
    }

    async fn upsert_from_caps(&self, ip: Ipv4Addr, port: u16, caps: &serde_json::Value, seq: u64) {
        let field = |k: &str| {
            caps.get(k)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let mut reg = self.registry.lock().await;
        let rec = reg.entry((ip, port)).or_insert_with(|| NodeRecord {
            ip,
            port,
            role: String::new(),
            device: String::new(),
            version: String::new(),
            sync_id: String::new(),
            last_seen: 0,
            seen_scan: 0,
            misses: 0,
            is_self: false,
        });
        // is_self is sticky: a probe answering on one of our own addresses
        // must not demote the record.
        rec.role = field("role");
        rec.device = field("device");
        rec.version = field("version");
        rec.sync_id = field("id");
        rec.last_seen = sysinfo::unix_now();
        rec.seen_scan = seq;
        rec.misses = 0;
        debug!("[scan] upsert {ip}:{port} role={} device={}", rec.role, rec.device);
    }

    /// Age out nodes the finishing scan did not see.
    async fn prune(&self, seq: u64) -> usize {
        let mut reg = self.registry.lock().await;
        let before = reg.len();
        reg.retain(|_, rec| {
            if rec.is_self {
                return true;
            }
            if rec.seen_scan != seq {
                rec.misses += 1;
            }
            rec.misses <= STALE_MAX_MISSES
        });
        before - reg.len()
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, rec: NodeRecord) {
        self.registry.lock().await.insert((rec.ip, rec.port), rec);
    }
}

// ── Probe I/O ─────────────────────────────────────────────────────────────────

/// Minimal HTTP/1.1 GET with Connection: close; returns the raw response
/// text (headers + body) or None on any timeout or I/O error.
async fn http_get(addr: SocketAddr, path: &str, read_timeout: Duration) -> Option<String> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await.ok()?.ok()?;
    let mut stream = stream;
    let req = format!(
        "GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        addr.ip()
    );
    stream.write_all(req.as_bytes()).await.ok()?;
    let mut buf = Vec::new();
    timeout(read_timeout, stream.take(MAX_PROBE_RESPONSE).read_to_end(&mut buf))
        .await
        .ok()?
        .ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn status_is_200(response: &str) -> bool {
    let line = response.lines().next().unwrap_or_default();
    line.starts_with("HTTP/1.") && line.contains(" 200")
}

// ── Target planning ───────────────────────────────────────────────────────────

/// Build the deduplicated, ordered probe list:
///   1. nodes already in the registry (matching port, not self)
///   2. the known-hosts set
///   3. /proc/net/arp entries
///   4. each host interface's subnet, network+1 through broadcast-1
///   5. configured extra CIDRs (/32 means a single host)
fn plan_targets(
    registry: &[Ipv4Addr],
    known: &[Ipv4Addr],
    arp: &[Ipv4Addr],
    ifaces: &[IfaceV4],
    extra: &[Ipv4Network],
    self_ips: &HashSet<Ipv4Addr>,
) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |ip: Ipv4Addr, out: &mut Vec<Ipv4Addr>, seen: &mut HashSet<Ipv4Addr>| {
        if out.len() >= MAX_TARGETS {
            return;
        }
        if ip.is_loopback() || ip.is_link_local() || self_ips.contains(&ip) {
            return;
        }
        if seen.insert(ip) {
            out.push(ip);
        }
    };

    for &ip in registry.iter().chain(known).chain(arp) {
        push(ip, &mut out, &mut seen);
    }
    for ifa in ifaces {
        if let Ok(net) = Ipv4Network::new(ifa.ip, ifa.prefix()) {
            walk_subnet(&net, |ip| push(ip, &mut out, &mut seen));
        }
    }
    for net in extra {
        if net.prefix() == 0 {
            continue;
        }
        if net.prefix() == 32 {
            push(net.ip(), &mut out, &mut seen);
        } else {
            walk_subnet(net, |ip| push(ip, &mut out, &mut seen));
        }
    }
    out
}

/// Visit every host address strictly between network and broadcast.
fn walk_subnet(net: &Ipv4Network, mut visit: impl FnMut(Ipv4Addr)) {
    let lo = u32::from(net.network()).saturating_add(1);
    let hi = u32::from(net.broadcast()).saturating_sub(1);
    for v in lo..=hi {
        visit(Ipv4Addr::from(v));
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
