/*! fleetlink::config — INI file parsing and the base/effective config split
 *
 * Config flows in two layers:
 *   base       — what was parsed from the INI file on disk
 *   effective  — base plus transient overrides (today: the master reference
 *                and register interval set through /sync/bind)
 *
 * Handlers never touch either directly. They call `SharedConfig::snapshot()`
 * and own the copy for the rest of the request, so a reload mid-request is
 * invisible to them. `rebuild()` re-derives effective from base under the
 * lock; a SIGHUP reload replaces base and rebuilds, keeping overrides.
 *
 * INI grammar: `[section]` headers, `key=value` lines, `#` / `;` comments.
 * Unknown sections and keys are ignored with a debug log so config files can
 * carry keys for the side binaries (relay, bridge, OSD) without complaint.
 */

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Upper bound on configured slots.
pub const MAX_SLOTS: usize = 16;

// ── Types ─────────────────────────────────────────────────────────────────────

/// Which side of the slot protocol this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncRole {
    #[default]
    Unset,
    Master,
    Slave,
}

impl SyncRole {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "master" => SyncRole::Master,
            "slave" => SyncRole::Slave,
            _ => SyncRole::Unset,
        }
    }
}

/// One configured slot: a label, an optional preferred slave, and an ordered
/// list of command templates. Templates stay raw JSON strings and are
/// re-parsed at delivery time; a malformed entry is dropped with a warning
/// then, not at load time.
#[derive(Debug, Clone, Default)]
pub struct SlotCfg {
    pub name: String,
    pub prefer_id: String,
    pub exec: Vec<String>,
}

/// An SSE stream advertisement for `/caps`.
#[derive(Debug, Clone)]
pub struct SseAnnounce {
    pub name: String,
    pub url: String,
}

/// Effective configuration value object. Cloning it is the snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    // [server]
    pub bind: String,
    pub port: u16,
    pub enable_scan: bool,
    pub media_path: String,

    // [exec]
    pub interpreter: String,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,

    // [caps]
    pub device: String,
    pub role: String,
    pub version: String,
    pub caps: Vec<String>,
    pub include_net_info: bool,

    // [announce]
    pub sse: Vec<SseAnnounce>,

    // [scan]
    pub extra_subnets: Vec<Ipv4Network>,

    // [ui]
    pub ui_path: String,
    pub serve_ui: bool,
    pub ui_public: bool,

    // [sync]
    pub sync_role: SyncRole,
    pub master_url: String,
    pub sync_id: String,
    pub register_interval_s: u64,
    pub allow_bind: bool,
    pub slot_retention_s: u64,
    pub slots: Vec<SlotCfg>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "0.0.0.0".into(),
            port: 8080,
            enable_scan: true,
            media_path: String::new(),
            interpreter: "/bin/sh".into(),
            timeout_ms: 10_000,
            max_output_bytes: 65_536,
            device: String::new(),
            role: String::new(),
            version: env!("CARGO_PKG_VERSION").into(),
            caps: Vec::new(),
            include_net_info: false,
            sse: Vec::new(),
            extra_subnets: Vec::new(),
            ui_path: String::new(),
            serve_ui: false,
            ui_public: false,
            sync_role: SyncRole::Unset,
            master_url: String::new(),
            sync_id: String::new(),
            register_interval_s: 10,
            allow_bind: false,
            slot_retention_s: 0,
            slots: Vec::new(),
        }
    }
}

impl Config {
    /// Parse an INI document. Bad values fall back to their defaults with a
    /// warning; this never refuses a file outright.
    pub fn from_ini(raw: &str) -> Self {
        let mut cfg = Config::default();
        let mut section = String::new();
        // index -> cfg, filled sparsely then flattened below
        let mut slots: Vec<Option<SlotCfg>> = Vec::new();

        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_ascii_lowercase();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                debug!("[config] line {}: no '=', ignored", lineno + 1);
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            if let Some(n) = section
                .strip_prefix("sync.slot")
                .and_then(|n| n.parse::<usize>().ok())
            {
                if n == 0 || n > MAX_SLOTS {
                    warn!("[config] section [{section}]: slot out of range, ignored");
                    continue;
                }
                if slots.len() < n {
                    slots.resize(n, None);
                }
                let slot = slots[n - 1].get_or_insert_with(SlotCfg::default);
                match key.as_str() {
                    "name" => slot.name = value.into(),
                    "prefer_id" => slot.prefer_id = value.into(),
                    "exec" => slot.exec.push(value.into()),
                    _ => debug!("[config] [{section}] {key}: unknown key, ignored"),
                }
                continue;
            }

            match (section.as_str(), key.as_str()) {
                ("server", "port") => cfg.port = parse_num(value, cfg.port, "server.port"),
                ("server", "bind") => cfg.bind = value.into(),
                ("server", "enable_scan") => cfg.enable_scan = parse_bool(value),
                ("server", "media_path") => cfg.media_path = value.into(),

                ("exec", "interpreter") => cfg.interpreter = value.into(),
                ("exec", "timeout_ms") => {
                    cfg.timeout_ms = parse_num(value, cfg.timeout_ms, "exec.timeout_ms")
                }
                ("exec", "max_output_bytes") => {
                    cfg.max_output_bytes =
                        parse_num(value, cfg.max_output_bytes, "exec.max_output_bytes")
                }

                ("caps", "device") => cfg.device = value.into(),
                ("caps", "role") => cfg.role = value.into(),
                ("caps", "version") => cfg.version = value.into(),
                ("caps", "caps") => {
                    cfg.caps = value
                        .split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect()
                }
                ("caps", "include_net_info") => cfg.include_net_info = parse_bool(value),

                ("announce", "sse") => match value.split_once('@') {
                    Some((name, url)) if !name.is_empty() && !url.is_empty() => {
                        cfg.sse.push(SseAnnounce {
                            name: name.trim().into(),
                            url: url.trim().into(),
                        })
                    }
                    _ => warn!("[config] announce.sse: expected <name>@<url>, got {value:?}"),
                },

                ("scan", "extra_subnet") => match value.parse::<Ipv4Network>() {
                    Ok(net) if net.prefix() > 0 => cfg.extra_subnets.push(net),
                    Ok(_) => warn!("[config] scan.extra_subnet: zero prefix, ignored"),
                    Err(e) => warn!("[config] scan.extra_subnet {value:?}: {e}"),
                },

                ("ui", "ui_path") => cfg.ui_path = value.into(),
                ("ui", "serve_ui") => cfg.serve_ui = parse_bool(value),
                ("ui", "ui_public") => cfg.ui_public = parse_bool(value),

                ("sync", "role") => cfg.sync_role = SyncRole::parse(value),
                ("sync", "master_url") => cfg.master_url = value.into(),
                ("sync", "id") => cfg.sync_id = value.into(),
                ("sync", "register_interval_s") => {
                    cfg.register_interval_s =
                        parse_num(value, cfg.register_interval_s, "sync.register_interval_s")
                }
                ("sync", "allow_bind") => cfg.allow_bind = parse_bool(value),
                ("sync", "slot_retention_s") => {
                    cfg.slot_retention_s =
                        parse_num(value, cfg.slot_retention_s, "sync.slot_retention_s")
                }

                _ => debug!("[config] [{section}] {key}: unknown key, ignored"),
            }
        }

        cfg.slots = slots.into_iter().map(Option::unwrap_or_default).collect();
        if cfg.sync_role != SyncRole::Unset && cfg.sync_id.is_empty() {
            cfg.sync_id = format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        }
        cfg
    }

    /// Load and parse the INI file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Ok(Config::from_ini(&raw))
    }

    /// True when the capability list names `cap`.
    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps.iter().any(|c| c == cap)
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_num<T: std::str::FromStr + Copy>(raw: &str, fallback: T, what: &str) -> T {
    raw.trim().parse().unwrap_or_else(|_| {
        warn!("[config] {what}: bad value {raw:?}, keeping default");
        fallback
    })
}

// ── Shared handle ─────────────────────────────────────────────────────────────

/// Transient overrides layered onto the base config.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub master_url: Option<String>,
    pub register_interval_s: Option<u64>,
}

struct Inner {
    base: Config,
    overrides: Overrides,
    effective: Config,
}

/// The process-wide config handle. Readers snapshot; writers mutate base or
/// overrides and rebuild.
pub struct SharedConfig {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl SharedConfig {
    pub fn new(base: Config, path: Option<PathBuf>) -> Self {
        let effective = derive_effective(&base, &Overrides::default());
        SharedConfig {
            path,
            inner: Mutex::new(Inner {
                base,
                overrides: Overrides::default(),
                effective,
            }),
        }
    }

    /// Point-in-time copy of the effective config. The caller owns it; later
    /// reloads or binds do not touch it.
    pub async fn snapshot(&self) -> Config {
        self.inner.lock().await.effective.clone()
    }

    /// Install a new master reference (and optionally register interval),
    /// as `/sync/bind` does, then rebuild the effective config.
    pub async fn set_master_override(&self, master_url: String, interval_s: Option<u64>) {
        let mut inner = self.inner.lock().await;
        inner.overrides.master_url = Some(master_url);
        if interval_s.is_some() {
            inner.overrides.register_interval_s = interval_s;
        }
        inner.effective = derive_effective(&inner.base, &inner.overrides);
    }

    /// Re-read the INI file into the base config and rebuild. Overrides
    /// survive the reload. No-op when the daemon was started without a file.
    pub async fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            debug!("[config] reload requested but no config file was given");
            return Ok(());
        };
        let fresh = Config::load(path)?;
        let mut inner = self.inner.lock().await;
        inner.base = fresh;
        inner.effective = derive_effective(&inner.base, &inner.overrides);
        Ok(())
    }
}

fn derive_effective(base: &Config, overrides: &Overrides) -> Config {
    let mut eff = base.clone();
    if let Some(url) = &overrides.master_url {
        eff.master_url = url.clone();
    }
    if let Some(interval) = overrides.register_interval_s {
        eff.register_interval_s = interval;
    }
    eff
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# fleetlink node config
[server]
port = 9000
bind = 127.0.0.1
enable_scan = no

[exec]
interpreter = /usr/bin/env
timeout_ms = 2500
max_output_bytes = 4096

[caps]
device = cam-7
role = relay
caps = dvr, sse,udp-relay
include_net_info = yes

[announce]
sse = status@http://IP:8080/events
sse = video@{IP}:8600/v

[scan]
extra_subnet = 10.5.0.0/24
extra_subnet = 10.9.9.9/32
extra_subnet = 0.0.0.0/0

[ui]
ui_path = /opt/ui
serve_ui = true

[sync]
role = master
id = hub-1
slot_retention_s = 600

[sync.slot1]
name = primary
prefer_id = slaveA
exec = {\"path\":\"/sys/ping\",\"args\":[\"1.2.3.4\"]}
exec = {\"path\":\"/sys/arm\"}

[sync.slot3]
name = spare
";

    #[test]
    fn test_parse_sections_and_keys() {
        let cfg = Config::from_ini(SAMPLE);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.bind, "127.0.0.1");
        assert!(!cfg.enable_scan);
        assert_eq!(cfg.interpreter, "/usr/bin/env");
        assert_eq!(cfg.timeout_ms, 2500);
        assert_eq!(cfg.max_output_bytes, 4096);
        assert_eq!(cfg.device, "cam-7");
        assert_eq!(cfg.role, "relay");
        assert_eq!(cfg.caps, vec!["dvr", "sse", "udp-relay"]);
        assert!(cfg.include_net_info);
        assert_eq!(cfg.ui_path, "/opt/ui");
        assert!(cfg.serve_ui);
        assert!(!cfg.ui_public);
        assert_eq!(cfg.sync_role, SyncRole::Master);
        assert_eq!(cfg.sync_id, "hub-1");
        assert_eq!(cfg.slot_retention_s, 600);
    }

    #[test]
    fn test_repeatable_keys() {
        let cfg = Config::from_ini(SAMPLE);
        assert_eq!(cfg.sse.len(), 2);
        assert_eq!(cfg.sse[0].name, "status");
        assert_eq!(cfg.sse[1].url, "{IP}:8600/v");
        // the /0 entry is rejected, the /32 kept
        assert_eq!(cfg.extra_subnets.len(), 2);
        assert_eq!(cfg.extra_subnets[1].prefix(), 32);
    }

    #[test]
    fn test_slot_sections_flatten_sparse() {
        let cfg = Config::from_ini(SAMPLE);
        assert_eq!(cfg.slots.len(), 3);
        assert_eq!(cfg.slots[0].name, "primary");
        assert_eq!(cfg.slots[0].prefer_id, "slaveA");
        assert_eq!(cfg.slots[0].exec.len(), 2);
        // slot2 never configured but present so slot3 keeps its index
        assert_eq!(cfg.slots[1].name, "");
        assert!(cfg.slots[1].exec.is_empty());
        assert_eq!(cfg.slots[2].name, "spare");
    }

    #[test]
    fn test_defaults_and_bad_values() {
        let cfg = Config::from_ini("[server]\nport = not-a-number\n");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.interpreter, "/bin/sh");
        assert_eq!(cfg.timeout_ms, 10_000);
        assert_eq!(cfg.max_output_bytes, 65_536);
        assert!(cfg.enable_scan);
        assert_eq!(cfg.sync_role, SyncRole::Unset);
        assert!(cfg.sync_id.is_empty());
    }

    #[test]
    fn test_sync_id_generated_when_role_set() {
        let cfg = Config::from_ini("[sync]\nrole = slave\n");
        assert!(cfg.sync_id.starts_with("node-"));
        assert_eq!(cfg.sync_id.len(), "node-".len() + 8);
    }

    #[test]
    fn test_comments_and_garbage_ignored() {
        let cfg = Config::from_ini("; comment\n# more\nnaked line\n[unknown]\nx = 1\n");
        assert_eq!(cfg.port, 8080);
    }

    #[tokio::test]
    async fn test_snapshot_isolated_from_override() {
        let shared = SharedConfig::new(Config::from_ini("[sync]\nrole=slave\nmaster_url=http://a\n"), None);
        let before = shared.snapshot().await;
        shared
            .set_master_override("http://b:8080".into(), Some(3))
            .await;
        let after = shared.snapshot().await;
        assert_eq!(before.master_url, "http://a");
        assert_eq!(after.master_url, "http://b:8080");
        assert_eq!(after.register_interval_s, 3);
    }
}
