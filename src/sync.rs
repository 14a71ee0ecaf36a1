/*! fleetlink::sync — master-side slave registry and slot table
 *
 * A slot is a fixed-index bucket holding at most one slave identifier plus a
 * monotonically increasing generation counter. Slaves register periodically;
 * the master answers with their slot and, when the slot's generation is
 * ahead of what the slave has acknowledged, the slot's configured command
 * set. Generation 0 is reserved as "never issued / no valid ack", so the
 * counter wraps to 1.
 *
 * Every multi-field transition happens under one mutex. The pure table
 * logic lives on `Tables` so the policy is testable without the lock.
 */

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Capacity of the slave record table.
pub const MAX_SLAVES: usize = 64;

// ── Records ───────────────────────────────────────────────────────────────────

/// Master-side bookkeeping for one slave, keyed by its identifier.
#[derive(Debug, Clone)]
pub struct SlaveRecord {
    pub id: String,
    /// Last-observed remote IP.
    pub addr: String,
    /// Callback address the slave announced, if any.
    pub callback_url: String,
    pub device: String,
    pub role: String,
    pub version: String,
    /// Comma-joined capability list.
    pub caps: String,
    pub last_seen_ms: u64,
    /// Internal slot index, -1 when unassigned.
    pub slot: i32,
    pub last_ack_generation: u64,
}

impl SlaveRecord {
    fn new(id: &str) -> Self {
        SlaveRecord {
            id: id.to_string(),
            addr: String::new(),
            callback_url: String::new(),
            device: String::new(),
            role: String::new(),
            version: String::new(),
            caps: String::new(),
            last_seen_ms: 0,
            slot: -1,
            last_ack_generation: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    assignee: String,
    generation: u64,
    manual_override: bool,
}

/// Generation increment with 0 reserved.
fn bump(generation: &mut u64) {
    *generation = generation.checked_add(1).unwrap_or(1);
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// String or array; collapsed to a comma-joined list.
    #[serde(default)]
    pub caps: Option<Value>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub ack_generation: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub slave_id: String,
    /// External 1-based slot; null means unassign.
    pub slot: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PushRequest {
    #[serde(default)]
    pub moves: Vec<MoveRequest>,
    #[serde(default)]
    pub replay_slots: Vec<u64>,
    #[serde(default)]
    pub replay_ids: Vec<String>,
    #[serde(default)]
    pub delete_ids: Vec<String>,
}

/// Validation failures for `/sync/push`.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PushError {
    #[error("unknown slave {0}")]
    UnknownSlave(String),
    #[error("slot {0} out of range")]
    BadSlot(u64),
}

// ── Tables ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    slaves: HashMap<String, SlaveRecord>,
    slots: Vec<Slot>,
}

impl Tables {
    /// Grow the slot table to the configured count. Slots are never shrunk
    /// at runtime so existing assignments survive a config reload.
    fn ensure_slots(&mut self, cfg: &Config) {
        if self.slots.len() < cfg.slots.len() {
            self.slots.resize(cfg.slots.len(), Slot::default());
        }
    }

    fn release_slot(&mut self, s: usize) {
        if self.slots[s].assignee.is_empty() {
            return;
        }
        debug!("[sync] slot {} released (was {})", s + 1, self.slots[s].assignee);
        self.slots[s].assignee.clear();
        self.slots[s].manual_override = false;
        bump(&mut self.slots[s].generation);
    }

    /// Registration-time cleanup: orphaned slots, then retention expiry.
    fn prune(&mut self, cfg: &Config, now_ms: u64) {
        for s in 0..self.slots.len() {
            let holder = self.slots[s].assignee.clone();
            if !holder.is_empty() && !self.slaves.contains_key(&holder) {
                self.release_slot(s);
            }
        }
        if cfg.slot_retention_s == 0 {
            return;
        }
        let cutoff = now_ms.saturating_sub(cfg.slot_retention_s * 1000);
        for s in 0..self.slots.len() {
            let holder = self.slots[s].assignee.clone();
            if holder.is_empty() {
                continue;
            }
            let expired = self
                .slaves
                .get(&holder)
                .map(|r| r.last_seen_ms < cutoff)
                .unwrap_or(true);
            if expired {
                self.release_slot(s);
                if let Some(rec) = self.slaves.get_mut(&holder) {
                    rec.slot = -1;
                }
            }
        }
        self.slaves
            .retain(|_, rec| rec.last_seen_ms >= cutoff || rec.slot >= 0);
    }

    /// Put `id` into slot `s`, fixing both sides' bookkeeping. The
    /// generation moves only when the assignee actually changes; the push
    /// path has its own unconditional variant.
    fn take_slot(&mut self, s: usize, id: &str) {
        let prev = self.slots[s].assignee.clone();
        if prev != id {
            self.slots[s].assignee = id.to_string();
            self.slots[s].manual_override = false;
            bump(&mut self.slots[s].generation);
        }
        if !prev.is_empty() && prev != id {
            if let Some(old) = self.slaves.get_mut(&prev) {
                if old.slot == s as i32 {
                    old.slot = -1;
                }
            }
        }
        if let Some(rec) = self.slaves.get_mut(id) {
            if rec.slot != s as i32 {
                rec.last_ack_generation = 0;
            }
            rec.slot = s as i32;
        }
    }

    /// Ordered assignment policy. `forbid` marks a slot the caller just
    /// displaced this slave out of, so the recursion cannot ping-pong.
    fn assign_slot(&mut self, cfg: &Config, id: &str, forbid: Option<usize>) -> Option<usize> {
        // Already holding a valid slot: keep it.
        if let Some(rec) = self.slaves.get(id) {
            let s = rec.slot;
            if s >= 0 && (s as usize) < self.slots.len() && self.slots[s as usize].assignee == id {
                return Some(s as usize);
            }
        }

        // Preferred slot: take it when free, ours, or occupied without a
        // manual override (an operator's explicit push is not undone by
        // automatic preference).
        let preferred = cfg
            .slots
            .iter()
            .position(|sc| !sc.prefer_id.is_empty() && sc.prefer_id == id)
            .filter(|p| Some(*p) != forbid && *p < self.slots.len());
        if let Some(p) = preferred {
            let occupant = self.slots[p].assignee.clone();
            if occupant.is_empty() || occupant == id {
                self.take_slot(p, id);
                return Some(p);
            }
            if !self.slots[p].manual_override {
                info!("[sync] {id} displaces {occupant} from preferred slot {}", p + 1);
                self.take_slot(p, id);
                if self.assign_slot(cfg, &occupant, Some(p)).is_none() {
                    if let Some(rec) = self.slaves.get_mut(&occupant) {
                        rec.slot = -1;
                        rec.last_ack_generation = 0;
                    }
                }
                return Some(p);
            }
        }

        // A slot still listing this id (stale assignment), else first empty.
        let stale = self
            .slots
            .iter()
            .enumerate()
            .position(|(i, sl)| sl.assignee == id && Some(i) != forbid);
        if let Some(s) = stale {
            self.take_slot(s, id);
            return Some(s);
        }
        let empty = self
            .slots
            .iter()
            .enumerate()
            .position(|(i, sl)| sl.assignee.is_empty() && Some(i) != forbid);
        if let Some(s) = empty {
            self.take_slot(s, id);
            return Some(s);
        }
        None
    }

    /// Push-path assignment: bumps the generation unconditionally, so a
    /// clear-and-reset of the same id still advances it, and tracks the
    /// manual-override flag against the configured preference.
    fn apply_push_assignment(&mut self, s: usize, new_id: &str, cfg: &Config) {
        let prev = self.slots[s].assignee.clone();
        self.slots[s].assignee = new_id.to_string();
        self.slots[s].manual_override = !new_id.is_empty()
            && cfg
                .slots
                .get(s)
                .map(|sc| sc.prefer_id != new_id)
                .unwrap_or(true);
        bump(&mut self.slots[s].generation);
        if !prev.is_empty() && prev != new_id {
            if let Some(old) = self.slaves.get_mut(&prev) {
                if old.slot == s as i32 {
                    old.slot = -1;
                    old.last_ack_generation = 0;
                }
            }
        }
        if !new_id.is_empty() {
            if let Some(rec) = self.slaves.get_mut(new_id) {
                if rec.slot != s as i32 {
                    rec.last_ack_generation = 0;
                }
                rec.slot = s as i32;
            }
        }
    }

    fn register(&mut self, cfg: &Config, req: &RegisterRequest, remote_ip: &str, now_ms: u64) -> Value {
        self.ensure_slots(cfg);
        self.prune(cfg, now_ms);

        if !self.slaves.contains_key(&req.id) && self.slaves.len() >= MAX_SLAVES {
            warn!("[sync] registry full, turning away {}", req.id);
            return json!({"status": "waiting", "slot": null, "reason": "registry_full"});
        }

        let rec = self
            .slaves
            .entry(req.id.clone())
            .or_insert_with(|| SlaveRecord::new(&req.id));
        rec.last_seen_ms = now_ms;
        rec.addr = remote_ip.to_string();
        if let Some(v) = &req.device {
            rec.device = v.clone();
        }
        if let Some(v) = &req.role {
            rec.role = v.clone();
        }
        if let Some(v) = &req.version {
            rec.version = v.clone();
        }
        if let Some(v) = req.callback_url.as_ref().or(req.address.as_ref()) {
            rec.callback_url = v.clone();
        }
        if let Some(v) = &req.caps {
            rec.caps = collapse_caps(v);
        }

        let Some(s) = self.assign_slot(cfg, &req.id, None) else {
            return json!({"status": "waiting", "slot": null, "reason": "no_slots_available"});
        };

        let slot_gen = self.slots[s].generation;
        let ack = req.ack_generation.unwrap_or(0);
        // An ack beyond the slot's generation cannot be real; distrust it.
        let effective_ack = if ack > slot_gen { 0 } else { ack };
        if let Some(rec) = self.slaves.get_mut(&req.id) {
            if ack > slot_gen {
                rec.last_ack_generation = 0;
            } else if ack > rec.last_ack_generation {
                rec.last_ack_generation = ack;
            }
        }

        let resend = slot_gen > effective_ack;
        let mut resp = json!({
            "status": "registered",
            "id": req.id,
            "interval_s": cfg.register_interval_s,
            "slot": s + 1,
            "slot_generation": slot_gen,
            "generation": if resend { slot_gen } else { 0 },
        });
        if let Some(label) = cfg.slots.get(s).map(|sc| sc.name.as_str()).filter(|l| !l.is_empty()) {
            resp["slot_label"] = json!(label);
        }
        if resend {
            resp["commands"] = build_commands(cfg, s);
        }
        resp
    }

    fn push(&mut self, cfg: &Config, req: &PushRequest) -> Result<Value, PushError> {
        self.ensure_slots(cfg);

        // Validate before mutating anything: the request applies atomically
        // or not at all.
        for mv in &req.moves {
            if !self.slaves.contains_key(&mv.slave_id) {
                return Err(PushError::UnknownSlave(mv.slave_id.clone()));
            }
            if let Some(ext) = mv.slot {
                if ext == 0 || ext as usize > self.slots.len() {
                    return Err(PushError::BadSlot(ext));
                }
            }
        }
        for &ext in &req.replay_slots {
            if ext == 0 || ext as usize > self.slots.len() {
                return Err(PushError::BadSlot(ext));
            }
        }

        // Deletions first; they also release any slot the record held.
        let mut deleted_ids = Vec::new();
        for id in &req.delete_ids {
            if let Some(rec) = self.slaves.remove(id) {
                if rec.slot >= 0 && (rec.slot as usize) < self.slots.len() {
                    let s = rec.slot as usize;
                    if self.slots[s].assignee == *id {
                        self.release_slot(s);
                    }
                }
                deleted_ids.push(id.clone());
            }
        }

        // Project the moves onto a planned copy of the assignees, then
        // commit every touched slot.
        let mut planned: Vec<String> = self.slots.iter().map(|sl| sl.assignee.clone()).collect();
        let mut dirty: Vec<usize> = Vec::new();
        let mut applied_moves = 0usize;
        for mv in &req.moves {
            if !self.slaves.contains_key(&mv.slave_id) {
                continue; // deleted by this same request
            }
            for (i, a) in planned.iter_mut().enumerate() {
                if *a == mv.slave_id {
                    a.clear();
                    if !dirty.contains(&i) {
                        dirty.push(i);
                    }
                }
            }
            if let Some(ext) = mv.slot {
                let s = (ext - 1) as usize;
                planned[s] = mv.slave_id.clone();
                if !dirty.contains(&s) {
                    dirty.push(s);
                }
            }
            applied_moves += 1;
        }
        dirty.sort_unstable();
        for &s in &dirty {
            let id = planned[s].clone();
            self.apply_push_assignment(s, &id, cfg);
        }

        // Replays force a retransmission on next contact.
        let mut replayed = Vec::new();
        for &ext in &req.replay_slots {
            let s = (ext - 1) as usize;
            bump(&mut self.slots[s].generation);
            let holder = self.slots[s].assignee.clone();
            if let Some(rec) = self.slaves.get_mut(&holder) {
                rec.last_ack_generation = 0;
            }
            replayed.push(ext);
        }
        for id in &req.replay_ids {
            let Some(slot) = self.slaves.get(id).map(|r| r.slot).filter(|s| *s >= 0) else {
                continue;
            };
            let s = slot as usize;
            if s < self.slots.len() {
                bump(&mut self.slots[s].generation);
                if let Some(rec) = self.slaves.get_mut(id) {
                    rec.last_ack_generation = 0;
                }
                if !replayed.contains(&(s as u64 + 1)) {
                    replayed.push(s as u64 + 1);
                }
            }
        }

        let mut resp = json!({
            "status": "updated",
            "moves": applied_moves,
            "replayed_slots": replayed.len(),
            "deleted": deleted_ids.len(),
            "assignments": self.assignments(cfg),
        });
        if !deleted_ids.is_empty() {
            resp["deleted_ids"] = json!(deleted_ids);
        }
        Ok(resp)
    }

    fn assignments(&self, cfg: &Config) -> Value {
        let list: Vec<Value> = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, sl)| {
                let mut entry = json!({
                    "slot": i + 1,
                    "slave_id": if sl.assignee.is_empty() { Value::Null } else { json!(sl.assignee) },
                    "generation": sl.generation,
                });
                if let Some(label) = cfg.slots.get(i).map(|sc| sc.name.as_str()).filter(|l| !l.is_empty()) {
                    entry["slot_label"] = json!(label);
                }
                entry
            })
            .collect();
        json!(list)
    }

    fn view(&self, cfg: &Config) -> Value {
        let mut slaves: Vec<&SlaveRecord> = self.slaves.values().collect();
        slaves.sort_by(|a, b| a.id.cmp(&b.id));
        let slaves: Vec<Value> = slaves
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "addr": r.addr,
                    "callback_url": r.callback_url,
                    "device": r.device,
                    "role": r.role,
                    "version": r.version,
                    "caps": r.caps,
                    "last_seen_ms": r.last_seen_ms,
                    "slot": if r.slot >= 0 { json!(r.slot + 1) } else { Value::Null },
                    "ack_generation": r.last_ack_generation,
                })
            })
            .collect();
        let slots: Vec<Value> = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, sl)| {
                let mut entry = json!({
                    "slot": i + 1,
                    "slave_id": if sl.assignee.is_empty() { Value::Null } else { json!(sl.assignee) },
                    "generation": sl.generation,
                    "manual_override": sl.manual_override,
                });
                if let Some(sc) = cfg.slots.get(i) {
                    if !sc.name.is_empty() {
                        entry["label"] = json!(sc.name);
                    }
                    if !sc.prefer_id.is_empty() {
                        entry["prefer_id"] = json!(sc.prefer_id);
                    }
                }
                entry
            })
            .collect();
        json!({"slaves": slaves, "slots": slots})
    }
}

/// `caps` arrives as either a string or an array; both collapse to one
/// comma-joined list.
fn collapse_caps(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str())
            .collect::<Vec<_>>()
            .join(","),
        _ => String::new(),
    }
}

/// Re-parse the configured command templates for one slot. Malformed
/// entries are dropped with a warning, never delivered.
fn build_commands(cfg: &Config, s: usize) -> Value {
    let Some(sc) = cfg.slots.get(s) else {
        return json!([]);
    };
    let cmds: Vec<Value> = sc
        .exec
        .iter()
        .filter_map(|raw| match serde_json::from_str::<Value>(raw) {
            Ok(v) if v.is_object() => Some(v),
            Ok(_) => {
                warn!("[sync] slot {}: exec template is not an object, dropped", s + 1);
                None
            }
            Err(e) => {
                warn!("[sync] slot {}: bad exec template ({e}), dropped", s + 1);
                None
            }
        })
        .collect();
    json!(cmds)
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// The lock around the tables; everything public goes through here.
pub struct SyncState {
    tables: Mutex<Tables>,
}

impl SyncState {
    pub fn new() -> Self {
        SyncState {
            tables: Mutex::new(Tables::default()),
        }
    }

    pub async fn register(
        &self,
        cfg: &Config,
        req: &RegisterRequest,
        remote_ip: &str,
        now_ms: u64,
    ) -> Value {
        self.tables.lock().await.register(cfg, req, remote_ip, now_ms)
    }

    pub async fn push(&self, cfg: &Config, req: &PushRequest) -> Result<Value, PushError> {
        self.tables.lock().await.push(cfg, req)
    }

    pub async fn view(&self, cfg: &Config) -> Value {
        let mut tables = self.tables.lock().await;
        tables.ensure_slots(cfg);
        tables.view(cfg)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
