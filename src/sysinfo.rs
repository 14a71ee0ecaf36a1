/*! fleetlink::sysinfo — /proc readers + IPv4 interface enumeration
 *
 * Everything here is best-effort: a missing or unparsable /proc file leaves
 * the corresponding field unset, and the caller simply omits it from the
 * JSON it builds. Nothing in this module ever fails the request.
 */

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use serde::Serialize;

// ── Runtime snapshot ──────────────────────────────────────────────────────────

/// Point-in-time host runtime figures for the `/caps` response.
#[derive(Debug, Default, Serialize)]
pub struct RuntimeInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_free_kib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_available_kib: Option<u64>,
    pub ts: u64,
}

/// Unix timestamp in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Unix timestamp in milliseconds.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Collect the runtime snapshot from /proc.
pub fn runtime_info() -> RuntimeInfo {
    let uptime_s = std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| parse_uptime(&s));
    let load = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| parse_loadavg(&s));
    let (mem_free_kib, mem_available_kib) = std::fs::read_to_string("/proc/meminfo")
        .map(|s| parse_meminfo(&s))
        .unwrap_or((None, None));

    RuntimeInfo {
        uptime_s,
        load,
        mem_free_kib,
        mem_available_kib,
        ts: unix_now(),
    }
}

/// First floating-point field of /proc/uptime.
fn parse_uptime(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// First three floats of /proc/loadavg.
fn parse_loadavg(raw: &str) -> Option<[f64; 3]> {
    let mut it = raw.split_whitespace();
    let a = it.next()?.parse().ok()?;
    let b = it.next()?.parse().ok()?;
    let c = it.next()?.parse().ok()?;
    Some([a, b, c])
}

/// MemFree / MemAvailable in KiB out of /proc/meminfo.
fn parse_meminfo(raw: &str) -> (Option<u64>, Option<u64>) {
    let mut free = None;
    let mut avail = None;
    for line in raw.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value = rest.split_whitespace().next().and_then(|v| v.parse().ok());
        match key.trim() {
            "MemFree" => free = value,
            "MemAvailable" => avail = value,
            _ => {}
        }
        if free.is_some() && avail.is_some() {
            break;
        }
    }
    (free, avail)
}

// ── ARP table ─────────────────────────────────────────────────────────────────

/// IPv4 addresses out of /proc/net/arp, excluding loopback and link-local.
pub fn arp_ipv4() -> Vec<Ipv4Addr> {
    std::fs::read_to_string("/proc/net/arp")
        .map(|s| parse_arp(&s))
        .unwrap_or_default()
}

fn parse_arp(raw: &str) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    // First line is the column header.
    for line in raw.lines().skip(1) {
        let Some(field) = line.split_whitespace().next() else {
            continue;
        };
        let Ok(ip) = field.parse::<Ipv4Addr>() else {
            continue;
        };
        if ip.is_loopback() || ip.is_link_local() {
            continue;
        }
        if seen.insert(ip) {
            out.push(ip);
        }
    }
    out
}

// ── Interfaces ────────────────────────────────────────────────────────────────

/// One IPv4-configured, non-loopback host interface.
#[derive(Debug, Clone, Serialize)]
pub struct IfaceV4 {
    pub name: String,
    pub ip: Ipv4Addr,
    #[serde(skip)]
    pub netmask: Ipv4Addr,
}

impl IfaceV4 {
    /// CIDR prefix length derived from the netmask.
    pub fn prefix(&self) -> u8 {
        u32::from(self.netmask).count_ones() as u8
    }
}

/// Enumerate IPv4 host interfaces via getifaddrs.
pub fn interfaces_v4() -> Vec<IfaceV4> {
    let Ok(addrs) = getifaddrs() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for ifa in addrs {
        if ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let Some(ip) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()).map(|s| s.ip()) else {
            continue;
        };
        let netmask = ifa
            .netmask
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|s| s.ip())
            .unwrap_or(Ipv4Addr::new(255, 255, 255, 0));
        if ip.is_loopback() {
            continue;
        }
        out.push(IfaceV4 {
            name: ifa.interface_name.clone(),
            ip,
            netmask,
        });
    }
    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────
