//! Local network address discovery and STUN-backed configuration probing.
//!
//! Combines local-address discovery (default-route lookup, falling back to
//! interface enumeration) with the STUN client to yield a [`NetCfg`]
//! snapshot the supervisor can compare across iterations.

use std::process::Stdio;

use tokio::process::Command;

use crate::stun::{NatType, StunClient, StunInfo};

/// The comparable record that decides whether the supervised child needs
/// a relaunch. Structurally identical to [`StunInfo`] - kept as a distinct
/// type because it plays a different role (change-detection key, argv
/// template source) even though its shape never diverges from the probe
/// that produces it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetCfg {
    pub nat_type: NatType,
    pub src_ip: String,
    pub ext_ip: String,
    pub stun_host: String,
    pub stun_ip: String,
    pub stun_port: u16,
}

impl From<StunInfo> for NetCfg {
    fn from(info: StunInfo) -> Self {
        Self {
            nat_type: info.nat_type,
            src_ip: info.src_ip,
            ext_ip: info.ext_ip,
            stun_host: info.stun_host,
            stun_ip: info.stun_ip,
            stun_port: info.stun_port,
        }
    }
}

/// Combines local-address discovery with STUN probing into one `NetCfg`
/// snapshot per call. Owns the `StunClient` so its sticky server IP
/// persists across probes, matching the client's own sticky-IP contract.
pub struct NetworkProbe {
    stun: StunClient,
}

impl NetworkProbe {
    pub fn new(stun: StunClient) -> Self {
        Self { stun }
    }

    /// Runs local-address discovery, then a STUN probe bound to whatever
    /// address (or the wildcard) discovery returned.
    pub async fn probe(&mut self) -> NetCfg {
        let src_ip = discover_local_address().await;
        let bind_ip = if src_ip.is_empty() {
            "0.0.0.0".to_string()
        } else {
            src_ip.clone()
        };
        let info = self.stun.probe(&bind_ip, 0).await;
        let mut cfg: NetCfg = info.into();
        cfg.src_ip = src_ip;
        cfg
    }
}

#[derive(Debug, Clone, Copy)]
enum Family {
    V4,
    V6,
}

/// Best-effort discovery of the host's outbound address: the default
/// route's source address (IPv4 checked before IPv6), falling back to
/// plain interface enumeration. Never raises - any failure collapses to
/// an empty string, which the supervisor treats as "no network".
pub async fn discover_local_address() -> String {
    for family in [Family::V4, Family::V6] {
        match default_route_src(family).await {
            Ok(Some(ip)) if !ip.is_empty() => return ip,
            Ok(_) => {}
            Err(err) => tracing::warn!("default route lookup ({family:?}) failed: {err:#}"),
        }
    }
    match fallback_from_interfaces() {
        Some(ip) => ip,
        None => {
            tracing::error!("could not discover any local network address");
            String::new()
        }
    }
}

#[cfg(target_os = "linux")]
async fn default_route_src(family: Family) -> anyhow::Result<Option<String>> {
    use anyhow::Context;

    let flag = match family {
        Family::V4 => "-4",
        Family::V6 => "-6",
    };
    let output = Command::new("ip")
        .args([flag, "route", "show", "default"])
        .stdin(Stdio::null())
        .output()
        .await
        .context("spawn `ip route show default`")?;
    if !output.status.success() {
        // absence of a default route for this family is not an error
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_linux_default_route(&text))
}

#[cfg(target_os = "linux")]
fn parse_linux_default_route(text: &str) -> Option<String> {
    // "default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.42 metric 100"
    let line = text.lines().next()?;
    let mut tokens = line.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "src" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

#[cfg(target_os = "macos")]
async fn default_route_src(family: Family) -> anyhow::Result<Option<String>> {
    use anyhow::Context;

    let flag = match family {
        Family::V4 => "-inet",
        Family::V6 => "-inet6",
    };
    let output = Command::new("route")
        .args(["-n", "get", flag, "default"])
        .stdin(Stdio::null())
        .output()
        .await
        .context("spawn `route -n get default`")?;
    if !output.status.success() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut iface = None;
    for line in text.lines() {
        if let Some(v) = line.trim().strip_prefix("interface:") {
            iface = Some(v.trim().to_string());
        }
    }
    Ok(iface.and_then(|name| src_ip_for_interface(&name, family)))
}

#[cfg(target_os = "macos")]
fn src_ip_for_interface(iface: &str, family: Family) -> Option<String> {
    use std::net::IpAddr;

    if_addrs::get_if_addrs().ok()?.into_iter().find_map(|a| {
        let family_matches = match family {
            Family::V4 => matches!(a.ip(), IpAddr::V4(_)),
            Family::V6 => matches!(a.ip(), IpAddr::V6(_)),
        };
        (a.name == iface && !a.is_loopback() && family_matches).then(|| a.ip().to_string())
    })
}

#[cfg(target_os = "windows")]
async fn default_route_src(family: Family) -> anyhow::Result<Option<String>> {
    use anyhow::Context;

    if matches!(family, Family::V6) {
        // not probed on this platform; IPv4 covers the common case
        return Ok(None);
    }
    let output = Command::new("route")
        .args(["print", "-4", "0.0.0.0"])
        .stdin(Stdio::null())
        .output()
        .await
        .context("spawn `route print`")?;
    if !output.status.success() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() == Some("0.0.0.0") {
            let _mask = tokens.next();
            let _gateway = tokens.next();
            return Ok(tokens.next().map(str::to_string));
        }
    }
    Ok(None)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn default_route_src(_family: Family) -> anyhow::Result<Option<String>> {
    // No routing-table shell-out wired up for this platform; interface
    // enumeration in `fallback_from_interfaces` still covers it.
    Ok(None)
}

/// Interfaces named `lo*` or `docker*` are skipped - a deliberately
/// conservative heuristic that will misclassify unusually-named bridges;
/// retained as-is rather than refined.
fn fallback_from_interfaces() -> Option<String> {
    let ifaces = if_addrs::get_if_addrs().ok()?;
    ifaces
        .into_iter()
        .find(|a| !a.is_loopback() && !a.name.starts_with("lo") && !a.name.starts_with("docker"))
        .map(|a| a.ip().to_string())
}
