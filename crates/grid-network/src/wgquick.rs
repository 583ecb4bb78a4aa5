//! wg-quick configuration for the external member.

use std::fmt::Write;

use ipnet::Ipv4Net;

/// Inputs for [`render`].
#[derive(Debug, Clone)]
pub struct WgQuick<'a> {
    /// Carrier address of the external member.
    pub address: Ipv4Net,
    pub private_key: &'a str,
    pub relay_public_key: &'a str,
    pub relay_endpoint: &'a str,
    pub allowed_ips: &'a [Ipv4Net],
    pub keepalive: u32,
}

pub fn render(cfg: &WgQuick<'_>) -> String {
    let allowed = cfg
        .allowed_ips
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "Address = {}", cfg.address);
    let _ = writeln!(out, "PrivateKey = {}", cfg.private_key);
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", cfg.relay_public_key);
    let _ = writeln!(out, "AllowedIPs = {allowed}");
    let _ = writeln!(out, "PersistentKeepalive = {}", cfg.keepalive);
    let _ = writeln!(out, "Endpoint = {}", cfg.relay_endpoint);
    out
}
