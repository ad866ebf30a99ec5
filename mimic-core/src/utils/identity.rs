use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

/// Key under which a TOTP secret is registered for this client.
///
/// An explicit, non-blank override wins. Otherwise the first IPv4 address the
/// local host name resolves to, falling back to loopback.
pub fn resolve_client_identity(override_id: Option<&str>) -> String {
    if let Some(id) = override_id.map(str::trim).filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    local_address()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .to_string()
}

fn local_address() -> Option<IpAddr> {
    let host = whoami::fallible::hostname().ok()?;
    let addrs = (host.as_str(), 0u16).to_socket_addrs().ok()?;
    let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
    ips.iter()
        .copied()
        .find(IpAddr::is_ipv4)
        .or_else(|| ips.first().copied())
}
