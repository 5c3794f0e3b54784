//! Zone helpers shared by the server and plugins.
//!
//! All names handled here are lower-case FQDNs (trailing dot); callers normalise with [`fqdn`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const IP4_ARPA: &str = ".in-addr.arpa.";
pub const IP6_ARPA: &str = ".ip6.arpa.";

pub fn fqdn(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() || name == "." {
        return ".".to_string();
    }
    if name.ends_with('.') { name } else { format!("{}.", name) }
}

/// Server block key ("dns://example.org:1053") to zone ("example.org.").
pub fn normalize_key(key: &str) -> String {
    let key = key.strip_prefix("dns://").unwrap_or(key);
    let host = match key.rfind(':') {
        Some(idx) => &key[..idx],
        None => key,
    };
    fqdn(host)
}

pub fn port_of_key(key: &str) -> Option<u16> {
    let key = key.strip_prefix("dns://").unwrap_or(key);
    key.rfind(':').and_then(|idx| key[idx + 1..].parse().ok())
}

pub fn is_subdomain(parent: &str, child: &str) -> bool {
    parent == "." || child == parent || child.strip_suffix(parent).map_or(false, |rest| rest.ends_with('.'))
}

/// Longest zone that contains `qname`.
pub fn matches<'a>(zones: &'a [String], qname: &str) -> Option<&'a str> {
    zones
        .iter()
        .filter(|z| is_subdomain(z, qname))
        .max_by_key(|z| z.len())
        .map(String::as_str)
}

/// Joins labels into an FQDN; a trailing root label is not doubled.
pub fn join(labels: &[&str]) -> String {
    match labels.split_last() {
        None => ".".to_string(),
        Some((&".", rest)) => format!("{}.", rest.join(".")),
        Some(_) => {
            let joined = labels.join(".");
            if joined.ends_with('.') { joined } else { format!("{}.", joined) }
        }
    }
}

/// Address encoded in a reverse lookup name, e.g. `4.3.2.1.in-addr.arpa.` → `1.2.3.4`.
pub fn extract_address_from_reverse(name: &str) -> Option<IpAddr> {
    if let Some(search) = name.strip_suffix(IP4_ARPA) {
        let mut parts: Vec<&str> = search.split('.').collect();
        parts.reverse();
        return parts.join(".").parse::<Ipv4Addr>().ok().map(IpAddr::V4);
    }
    if let Some(search) = name.strip_suffix(IP6_ARPA) {
        let mut nibbles: Vec<&str> = search.split('.').collect();
        // 必须正好 32 个标签，每个标签一个十六进制字符
        if nibbles.len() != 32 || !nibbles.iter().all(|n| n.len() == 1 && n.as_bytes()[0].is_ascii_hexdigit()) {
            return None;
        }
        nibbles.reverse();
        let joined = nibbles.concat();
        let groups: Vec<&str> = (0..8).map(|i| &joined[i * 4..i * 4 + 4]).collect();
        return groups.join(":").parse::<Ipv6Addr>().ok().map(IpAddr::V6);
    }
    None
}

/// Zones for which a negative answer is handed to the next plugin instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fallthrough {
    zones: Vec<String>,
}

impl Fallthrough {
    /// No arguments means every zone.
    pub fn set_zones_from_args(&mut self, args: &[String]) {
        self.zones = if args.is_empty() {
            vec![".".to_string()]
        } else {
            args.iter().map(|a| normalize_key(a)).collect()
        };
    }

    pub fn through(&self, qname: &str) -> bool {
        matches(&self.zones, qname).is_some()
    }
}
