//! Dashed IP labels: `1.2.3.4` ⇄ `1-2-3-4`, `1:2:3::4` ⇄ `1-2-3--4`.
//!
//! Decoding is a heuristic: exactly three dashes and no `--` is read as IPv4, everything else
//! as IPv6. An IPv6 literal never has exactly three isolated colons (it needs seven, or a
//! `::` run), so the ambiguity does not arise for well-formed addresses. The rule is kept
//! as is for names that are not addresses at all.

use std::net::IpAddr;

pub fn dash_ip(ip: &str) -> String {
    if ip.matches('.').count() == 3 && !ip.contains("::") {
        ip.replace('.', "-")
    } else {
        ip.replace(':', "-")
    }
}

pub fn undash_ip(name: &str) -> String {
    if name.matches('-').count() == 3 && !name.contains("--") {
        name.replace('-', ".")
    } else {
        name.replace('-', ":")
    }
}

/// Parses a dashed label as an address, falling back to the other dash convention.
pub fn parse_dashed(name: &str) -> Option<IpAddr> {
    let primary = undash_ip(name);
    if let Ok(ip) = primary.parse() {
        return Some(ip);
    }
    let other = if primary.contains('.') { name.replace('-', ":") } else { name.replace('-', ".") };
    other.parse().ok()
}
