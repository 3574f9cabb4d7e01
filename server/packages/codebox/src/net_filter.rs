//! SSRF guard for tool-initiated fetches.
//!
//! Checks operate on the literal hostname or IP text of the URL only. No DNS
//! resolution happens here, so a public name that resolves to a private
//! address is not caught.

use url::{Host, Url};

const BLOCKED_HOSTNAMES: [&str; 3] = ["localhost", "0.0.0.0", "::1"];
const BLOCKED_SUFFIXES: [&str; 2] = [".local", ".internal"];

pub fn is_allowed(url: &str) -> bool {
    match Url::parse(url) {
        Ok(url) => is_allowed_url(&url),
        Err(_) => false,
    }
}

pub fn is_allowed_url(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let hostname = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        // Display form, without the URL brackets.
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => return false,
    };
    is_allowed_hostname(&hostname)
}

pub fn is_allowed_hostname(hostname: &str) -> bool {
    let hostname = hostname.to_ascii_lowercase();
    if BLOCKED_HOSTNAMES.contains(&hostname.as_str()) {
        return false;
    }
    if BLOCKED_SUFFIXES
        .iter()
        .any(|suffix| hostname.ends_with(suffix))
    {
        return false;
    }
    if let Some(octets) = parse_dotted_quad(&hostname) {
        return !is_private_ipv4(octets);
    }
    if hostname.contains(':') {
        return !is_private_ipv6(&hostname);
    }
    true
}

fn parse_dotted_quad(hostname: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut parts = hostname.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = part.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

fn is_private_ipv4([a, b, _, _]: [u8; 4]) -> bool {
    matches!(a, 10 | 127 | 0)
        || (a == 192 && b == 168)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 169 && b == 254)
}

fn is_private_ipv6(lowercase: &str) -> bool {
    lowercase.starts_with("fe80:") || lowercase.starts_with("fc") || lowercase.starts_with("fd")
}
