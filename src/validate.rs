//! HELO and mailbox validation. Pure functions, no I/O.

use std::net::{IpAddr, Ipv4Addr};

/// A mailbox that survived [`check_address`], split into its two halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub addr: String,
    pub local: String,
    pub domain: String,
}

/// Réduit toute suite de blancs à une seule espace.
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_gap = false;
    for c in s.chars() {
        if c.is_whitespace() {
            in_gap = true;
        } else {
            if in_gap && !out.is_empty() {
                out.push(' ');
            }
            in_gap = false;
            out.push(c);
        }
    }
    out
}

/// Lexical check of a HELO/EHLO argument. `host_name` and `listen_ip` are the
/// values the sender is not allowed to claim for itself.
pub fn check_helo(helo: &str, host_name: &str, listen_ip: IpAddr) -> bool {
    if helo.is_empty() {
        return false;
    }
    let first = helo.chars().next().unwrap_or('.');
    if first == '.' || first == '-' {
        return false;
    }
    if !helo.contains('.') {
        return false;
    }
    if !helo
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '[' | ']'))
    {
        return false;
    }

    // Usurpation grossière: notre propre nom, localhost, ou l'adresse d'écoute.
    if helo.eq_ignore_ascii_case("localhost")
        || helo.eq_ignore_ascii_case(host_name)
        || helo.eq_ignore_ascii_case(&listen_ip.to_string())
        || helo.starts_with("[127.")
    {
        return false;
    }

    if let Some(inner) = helo.strip_prefix('[') {
        // Address literal form: the brackets must close and enclose an IPv4.
        match inner.strip_suffix(']') {
            Some(ip) => ip.parse::<Ipv4Addr>().is_ok(),
            None => false,
        }
    } else {
        check_address(&format!("postmaster@{helo}")).is_some()
    }
}

/// Validates a MAIL FROM / RCPT TO argument. Returns the unwrapped mailbox or
/// `None` when any rule fails.
pub fn check_address(raw: &str) -> Option<Mailbox> {
    let mut addr = collapse_whitespace(raw.trim());
    if addr.starts_with('<') && addr.ends_with('>') && addr.len() >= 2 {
        addr = addr[1..addr.len() - 1].trim().to_string();
    }
    if addr.contains(' ') {
        return None;
    }
    if addr.chars().filter(|&c| c == '@').count() != 1 {
        return None;
    }
    let (local, domain) = addr.split_once('@')?;
    if local.is_empty() {
        return None;
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return None;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.iter().any(|l| l.is_empty() || l.starts_with('-')) {
        return None;
    }
    if labels.last()?.len() < 2 {
        return None;
    }
    Some(Mailbox {
        local: local.to_string(),
        domain: domain.to_string(),
        addr,
    })
}

/// Une liste vide accepte tout domaine.
pub fn domain_is_local(domain: &str, local_domains: &[String]) -> bool {
    local_domains.is_empty() || local_domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
}

/// Une liste vide accepte toute boîte.
pub fn mailbox_is_local(addr: &str, local_mailboxes: &[String]) -> bool {
    local_mailboxes.is_empty() || local_mailboxes.iter().any(|m| m.eq_ignore_ascii_case(addr))
}
