//! DNS allow/block list probing (DNSWL / DNSBL).
//!
//! A listing is an A record under `<reversed-octets>.<zone>`. Whitelist zones
//! are probed before blacklist zones and the first hit wins, so a whitelisted
//! client is never also looked up in a blacklist.

use std::net::{IpAddr, Ipv4Addr};

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    White,
    Black,
}

impl ListKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListKind::White => "white",
            ListKind::Black => "black",
        }
    }
}

/// First positive listing found for a client address.
#[derive(Debug, Clone)]
pub struct ListHit {
    pub kind: ListKind,
    pub zone: String,
    /// Comma-joined A record values returned by the zone.
    pub value: String,
}

/// Something that can resolve a DNSxL query name to A records. `None` means
/// "not listed", whatever the underlying reason.
pub trait ZoneLookup {
    fn lookup_ipv4(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Option<Vec<Ipv4Addr>>> + Send;
}

/// Resolver backed by the system DNS configuration, with a public-resolver
/// fallback when no system configuration can be read.
pub struct SystemResolver {
    inner: TokioResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let inner = match TokioResolver::builder(TokioConnectionProvider::default()) {
            Ok(builder) => builder.build(),
            Err(_) => TokioResolver::builder_with_config(
                ResolverConfig::cloudflare(),
                TokioConnectionProvider::default(),
            )
            .build(),
        };
        Self { inner }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneLookup for SystemResolver {
    async fn lookup_ipv4(&self, name: &str) -> Option<Vec<Ipv4Addr>> {
        match self.inner.ipv4_lookup(name).await {
            Ok(lookup) => Some(lookup.iter().map(|a| a.0).collect()),
            Err(_) => None,
        }
    }
}

/// `d.c.b.a.zone` pour l'adresse `a.b.c.d`.
pub fn query_name(ip: Ipv4Addr, zone: &str) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}.{}", o[3], o[2], o[1], o[0], zone)
}

/// Les plages privées et réservées ne sont jamais interrogées.
pub fn is_exempt(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 127
        || o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)
        || (o[0] == 192 && o[1] == 0 && o[2] == 2)
}

/// Probes `whitelists` then `blacklists` for `ip`, returning the first hit.
/// Lookups are sequential; a zone that fails to resolve counts as not listed.
pub async fn probe<R: ZoneLookup>(
    resolver: &R,
    ip: IpAddr,
    whitelists: &[String],
    blacklists: &[String],
) -> Option<ListHit> {
    let v4 = match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return None,
    };
    if is_exempt(v4) {
        return None;
    }

    for (kind, zones) in [(ListKind::White, whitelists), (ListKind::Black, blacklists)] {
        for zone in zones {
            if let Some(addrs) = resolver.lookup_ipv4(&query_name(v4, zone)).await {
                if !addrs.is_empty() {
                    let value = addrs
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(",");
                    return Some(ListHit {
                        kind,
                        zone: zone.clone(),
                        value,
                    });
                }
            }
        }
    }
    None
}
