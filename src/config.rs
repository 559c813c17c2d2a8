use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Instantané de configuration, figé avant le démarrage de l'accepteur.
/// Toutes les sessions le consultent en lecture seule.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    /// Délai maximum par lecture, en millisecondes. 0 = infini.
    pub receive_timeout_ms: u64,
    pub host_name: String,
    pub max_sessions: usize,
    pub max_messages: u32,
    pub max_smtp_err: u32,
    pub max_smtp_noop: u32,
    pub max_smtp_vrfy: u32,
    pub max_smtp_rcpt: usize,
    pub banner_delay_ms: u64,
    pub error_delay_ms: u64,
    /// Octets de corps conservés; au-delà le message est refusé (422).
    pub max_data_size: usize,
    pub store_data: bool,
    pub store_path: PathBuf,
    pub log_path: Option<PathBuf>,
    pub log_verbose: bool,
    pub do_tempfail: bool,
    pub check_helo_format: bool,
    pub early_talkers: bool,
    /// Connexions par minute et par IP; 0 = pas de limite.
    pub max_conn_per_min: usize,
    pub whitelists: Vec<String>,
    pub blacklists: Vec<String>,
    pub local_domains: Vec<String>,
    pub local_mailboxes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 25,
            receive_timeout_ms: 30_000,
            host_name: "mailrecv.local".to_string(),
            max_sessions: 16,
            max_messages: 10,
            max_smtp_err: 9,
            max_smtp_noop: 5,
            max_smtp_vrfy: 5,
            max_smtp_rcpt: 64,
            banner_delay_ms: 0,
            error_delay_ms: 1_000,
            max_data_size: 1_048_576,
            store_data: false,
            store_path: PathBuf::from("."),
            log_path: None,
            log_verbose: false,
            do_tempfail: false,
            check_helo_format: false,
            early_talkers: false,
            max_conn_per_min: 0,
            whitelists: Vec::new(),
            blacklists: Vec::new(),
            local_domains: Vec::new(),
            local_mailboxes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cfg.listen_port, 25);
        assert_eq!(cfg.receive_timeout_ms, 30_000);
        assert_eq!(cfg.host_name, "mailrecv.local");
        assert!(!cfg.store_data);
        assert!(!cfg.do_tempfail);
        assert!(cfg.local_domains.is_empty());
        assert!(cfg.whitelists.is_empty());
        assert_eq!(cfg.max_conn_per_min, 0);
    }
}
