mod daemon;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;

use mailrecv::config::Config;
use mailrecv::server::Server;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "mailrecv",
    about = "A fake SMTP receiver for MX-sandwich setups and mail-emitting test rigs",
    version = "0.1.2-b4"
)]
pub struct Opt {
    /// Run in the background as a daemon (Unix only)
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// Listening address
    #[structopt(short = "a", long = "listen-ip", default_value = "127.0.0.1")]
    pub listen_ip: IpAddr,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: u16,

    /// Host name used in the banner and the HELO spoof check
    #[structopt(long = "host-name", default_value = "mailrecv.local")]
    pub host_name: String,

    /// Per-read timeout in milliseconds, 0 for none
    #[structopt(long = "receive-timeout", default_value = "30000")]
    pub receive_timeout_ms: u64,

    /// Concurrent session cap; excess connections are answered 421
    #[structopt(long = "max-sessions", default_value = "16")]
    pub max_sessions: usize,

    /// Messages accepted per session
    #[structopt(long = "max-messages", default_value = "10")]
    pub max_messages: u32,

    /// Client protocol errors tolerated per message
    #[structopt(long = "max-errors", default_value = "9")]
    pub max_smtp_err: u32,

    /// NOOP commands tolerated per message
    #[structopt(long = "max-noop", default_value = "5")]
    pub max_smtp_noop: u32,

    /// VRFY/EXPN commands tolerated per message
    #[structopt(long = "max-vrfy", default_value = "5")]
    pub max_smtp_vrfy: u32,

    /// Recipients accepted per message
    #[structopt(long = "max-rcpt", default_value = "64")]
    pub max_smtp_rcpt: usize,

    /// Delay before the banner, in milliseconds
    #[structopt(long = "banner-delay", default_value = "0")]
    pub banner_delay_ms: u64,

    /// Tarpit delay per accumulated error, in milliseconds
    #[structopt(long = "error-delay", default_value = "1000")]
    pub error_delay_ms: u64,

    /// Body bytes kept per message; larger messages are refused
    #[structopt(long = "max-data-size", default_value = "1048576")]
    pub max_data_size: usize,

    /// Persist envelope and body of every accepted message
    #[structopt(long = "store-data")]
    pub store_data: bool,

    /// Directory for stored messages
    #[structopt(long = "store-path", default_value = ".", parse(from_os_str))]
    pub store_path: PathBuf,

    /// Session log file
    #[structopt(long = "log-file", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Log every SMTP line exchanged
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Answer 421 on DATA and close (after storing the body, if storing)
    #[structopt(long = "tempfail")]
    pub do_tempfail: bool,

    /// Check HELO/EHLO arguments lexically
    #[structopt(long = "check-helo")]
    pub check_helo_format: bool,

    /// Detect clients that send before reading our replies
    #[structopt(long = "early-talkers")]
    pub early_talkers: bool,

    /// Connections per minute per client IP, 0 for no limit
    #[structopt(long = "max-connections", default_value = "0")]
    pub max_conn_per_min: usize,

    /// DNS whitelist zone (repeatable)
    #[structopt(long = "whitelist", number_of_values = 1)]
    pub whitelists: Vec<String>,

    /// DNS blacklist zone (repeatable)
    #[structopt(long = "blacklist", number_of_values = 1)]
    pub blacklists: Vec<String>,

    /// Domain to accept mail for (repeatable; none accepts all)
    #[structopt(long = "local-domain", number_of_values = 1)]
    pub local_domains: Vec<String>,

    /// Mailbox to accept mail for (repeatable; none accepts all)
    #[structopt(long = "local-mailbox", number_of_values = 1)]
    pub local_mailboxes: Vec<String>,
}

impl Opt {
    fn into_config(self) -> Config {
        Config {
            listen_ip: self.listen_ip,
            listen_port: self.port,
            receive_timeout_ms: self.receive_timeout_ms,
            host_name: self.host_name,
            max_sessions: self.max_sessions,
            max_messages: self.max_messages,
            max_smtp_err: self.max_smtp_err,
            max_smtp_noop: self.max_smtp_noop,
            max_smtp_vrfy: self.max_smtp_vrfy,
            max_smtp_rcpt: self.max_smtp_rcpt,
            banner_delay_ms: self.banner_delay_ms,
            error_delay_ms: self.error_delay_ms,
            max_data_size: self.max_data_size,
            store_data: self.store_data,
            store_path: self.store_path,
            log_path: self.log_file,
            log_verbose: self.verbose,
            do_tempfail: self.do_tempfail,
            check_helo_format: self.check_helo_format,
            early_talkers: self.early_talkers,
            max_conn_per_min: self.max_conn_per_min,
            whitelists: self.whitelists,
            blacklists: self.blacklists,
            local_domains: self.local_domains,
            local_mailboxes: self.local_mailboxes,
        }
    }
}

fn main() {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("mailrecv {}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");
    println!("[INFO] Listening on {}:{}", opt.listen_ip, opt.port);
    println!("[INFO] Host name: {}", opt.host_name);
    if !opt.local_domains.is_empty() {
        println!("[INFO] Local domains: {:?}", opt.local_domains);
    }
    if !opt.local_mailboxes.is_empty() {
        println!("[INFO] Local mailboxes: {:?}", opt.local_mailboxes);
    }
    if !opt.whitelists.is_empty() || !opt.blacklists.is_empty() {
        println!(
            "[INFO] DNS lists: {} white, {} black",
            opt.whitelists.len(),
            opt.blacklists.len()
        );
    }
    if opt.store_data {
        println!("[INFO] Storing messages under {:?}", opt.store_path);
    }
    if opt.do_tempfail {
        println!("[INFO] Tempfail mode: every message is answered 421");
    }

    if opt.daemon {
        if let Err(e) = daemon::daemonize() {
            eprintln!("[ERROR] {e}");
            std::process::exit(1);
        }
    }

    // Le runtime est créé après la daemonisation, jamais avant le fork
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("[ERROR] failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async move {
        let server = match Server::new(opt.into_config()) {
            Ok(server) => server,
            Err(e) => {
                eprintln!("[ERROR] {e:#}");
                return 1;
            }
        };

        let stopper = Arc::clone(&server);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stopper.stop();
            }
        });

        server.run().await
    });

    std::process::exit(code);
}
