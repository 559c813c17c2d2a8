use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;

use crate::command::{self, Command};
use crate::config::Config;
use crate::dnslist::{self, ListHit, ListKind, SystemResolver};
use crate::logger::{self, Direction, Logger};
use crate::ratelimiter::RateLimiter;
use crate::server::ServerCounters;
use crate::store::{Envelope, MessageStore};
use crate::validate;

const GREETING: &str = "MailRecv 0.1.2-b4";
const TEMPFAIL: &str = "421 Service temporarily unavailable, closing transmission channel.";
const EARLY_TALKER: &str = "554 Misbehaved SMTP session (EarlyTalker).";

/// Pause entre deux commandes d'un client qui se tient bien.
const REPLY_PAUSE_MS: u64 = 25;
/// Attente maximum du sondage du tampon de réception.
const PEEK_WAIT_MS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    WaitHelo,
    WaitMail,
    WaitRcptOrData,
    ReadBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Reply sent, session goes on.
    Continue,
    /// Body line swallowed, nothing was written back.
    NoReply,
    /// Reply sent, connection must close now.
    Close,
    /// 221 sent; like `Close` but skips the tarpit.
    Quit,
}

enum ReadOutcome {
    Line(String),
    Eof,
    TimedOut,
}

type Conn = BufReader<TcpStream>;

/// One SMTP session, owning everything about a single accepted connection.
/// Constructed on accept (which reserves a session index and bumps the live
/// gauge) and released exactly once when [`Session::handle`] returns.
pub struct Session {
    cfg: Arc<Config>,
    counters: Arc<ServerCounters>,
    logger: Arc<Logger>,
    resolver: Arc<SystemResolver>,
    limiter: Arc<Mutex<RateLimiter>>,
    store: MessageStore,

    index: u64,
    id: String,
    started: DateTime<Utc>,
    peer: IpAddr,

    state: SmtpState,
    helo: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    body: Vec<String>,
    body_size: usize,
    body_overflow: bool,
    msg_count: u32,
    noop_count: u32,
    vrfy_count: u32,
    err_count: u32,
    timed_out: bool,
    early_talker: bool,
    list_hit: Option<ListHit>,
    msg_file: Option<String>,
    records_written: u32,
}

impl Session {
    pub fn new(
        cfg: Arc<Config>,
        counters: Arc<ServerCounters>,
        logger: Arc<Logger>,
        resolver: Arc<SystemResolver>,
        limiter: Arc<Mutex<RateLimiter>>,
        peer: IpAddr,
    ) -> Self {
        let index = counters.session_started();
        let started = Utc::now();
        let id = format!("{:08X}-{:05}", started.timestamp() as u32, index);
        let store = MessageStore::new(&cfg.store_path);
        Self {
            cfg,
            counters,
            logger,
            resolver,
            limiter,
            store,
            index,
            id,
            started,
            peer,
            state: SmtpState::WaitHelo,
            helo: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            body: Vec::new(),
            body_size: 0,
            body_overflow: false,
            msg_count: 0,
            noop_count: 0,
            vrfy_count: 0,
            err_count: 0,
            timed_out: false,
            early_talker: false,
            list_hit: None,
            msg_file: None,
            records_written: 0,
        }
    }

    pub async fn handle(mut self, stream: TcpStream) {
        let mut conn = BufReader::new(stream);

        self.logger
            .event(&format!("{} session {} opened", self.peer, self.id))
            .await;

        if let Err(e) = self.run(&mut conn).await {
            self.logger
                .event(&format!("{} session {}: {e}", self.peer, self.id))
                .await;
        }

        // Une session sans message laisse quand même une trace
        if self.records_written == 0 {
            let record = self.record_line();
            self.logger.record(&record).await;
        }
        let note = if self.timed_out { " (timed out)" } else { "" };
        self.logger
            .event(&format!("{} session {} closed{note}", self.peer, self.id))
            .await;
        self.counters.session_ended();
    }

    async fn run(&mut self, conn: &mut Conn) -> Result<()> {
        // Plafond global de sessions
        if self.counters.live() > self.cfg.max_sessions {
            self.hang_up(conn, TEMPFAIL).await?;
            return Ok(());
        }

        // Plafond de connexions par IP
        if self.cfg.max_conn_per_min > 0 {
            let allowed = self.limiter.lock().await.check_and_add(self.peer);
            if !allowed {
                self.hang_up(
                    conn,
                    "421 Too many connections from your host, closing transmission channel.",
                )
                .await?;
                return Ok(());
            }
        }

        // Listes DNS; un client sur liste blanche n'est jamais sondé en noir
        if !self.cfg.whitelists.is_empty() || !self.cfg.blacklists.is_empty() {
            self.list_hit = dnslist::probe(
                self.resolver.as_ref(),
                self.peer,
                &self.cfg.whitelists,
                &self.cfg.blacklists,
            )
            .await;
            if let Some(hit) = &self.list_hit {
                self.logger
                    .event(&format!(
                        "{} listed {} by {} ({})",
                        self.peer,
                        hit.kind.as_str(),
                        hit.zone,
                        hit.value
                    ))
                    .await;
                if hit.kind == ListKind::Black && !self.cfg.store_data {
                    let refuse = format!("442 Connection refused ({}).", hit.zone);
                    self.hang_up(conn, &refuse).await?;
                    return Ok(());
                }
            }
        }

        if self.cfg.banner_delay_ms > 0 {
            time::sleep(Duration::from_millis(self.cfg.banner_delay_ms)).await;
        }

        // Celui qui parle avant la bannière n'est pas un vrai client SMTP
        if self.cfg.early_talkers && self.pending_input(conn).await {
            self.early_talker = true;
            self.err_count += 1;
            self.hang_up(conn, EARLY_TALKER).await?;
            return Ok(());
        }

        let banner = format!(
            "220 {} {}; {}",
            self.cfg.host_name,
            GREETING,
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        );
        self.say(conn, &banner).await?;

        loop {
            let line = match self.read_line(conn).await {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Eof => break,
                ReadOutcome::TimedOut => {
                    self.timed_out = true;
                    self.err_count += 1;
                    let _ = self.hang_up(conn, "442 Connection timed out.").await;
                    break;
                }
            };

            let flow = if self.state == SmtpState::ReadBody {
                self.on_body_line(conn, line).await?
            } else {
                self.on_command(conn, &line).await?
            };

            match flow {
                // Seule la réponse au QUIT échappe au tarpit
                Flow::Quit => break,
                Flow::NoReply => {}
                Flow::Close => {
                    if self.cfg.early_talkers && !self.early_talker && self.pending_input(conn).await
                    {
                        self.early_talker = true;
                        self.err_count += 1;
                        let _ = self.say(conn, EARLY_TALKER).await;
                    }
                    self.tarpit().await;
                    break;
                }
                Flow::Continue => {
                    if self.cfg.early_talkers && self.pending_input(conn).await {
                        self.early_talker = true;
                        self.err_count += 1;
                        let _ = self.say(conn, EARLY_TALKER).await;
                        self.tarpit().await;
                        break;
                    }
                    self.tarpit().await;
                }
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, conn: &mut Conn, line: &str) -> Result<Flow> {
        match command::parse(line) {
            Command::Helo(arg) => self.on_helo(conn, arg, false).await,
            Command::Ehlo(arg) => self.on_helo(conn, arg, true).await,
            Command::MailFrom(arg) => self.on_mail(conn, &arg).await,
            Command::RcptTo(arg) => self.on_rcpt(conn, &arg).await,
            Command::Data => self.on_data(conn).await,
            Command::Rset => self.on_rset(conn).await,
            Command::Vrfy(_) | Command::Expn(_) => self.on_vrfy(conn).await,
            Command::Noop => self.on_noop(conn).await,
            Command::Help => {
                self.say(
                    conn,
                    "211 Commands supported: HELO EHLO MAIL RCPT DATA RSET NOOP VRFY EXPN HELP QUIT",
                )
                .await?;
                Ok(Flow::Continue)
            }
            Command::Quit => {
                self.say(conn, "221 Closing connection.").await?;
                Ok(Flow::Quit)
            }
            Command::Empty | Command::Unknown => {
                self.fail(conn, "500 Command not recognized.").await
            }
        }
    }

    async fn on_helo(&mut self, conn: &mut Conn, arg: String, extended: bool) -> Result<Flow> {
        if self.cfg.check_helo_format
            && !validate::check_helo(&arg, &self.cfg.host_name, self.cfg.listen_ip)
        {
            return self.fail(conn, "501 Invalid HELO/EHLO hostname.").await;
        }

        // Un nouveau salut annule la transaction en cours
        self.mail_from = None;
        self.rcpt_to.clear();
        self.body.clear();
        self.body_size = 0;
        self.body_overflow = false;

        self.helo = Some(arg.clone());
        self.state = SmtpState::WaitMail;

        if extended {
            self.say(conn, &format!("250-{} Hello {}", self.cfg.host_name, arg))
                .await?;
            self.say(conn, "250-HELP").await?;
            self.say(conn, "250-VRFY").await?;
            self.say(conn, "250-EXPN").await?;
            self.say(conn, "250 NOOP").await?;
        } else {
            self.say(conn, &format!("250 {} Hello {}", self.cfg.host_name, arg))
                .await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_mail(&mut self, conn: &mut Conn, arg: &str) -> Result<Flow> {
        if self.state != SmtpState::WaitMail {
            return self.fail(conn, "503 Bad sequence of commands.").await;
        }
        let mailbox = match validate::check_address(arg) {
            Some(mailbox) => mailbox,
            None => return self.fail(conn, "501 Malformed sender address.").await,
        };
        self.mail_from = Some(mailbox.addr);
        self.state = SmtpState::WaitRcptOrData;
        self.say(conn, "250 Sender ok.").await?;
        Ok(Flow::Continue)
    }

    async fn on_rcpt(&mut self, conn: &mut Conn, arg: &str) -> Result<Flow> {
        if self.state != SmtpState::WaitRcptOrData {
            return self.fail(conn, "503 Bad sequence of commands.").await;
        }
        let mailbox = match validate::check_address(arg) {
            Some(mailbox) => mailbox,
            None => return self.fail(conn, "501 Malformed recipient address.").await,
        };
        if self.rcpt_to.len() >= self.cfg.max_smtp_rcpt {
            self.say(conn, "452 Too many recipients, closing transmission channel.")
                .await?;
            return Ok(Flow::Close);
        }
        if !validate::domain_is_local(&mailbox.domain, &self.cfg.local_domains) {
            return self
                .fail(conn, "530 Relaying not allowed for policy reasons.")
                .await;
        }
        if !validate::mailbox_is_local(&mailbox.addr, &self.cfg.local_mailboxes) {
            return self
                .fail(conn, "553 Requested action not taken: mailbox name not allowed.")
                .await;
        }
        self.rcpt_to.push(mailbox.addr);
        self.say(conn, "250 Recipient ok.").await?;
        Ok(Flow::Continue)
    }

    async fn on_data(&mut self, conn: &mut Conn) -> Result<Flow> {
        if self.state != SmtpState::WaitRcptOrData {
            return self.fail(conn, "503 Bad sequence of commands.").await;
        }
        if self.rcpt_to.is_empty() {
            return self.fail(conn, "471 No recipients given, cannot proceed.").await;
        }
        if self.cfg.do_tempfail && !self.cfg.store_data {
            self.say(conn, TEMPFAIL).await?;
            return Ok(Flow::Close);
        }
        self.body.clear();
        self.body_size = 0;
        self.body_overflow = false;
        self.state = SmtpState::ReadBody;
        self.say(conn, "354 Enter mail, end with \".\" on a line by itself.")
            .await?;
        Ok(Flow::Continue)
    }

    async fn on_rset(&mut self, conn: &mut Conn) -> Result<Flow> {
        self.reset_message();
        self.state = SmtpState::WaitHelo;
        self.say(conn, "250 Reset state.").await?;
        Ok(Flow::Continue)
    }

    async fn on_vrfy(&mut self, conn: &mut Conn) -> Result<Flow> {
        self.vrfy_count += 1;
        if self.vrfy_count > self.cfg.max_smtp_vrfy {
            self.say(
                conn,
                "421 Too many VRFY/EXPN commands, closing transmission channel.",
            )
            .await?;
            return Ok(Flow::Close);
        }
        self.say(
            conn,
            "252 Cannot VRFY user, but will accept message and attempt delivery.",
        )
        .await?;
        Ok(Flow::Continue)
    }

    async fn on_noop(&mut self, conn: &mut Conn) -> Result<Flow> {
        self.noop_count += 1;
        if self.noop_count > self.cfg.max_smtp_noop {
            self.say(conn, "421 Too many NOOP commands, closing transmission channel.")
                .await?;
            return Ok(Flow::Close);
        }
        self.say(conn, "250 OK.").await?;
        Ok(Flow::Continue)
    }

    async fn on_body_line(&mut self, conn: &mut Conn, line: String) -> Result<Flow> {
        if line == "." {
            return self.finish_message(conn).await;
        }
        self.body_size += line.len() + 2;
        if self.body_size > self.cfg.max_data_size {
            // On draine le client jusqu'au point final, mais plus rien n'est gardé
            self.body_overflow = true;
            self.body.clear();
        } else if self.cfg.store_data {
            self.body.push(line);
        }
        Ok(Flow::NoReply)
    }

    async fn finish_message(&mut self, conn: &mut Conn) -> Result<Flow> {
        if self.body_overflow {
            self.say(conn, "422 Recipient mailbox exceeded quota limit.").await?;
            self.end_of_message().await;
            return Ok(Flow::Continue);
        }

        self.msg_count += 1;

        if self.cfg.store_data {
            let stored = {
                let env = Envelope {
                    session_index: self.index,
                    session_id: &self.id,
                    started: self.started,
                    client_ip: self.peer,
                    list_hit: self.list_hit.as_ref(),
                    helo: self.helo.as_deref(),
                    mail_from: self.mail_from.as_deref(),
                    rcpt_to: &self.rcpt_to,
                    msg_seq: self.msg_count,
                    noop_count: self.noop_count,
                    vrfy_count: self.vrfy_count,
                    err_count: self.err_count,
                    body: &self.body,
                };
                self.store.store(&env).await
            };
            match stored {
                Ok(name) => self.msg_file = Some(name),
                Err(e) => {
                    self.logger
                        .event(&format!("{} session {}: {e:#}", self.peer, self.id))
                        .await;
                    self.msg_file = Some("write_error".to_string());
                }
            }
        }

        if self.cfg.do_tempfail {
            // Le message est déjà sur disque; le client, lui, réessaiera ailleurs
            let record = self.record_line();
            self.logger.record(&record).await;
            self.records_written += 1;
            self.say(conn, TEMPFAIL).await?;
            return Ok(Flow::Close);
        }

        self.say(conn, "250 Queued mail for delivery.").await?;
        self.end_of_message().await;

        if self.msg_count >= self.cfg.max_messages {
            self.say(
                conn,
                "451 Session message limit reached, closing transmission channel.",
            )
            .await?;
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    /// Trace de fin de message, puis remise à zéro pour le suivant.
    async fn end_of_message(&mut self) {
        let record = self.record_line();
        self.logger.record(&record).await;
        self.records_written += 1;
        self.reset_message();
        self.state = SmtpState::WaitHelo;
    }

    fn reset_message(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.body.clear();
        self.body_size = 0;
        self.body_overflow = false;
        self.msg_file = None;
        self.noop_count = 0;
        self.vrfy_count = 0;
        self.err_count = 0;
    }

    /// Incrémente le compteur d'erreurs et répond, ou coupe si le plafond est
    /// dépassé.
    async fn fail(&mut self, conn: &mut Conn, reply: &str) -> Result<Flow> {
        self.err_count += 1;
        if self.err_count > self.cfg.max_smtp_err {
            self.say(conn, "550 Max errors exceeded, closing transmission channel.")
                .await?;
            return Ok(Flow::Close);
        }
        self.say(conn, reply).await?;
        Ok(Flow::Continue)
    }

    /// Dernière réponse avant de raccrocher: même sondage et même tarpit que
    /// pour toute autre réponse.
    async fn hang_up(&mut self, conn: &mut Conn, text: &str) -> Result<()> {
        self.say(conn, text).await?;
        if self.cfg.early_talkers && !self.early_talker && self.pending_input(conn).await {
            self.early_talker = true;
            self.err_count += 1;
            let _ = self.say(conn, EARLY_TALKER).await;
        }
        self.tarpit().await;
        Ok(())
    }

    async fn tarpit(&self) {
        if self.err_count > 0 {
            time::sleep(Duration::from_millis(
                self.cfg.error_delay_ms * u64::from(self.err_count),
            ))
            .await;
        } else {
            time::sleep(Duration::from_millis(REPLY_PAUSE_MS)).await;
        }
    }

    /// Octets en attente côté client? Regarde d'abord le tampon du lecteur,
    /// puis la socket elle-même.
    async fn pending_input(&self, conn: &mut Conn) -> bool {
        if !conn.buffer().is_empty() {
            return true;
        }
        let mut peek = [0u8; 1];
        matches!(
            time::timeout(
                Duration::from_millis(PEEK_WAIT_MS),
                conn.get_ref().peek(&mut peek)
            )
            .await,
            Ok(Ok(n)) if n > 0
        )
    }

    async fn say(&self, conn: &mut Conn, text: &str) -> Result<()> {
        self.logger
            .exchange(Direction::Snd, self.peer, &self.id, text)
            .await;
        let stream = conn.get_mut();
        stream.write_all(text.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self, conn: &mut Conn) -> ReadOutcome {
        let mut buf = Vec::new();
        let read = if self.cfg.receive_timeout_ms == 0 {
            conn.read_until(b'\n', &mut buf).await
        } else {
            match time::timeout(
                Duration::from_millis(self.cfg.receive_timeout_ms),
                conn.read_until(b'\n', &mut buf),
            )
            .await
            {
                Ok(read) => read,
                Err(_) => return ReadOutcome::TimedOut,
            }
        };
        match read {
            Ok(0) => ReadOutcome::Eof,
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&buf).into_owned();
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                self.logger
                    .exchange(Direction::Rcv, self.peer, &self.id, &line)
                    .await;
                ReadOutcome::Line(line)
            }
            Err(_) => ReadOutcome::Eof,
        }
    }

    /// Un enregistrement de session, délimité par des barres verticales.
    fn record_line(&self) -> String {
        let fmt = "%Y-%m-%d %H:%M:%S";
        let rcpt_list = if self.rcpt_to.is_empty() {
            logger::NO_RCPT.to_string()
        } else {
            self.rcpt_to.join(",")
        };
        let (list_type, list_name, list_value) = match &self.list_hit {
            Some(hit) => (
                hit.kind.as_str().to_string(),
                hit.zone.clone(),
                hit.value.clone(),
            ),
            None => (
                logger::NOT_LISTED.to_string(),
                logger::NONE.to_string(),
                logger::NONE.to_string(),
            ),
        };
        [
            Utc::now().format(fmt).to_string(),
            self.started.format(fmt).to_string(),
            self.id.clone(),
            self.peer.to_string(),
            self.helo.clone().unwrap_or_else(|| logger::NO_HELO.to_string()),
            self.mail_from
                .clone()
                .unwrap_or_else(|| logger::NO_FROM.to_string()),
            self.rcpt_to.len().to_string(),
            rcpt_list,
            self.msg_count.to_string(),
            self.msg_file
                .clone()
                .unwrap_or_else(|| logger::NO_FILE.to_string()),
            list_type,
            list_name,
            list_value,
            u8::from(self.early_talker).to_string(),
            self.noop_count.to_string(),
            self.vrfy_count.to_string(),
            self.err_count.to_string(),
        ]
        .join("|")
    }
}
