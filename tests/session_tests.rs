//! End-to-end SMTP sessions against an in-process listener.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use mailrecv::config::Config;
use mailrecv::server::Server;

const READ_LIMIT: Duration = Duration::from_secs(10);

fn test_config() -> Config {
    Config {
        receive_timeout_ms: 10_000,
        error_delay_ms: 0,
        ..Config::default()
    }
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mailrecv-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn spawn_server(cfg: Config) -> (SocketAddr, Arc<Server>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(cfg).unwrap();
    let task_server = Arc::clone(&server);
    tokio::spawn(async move {
        task_server.run_on(listener).await;
    });
    (addr, server)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Next server line without its CRLF; empty string once the server hangs up.
    async fn line(&mut self) -> String {
        let mut line = String::new();
        let read = time::timeout(READ_LIMIT, self.reader.read_line(&mut line))
            .await
            .expect("server did not answer in time")
            .unwrap();
        if read == 0 {
            return String::new();
        }
        line.trim_end().to_string()
    }

    async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn cmd(&mut self, text: &str) -> String {
        self.send(text).await;
        self.line().await
    }

    /// Reads an EHLO reply: every continuation line and the closing `250 `.
    async fn ehlo(&mut self, arg: &str) -> Vec<String> {
        self.send(&format!("EHLO {arg}")).await;
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            let done = line.starts_with("250 ");
            assert!(
                done || line.starts_with("250-"),
                "unexpected EHLO reply line: {line}"
            );
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }
}

fn session_records(log: &str) -> Vec<Vec<String>> {
    log.lines()
        .filter(|l| l.split('|').count() == 17)
        .map(|l| l.split('|').map(str::to_string).collect())
        .collect()
}

#[tokio::test]
async fn s1_happy_path_with_storage() {
    let dir = scratch_dir("s1");
    let mut cfg = test_config();
    cfg.store_data = true;
    cfg.store_path = dir.join("msgs");
    cfg.log_path = Some(dir.join("session.log"));
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    let banner = client.line().await;
    assert!(banner.starts_with("220 mailrecv.local MailRecv 0.1.2-b4; "), "{banner}");

    let ehlo = client.ehlo("client.example").await;
    assert_eq!(ehlo[0], "250-mailrecv.local Hello client.example");
    assert!(ehlo.contains(&"250-HELP".to_string()));
    assert!(ehlo.contains(&"250-VRFY".to_string()));
    assert!(ehlo.contains(&"250-EXPN".to_string()));
    assert_eq!(ehlo.last().unwrap(), "250 NOOP");

    assert!(client.cmd("MAIL FROM:<a@b.example>").await.starts_with("250 "));
    assert!(client.cmd("RCPT TO:<x@local.test>").await.starts_with("250 "));
    assert!(client.cmd("DATA").await.starts_with("354 "));
    client.send("Subject: hi").await;
    client.send("").await;
    client.send("body").await;
    assert_eq!(client.cmd(".").await, "250 Queued mail for delivery.");
    assert_eq!(client.cmd("QUIT").await, "221 Closing connection.");

    let files: Vec<_> = std::fs::read_dir(dir.join("msgs")).unwrap().collect();
    assert_eq!(files.len(), 1, "expected exactly one message file");

    let log = std::fs::read_to_string(dir.join("session.log")).unwrap();
    let records = session_records(&log);
    assert_eq!(records.len(), 1, "expected exactly one session record");
    let record = &records[0];
    assert_eq!(record[4], "client.example");
    assert_eq!(record[5], "a@b.example");
    assert_eq!(record[6], "1");
    assert_eq!(record[7], "x@local.test");
    assert_eq!(record[8], "1");
    assert!(record[9].ends_with(".eml"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn s2_relaying_denied() {
    let mut cfg = test_config();
    cfg.local_domains = vec!["local.test".to_string()];
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    assert!(client.cmd("HELO c.example").await.starts_with("250 "));
    assert!(client.cmd("MAIL FROM:<a@b.example>").await.starts_with("250 "));
    assert_eq!(
        client.cmd("RCPT TO:<x@other.test>").await,
        "530 Relaying not allowed for policy reasons."
    );
    // the local domain is still welcome afterwards
    assert!(client.cmd("RCPT TO:<x@local.test>").await.starts_with("250 "));
}

#[tokio::test]
async fn s3_tempfail_on_data() {
    let mut cfg = test_config();
    cfg.do_tempfail = true;
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    client.cmd("HELO c.example").await;
    client.cmd("MAIL FROM:<a@b.example>").await;
    client.cmd("RCPT TO:<x@local.test>").await;
    let reply = client.cmd("DATA").await;
    assert!(reply.starts_with("421 Service temporarily unavailable"), "{reply}");
    assert_eq!(client.line().await, "", "server should have closed");
}

#[tokio::test]
async fn s4_early_talker_is_cut_off_before_the_banner() {
    let mut cfg = test_config();
    cfg.early_talkers = true;
    cfg.banner_delay_ms = 300;
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    // talk first, read never
    client.send("EHLO x").await;
    client.send("NOOP").await;
    assert_eq!(client.line().await, "554 Misbehaved SMTP session (EarlyTalker).");
    assert_eq!(client.line().await, "", "server should have closed");
}

#[tokio::test]
async fn s5_quota_rejects_message_but_keeps_session() {
    let dir = scratch_dir("s5");
    let mut cfg = test_config();
    cfg.store_data = true;
    cfg.store_path = dir.join("msgs");
    cfg.max_data_size = 16;
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    client.cmd("HELO c.example").await;
    client.cmd("MAIL FROM:<a@b.example>").await;
    client.cmd("RCPT TO:<x@local.test>").await;
    assert!(client.cmd("DATA").await.starts_with("354 "));
    // two 14-byte lines make 32 bytes on the wire
    client.send("AAAAAAAAAAAAAA").await;
    client.send("BBBBBBBBBBBBBB").await;
    assert_eq!(
        client.cmd(".").await,
        "422 Recipient mailbox exceeded quota limit."
    );

    // nothing was written, and the session is still usable
    let files: Vec<_> = std::fs::read_dir(dir.join("msgs")).unwrap().collect();
    assert!(files.is_empty());
    assert!(client.cmd("HELO c.example").await.starts_with("250 "));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn s6_error_ceiling_closes_the_session() {
    let mut cfg = test_config();
    cfg.max_smtp_err = 2;
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    assert_eq!(client.cmd("FOO").await, "500 Command not recognized.");
    assert_eq!(client.cmd("FOO").await, "500 Command not recognized.");
    let last = client.cmd("FOO").await;
    assert!(last.starts_with("550 Max errors exceeded"), "{last}");
    assert_eq!(client.line().await, "", "server should have closed");
}

#[tokio::test]
async fn out_of_order_commands_leave_no_envelope_behind() {
    let (addr, _server) = spawn_server(test_config()).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    // RCPT before MAIL, MAIL before HELO
    assert_eq!(
        client.cmd("RCPT TO:<x@local.test>").await,
        "503 Bad sequence of commands."
    );
    assert_eq!(
        client.cmd("MAIL FROM:<a@b.example>").await,
        "503 Bad sequence of commands."
    );
    // a proper transaction works, and the rejected RCPT was not remembered
    assert!(client.cmd("HELO c.example").await.starts_with("250 "));
    assert!(client.cmd("MAIL FROM:<a@b.example>").await.starts_with("250 "));
    assert_eq!(
        client.cmd("DATA").await,
        "471 No recipients given, cannot proceed."
    );
}

#[tokio::test]
async fn rset_twice_is_the_same_as_once() {
    let (addr, _server) = spawn_server(test_config()).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    client.cmd("HELO c.example").await;
    client.cmd("MAIL FROM:<a@b.example>").await;
    assert_eq!(client.cmd("RSET").await, "250 Reset state.");
    assert_eq!(client.cmd("RSET").await, "250 Reset state.");
    // either way the session is back before the greeting
    assert_eq!(
        client.cmd("MAIL FROM:<a@b.example>").await,
        "503 Bad sequence of commands."
    );
    assert!(client.cmd("HELO c.example").await.starts_with("250 "));
    assert!(client.cmd("MAIL FROM:<a@b.example>").await.starts_with("250 "));
}

#[tokio::test]
async fn session_cap_tempfails_the_excess_connection() {
    let mut cfg = test_config();
    cfg.max_sessions = 1;
    let (addr, _server) = spawn_server(cfg).await;

    let mut first = Client::connect(addr).await;
    assert!(first.line().await.starts_with("220 "));

    let mut second = Client::connect(addr).await;
    let reply = second.line().await;
    assert!(reply.starts_with("421 Service temporarily unavailable"), "{reply}");
    assert_eq!(second.line().await, "", "server should have closed");

    // the first session is unaffected
    assert!(first.cmd("HELO c.example").await.starts_with("250 "));
}

#[tokio::test]
async fn read_timeout_answers_442_and_closes() {
    let mut cfg = test_config();
    cfg.receive_timeout_ms = 200;
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    // say nothing
    assert_eq!(client.line().await, "442 Connection timed out.");
    assert_eq!(client.line().await, "", "server should have closed");
}

#[tokio::test]
async fn live_session_gauge_returns_to_zero() {
    let (addr, server) = spawn_server(test_config()).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    assert_eq!(client.cmd("QUIT").await, "221 Closing connection.");
    assert_eq!(client.line().await, "");

    let mut live = server.counters().live();
    for _ in 0..100 {
        if live == 0 {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
        live = server.counters().live();
    }
    assert_eq!(live, 0);
}

#[tokio::test]
async fn message_limit_closes_after_the_ack() {
    let mut cfg = test_config();
    cfg.max_messages = 1;
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    client.cmd("HELO c.example").await;
    client.cmd("MAIL FROM:<a@b.example>").await;
    client.cmd("RCPT TO:<x@local.test>").await;
    client.cmd("DATA").await;
    client.send("one line").await;
    assert_eq!(client.cmd(".").await, "250 Queued mail for delivery.");
    let next = client.line().await;
    assert!(next.starts_with("451 Session message limit reached"), "{next}");
    assert_eq!(client.line().await, "", "server should have closed");
}

#[tokio::test]
async fn help_noop_and_vrfy_replies() {
    let mut cfg = test_config();
    cfg.max_smtp_vrfy = 1;
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    assert!(client.cmd("HELP").await.starts_with("211 "));
    assert_eq!(client.cmd("NOOP").await, "250 OK.");
    assert!(client.cmd("VRFY someone").await.starts_with("252 "));
    // ceiling: the second VRFY is one too many
    let reply = client.cmd("EXPN list").await;
    assert!(reply.starts_with("421 Too many VRFY/EXPN commands"), "{reply}");
    assert_eq!(client.line().await, "", "server should have closed");
}

#[tokio::test]
async fn helo_format_check_rejects_bad_names() {
    let mut cfg = test_config();
    cfg.check_helo_format = true;
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    assert_eq!(
        client.cmd("HELO bad host").await,
        "501 Invalid HELO/EHLO hostname."
    );
    assert_eq!(client.cmd("HELO nodots").await, "501 Invalid HELO/EHLO hostname.");
    assert_eq!(client.cmd("HELO localhost").await, "501 Invalid HELO/EHLO hostname.");
    assert!(client.cmd("HELO fine.example.org").await.starts_with("250 "));
}

#[tokio::test]
async fn tempfail_with_storage_keeps_file_and_record() {
    let dir = scratch_dir("tempfail-store");
    let mut cfg = test_config();
    cfg.do_tempfail = true;
    cfg.store_data = true;
    cfg.store_path = dir.join("msgs");
    cfg.log_path = Some(dir.join("session.log"));
    let (addr, _server) = spawn_server(cfg).await;

    let mut client = Client::connect(addr).await;
    client.line().await;
    client.cmd("HELO c.example").await;
    client.cmd("MAIL FROM:<a@b.example>").await;
    client.cmd("RCPT TO:<x@local.test>").await;
    // storage stays on, so DATA is accepted and the body is read first
    assert!(client.cmd("DATA").await.starts_with("354 "));
    client.send("kept anyway").await;
    let reply = client.cmd(".").await;
    assert!(reply.starts_with("421 Service temporarily unavailable"), "{reply}");
    assert_eq!(client.line().await, "", "server should have closed");

    let files: Vec<_> = std::fs::read_dir(dir.join("msgs")).unwrap().collect();
    assert_eq!(files.len(), 1, "body must be stored before the 421");
    let log = std::fs::read_to_string(dir.join("session.log")).unwrap();
    assert_eq!(session_records(&log).len(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}
