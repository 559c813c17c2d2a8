use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::dnslist::ListHit;
use crate::logger;

/// Everything the store needs to persist one accepted message. The session
/// hands this over at end-of-data and gets back an opaque file name for its
/// log record.
pub struct Envelope<'a> {
    pub session_index: u64,
    pub session_id: &'a str,
    pub started: DateTime<Utc>,
    pub client_ip: IpAddr,
    pub list_hit: Option<&'a ListHit>,
    pub helo: Option<&'a str>,
    pub mail_from: Option<&'a str>,
    pub rcpt_to: &'a [String],
    /// Sequence number of this message within the session, starting at 1.
    pub msg_seq: u32,
    pub noop_count: u32,
    pub vrfy_count: u32,
    pub err_count: u32,
    pub body: &'a [String],
}

pub struct MessageStore {
    dir: PathBuf,
}

impl MessageStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Écrit l'enveloppe et le corps; le nom de fichier rendu est opaque mais
    /// unique par message.
    pub async fn store(&self, env: &Envelope<'_>) -> Result<String> {
        let filename = format!(
            "{}_{}_{:02}.eml",
            env.started.format("%Y%m%d_%H%M%S"),
            env.session_id,
            env.msg_seq
        );
        let path = self.dir.join(&filename);

        let mut content = String::new();
        content.push_str(&format!("X-MailRecv-Session-Index: {}\r\n", env.session_index));
        content.push_str(&format!("X-MailRecv-Session-Id: {}\r\n", env.session_id));
        content.push_str(&format!(
            "X-MailRecv-Start-Time: {}\r\n",
            env.started.format("%Y-%m-%d %H:%M:%S")
        ));
        content.push_str(&format!("X-MailRecv-Client-Ip: {}\r\n", env.client_ip));
        match env.list_hit {
            Some(hit) => content.push_str(&format!(
                "X-MailRecv-Dns-List: {} {} {}\r\n",
                hit.kind.as_str(),
                hit.zone,
                hit.value
            )),
            None => content.push_str(&format!("X-MailRecv-Dns-List: {}\r\n", logger::NOT_LISTED)),
        }
        content.push_str(&format!(
            "X-MailRecv-Helo: {}\r\n",
            env.helo.unwrap_or(logger::NO_HELO)
        ));
        content.push_str(&format!(
            "X-MailRecv-Mail-From: {}\r\n",
            env.mail_from.unwrap_or(logger::NO_FROM)
        ));
        for rcpt in env.rcpt_to {
            content.push_str(&format!("X-MailRecv-Rcpt-To: {rcpt}\r\n"));
        }
        content.push_str(&format!(
            "X-MailRecv-Counters: msg={} noop={} vrfy={} err={}\r\n",
            env.msg_seq, env.noop_count, env.vrfy_count, env.err_count
        ));
        content.push_str("\r\n");
        for line in env.body {
            content.push_str(line);
            content.push_str("\r\n");
        }

        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write message file {path:?}"))?;
        Ok(filename)
    }
}
