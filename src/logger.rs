use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::Local;
use tokio::sync::Mutex;

// Jetons utilisés pour les champs absents d'un enregistrement de session.
pub const NO_HELO: &str = "-no-helo-";
pub const NO_FROM: &str = "-no-from-";
pub const NO_RCPT: &str = "-no-rcpt-";
pub const NO_FILE: &str = "-no-file-";
pub const NOT_LISTED: &str = "-not-listed-";
pub const NONE: &str = "-none-";

/// Direction of an SMTP line in the verbose log.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Snd,
    Rcv,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Snd => "SND",
            Direction::Rcv => "RCV",
        }
    }
}

/// Convertit les caractères non imprimables en séquences d'échappement, pour
/// que les octets du client ne pilotent jamais un terminal.
pub fn escape_for_log(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c == ' ' || c == '\t' => {
                result.push(c);
            }
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", c as u32));
            }
        }
    }
    result
}

/// Console log plus optional append-only log file. The pipe-delimited session
/// records go through [`Logger::record`]; everything else is commentary.
pub struct Logger {
    writer: Option<Mutex<BufWriter<File>>>,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, verbose: bool) -> anyhow::Result<Self> {
        let writer = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self { writer, verbose })
    }

    async fn write_file(&self, line: &str) {
        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.write_all(b"\n");
            let _ = writer.flush();
        }
    }

    /// Server and session commentary, timestamped.
    pub async fn event(&self, message: &str) {
        let line = format!(
            "{} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            escape_for_log(message)
        );
        println!("{line}");
        self.write_file(&line).await;
    }

    /// One pipe-delimited session record, written verbatim.
    pub async fn record(&self, line: &str) {
        println!("{}", escape_for_log(line));
        self.write_file(line).await;
    }

    /// One SMTP line exchanged, tagged with its direction. Verbose mode only.
    pub async fn exchange(&self, dir: Direction, ip: IpAddr, session_id: &str, text: &str) {
        if !self.verbose {
            return;
        }
        let line = format!(
            "{} {} {} {} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            ip,
            session_id,
            dir.tag(),
            escape_for_log(text)
        );
        println!("{line}");
        self.write_file(&line).await;
    }
}
