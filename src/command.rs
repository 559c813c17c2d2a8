//! SMTP command line parsing.

use crate::validate::collapse_whitespace;

/// One parsed client line. An empty line is a recognized command of its own;
/// anything that matches no table entry is `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Vrfy(String),
    Expn(String),
    Help,
    Noop,
    Unknown,
}

/// Le préfixe le plus long de la table des commandes gagne; la casse est
/// ignorée pour le préfixe, l'argument est gardé tel quel.
pub fn parse(line: &str) -> Command {
    let upper = line.to_ascii_uppercase();

    if line.is_empty() {
        return Command::Empty;
    }
    if upper.starts_with("MAIL FROM:") {
        return Command::MailFrom(arg_after_colon(line));
    }
    if upper.starts_with("RCPT TO:") {
        return Command::RcptTo(arg_after_colon(line));
    }
    if upper.starts_with("HELO") {
        return Command::Helo(arg_after_space(line));
    }
    if upper.starts_with("EHLO") {
        return Command::Ehlo(arg_after_space(line));
    }
    if upper.starts_with("DATA") {
        return Command::Data;
    }
    if upper.starts_with("RSET") {
        return Command::Rset;
    }
    if upper.starts_with("QUIT") {
        return Command::Quit;
    }
    if upper.starts_with("VRFY") {
        return Command::Vrfy(arg_after_space(line));
    }
    if upper.starts_with("EXPN") {
        return Command::Expn(arg_after_space(line));
    }
    if upper.starts_with("HELP") {
        return Command::Help;
    }
    if upper.starts_with("NOOP") {
        return Command::Noop;
    }
    Command::Unknown
}

fn arg_after_colon(line: &str) -> String {
    match line.split_once(':') {
        Some((_, rest)) => collapse_whitespace(rest.trim()),
        None => String::new(),
    }
}

fn arg_after_space(line: &str) -> String {
    match line.split_once(' ') {
        Some((_, rest)) => collapse_whitespace(rest.trim()),
        None => String::new(),
    }
}
