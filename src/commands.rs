//! MTA-to-filter command frames: codes, per-command payload structs and
//! their parse/encode. Grounded on the teacher's `MilterMessage` enum
//! (one variant per command, parsed from a leading code byte) and on
//! `miltr_common`'s `ClientCommand`/command structs for the macro-frame
//! shape the teacher has no equivalent of.

use crate::error::WireError;
use crate::family::ConnInfo;
use crate::wire::{read_cstr, split_nul_terminated, write_cstr};

pub const CODE_OPTNEG: u8 = b'O';
pub const CODE_CONN: u8 = b'C';
pub const CODE_HELO: u8 = b'H';
pub const CODE_MAIL: u8 = b'M';
pub const CODE_RCPT: u8 = b'R';
pub const CODE_DATA: u8 = b'T';
pub const CODE_HEADER: u8 = b'L';
pub const CODE_EOH: u8 = b'N';
pub const CODE_BODY: u8 = b'B';
pub const CODE_EOB: u8 = b'E';
pub const CODE_UNKNOWN: u8 = b'U';
pub const CODE_ABORT: u8 = b'A';
pub const CODE_QUIT: u8 = b'Q';
pub const CODE_QUIT_NC: u8 = b'K';
pub const CODE_MACRO: u8 = b'D';

/// Ordinal position of a command in the forward SMTP lifecycle, used by
/// the server to detect an implicit restart (a new command whose ordinal
/// regresses without an intervening ABORT). Commands outside the forward
/// lifecycle (ABORT, QUIT, QUIT-NC, MACRO, OPTNEG) return `None`.
pub fn command_ordinal(code: u8) -> Option<u8> {
    match code {
        CODE_CONN => Some(0),
        CODE_HELO => Some(1),
        CODE_MAIL => Some(2),
        CODE_RCPT => Some(3),
        CODE_DATA => Some(4),
        CODE_HEADER => Some(5),
        CODE_EOH => Some(6),
        CODE_BODY => Some(7),
        CODE_EOB => Some(8),
        _ => None,
    }
}

pub fn strip_brackets(s: &str) -> String {
    let t = s.trim();
    t.strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(t)
        .to_string()
}

pub fn wrap_angle(s: &str) -> String {
    let t = s.trim();
    if t.starts_with('<') && t.ends_with('>') {
        t.to_string()
    } else {
        format!("<{t}>")
    }
}

fn parse_addr_and_args(payload: &[u8]) -> Result<(String, Vec<String>), WireError> {
    let (addr, rest) = read_cstr(payload)?;
    Ok((addr, split_nul_terminated(rest)))
}

/// A MACRO frame: the command code it applies to, plus the ordered
/// name/value pairs the MTA is about to make available for it. A trailing
/// unpaired name (malformed, but seen on the wire) is treated as having
/// an empty value rather than rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroDef {
    pub command_code: u8,
    pub entries: Vec<(String, String)>,
}

impl MacroDef {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let &command_code = payload.first().ok_or(WireError::EmptyFrame)?;
        let parts = split_nul_terminated(&payload[1..]);
        let mut entries = Vec::with_capacity(parts.len().div_ceil(2));
        let mut it = parts.into_iter();
        while let Some(name) = it.next() {
            let value = it.next().unwrap_or_default();
            entries.push((name, value));
        }
        Ok(Self { command_code, entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.command_code];
        for (name, value) in &self.entries {
            write_cstr(&mut buf, name);
            write_cstr(&mut buf, value);
        }
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    pub args: Vec<String>,
}

impl Mail {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        let (from, args) = parse_addr_and_args(payload)?;
        Ok(Self { from, args })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_cstr(&mut buf, &self.from);
        for a in &self.args {
            write_cstr(&mut buf, a);
        }
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rcpt {
    pub to: String,
    pub args: Vec<String>,
}

impl Rcpt {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        let (to, args) = parse_addr_and_args(payload)?;
        Ok(Self { to, args })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_cstr(&mut buf, &self.to);
        for a in &self.args {
            write_cstr(&mut buf, a);
        }
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        let (name, rest) = read_cstr(payload)?;
        let (value, _) = read_cstr(rest)?;
        Ok(Self { name, value })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_cstr(&mut buf, &self.name);
        write_cstr(&mut buf, &self.value);
        buf
    }
}

pub use ConnInfo as Conn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mail_parses_sender_and_esmtp_args() {
        let mut payload = Vec::new();
        write_cstr(&mut payload, "<a@example.com>");
        write_cstr(&mut payload, "SIZE=100");
        write_cstr(&mut payload, "BODY=8BITMIME");
        let mail = Mail::parse(&payload).unwrap();
        assert_eq!(mail.from, "<a@example.com>");
        assert_eq!(mail.args, vec!["SIZE=100".to_string(), "BODY=8BITMIME".to_string()]);
    }

    #[test]
    fn mail_with_no_args_round_trips() {
        let mut payload = Vec::new();
        write_cstr(&mut payload, "<a@example.com>");
        let mail = Mail::parse(&payload).unwrap();
        assert!(mail.args.is_empty());
        assert_eq!(mail.encode(), payload);
    }

    #[test]
    fn macro_def_pairs_names_and_values() {
        let mut payload = vec![CODE_MAIL];
        write_cstr(&mut payload, "i");
        write_cstr(&mut payload, "queue-id");
        write_cstr(&mut payload, "j");
        write_cstr(&mut payload, "myhost");
        let def = MacroDef::decode(&payload).unwrap();
        assert_eq!(def.command_code, CODE_MAIL);
        assert_eq!(
            def.entries,
            vec![
                ("i".to_string(), "queue-id".to_string()),
                ("j".to_string(), "myhost".to_string())
            ]
        );
    }

    #[test]
    fn macro_def_tolerates_odd_trailing_name() {
        let mut payload = vec![CODE_CONN];
        write_cstr(&mut payload, "i");
        write_cstr(&mut payload, "queue-id");
        write_cstr(&mut payload, "orphan");
        let def = MacroDef::decode(&payload).unwrap();
        assert_eq!(def.entries.last(), Some(&("orphan".to_string(), String::new())));
    }

    #[test]
    fn wrap_angle_is_idempotent() {
        assert_eq!(wrap_angle("a@b"), "<a@b>");
        assert_eq!(wrap_angle("<a@b>"), "<a@b>");
    }

    #[test]
    fn strip_brackets_handles_bare_address() {
        assert_eq!(strip_brackets("<a@b>"), "a@b");
        assert_eq!(strip_brackets("a@b"), "a@b");
    }

    #[test]
    fn command_ordinal_orders_the_forward_lifecycle() {
        assert!(command_ordinal(CODE_CONN) < command_ordinal(CODE_HELO));
        assert!(command_ordinal(CODE_RCPT) < command_ordinal(CODE_DATA));
        assert_eq!(command_ordinal(CODE_ABORT), None);
    }
}
