//! Filter-to-MTA action and modification frames. Grounded on the
//! teacher's `AcceptRejectAction`/`ResponseMessage` (5-byte frame
//! construction per variant) and on `miltr_common::modifications`'s
//! capability-gated modification set, which the teacher has no
//! equivalent of at all.

use crate::error::{InputError, WireError};
use crate::reply::{format_reject_code, parse_reject_code};
use crate::wire::{read_cstr, write_cstr};

pub const ACT_CONTINUE: u8 = b'c';
pub const ACT_ACCEPT: u8 = b'a';
pub const ACT_DISCARD: u8 = b'd';
pub const ACT_REJECT: u8 = b'r';
pub const ACT_TEMPFAIL: u8 = b't';
pub const ACT_REPLYCODE: u8 = b'y';
pub const ACT_SKIP: u8 = b's';
pub const ACT_PROGRESS: u8 = b'p';

pub const MOD_ADD_RCPT: u8 = b'+';
pub const MOD_ADD_RCPT_PAR: u8 = b'2';
pub const MOD_DEL_RCPT: u8 = b'-';
pub const MOD_REPL_BODY: u8 = b'b';
pub const MOD_QUARANTINE: u8 = b'q';
pub const MOD_CHANGE_FROM: u8 = b'e';
pub const MOD_ADD_HEADER: u8 = b'h';
pub const MOD_INS_HEADER: u8 = b'i';
pub const MOD_CHANGE_HEADER: u8 = b'm';

/// A filter's final verdict for a single command (or, at end-of-message,
/// for the whole message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Continue,
    Accept,
    Discard,
    Reject,
    TempFail,
    /// Only legal in response to Rcpt, HeaderField or BodyChunk; any
    /// other context is a wire-level protocol violation.
    Skip,
    RejectWithCode { code: u16, text: String },
}

impl Response {
    /// The only way to build a `RejectWithCode` — validates the code
    /// range and the encoded length up front so `encode` can never fail
    /// on a value this type produced itself.
    pub fn reject_with_code(code: u16, reason: &str) -> Result<Self, InputError> {
        let formatted = format_reject_code(code, reason)?;
        let text = String::from_utf8_lossy(&formatted[..formatted.len() - 1]).into_owned();
        Ok(Response::RejectWithCode { code, text })
    }

    pub fn encode(&self) -> Result<(u8, Vec<u8>), InputError> {
        match self {
            Response::Continue => Ok((ACT_CONTINUE, Vec::new())),
            Response::Accept => Ok((ACT_ACCEPT, Vec::new())),
            Response::Discard => Ok((ACT_DISCARD, Vec::new())),
            Response::Reject => Ok((ACT_REJECT, Vec::new())),
            Response::TempFail => Ok((ACT_TEMPFAIL, Vec::new())),
            Response::Skip => Ok((ACT_SKIP, Vec::new())),
            Response::RejectWithCode { code, text } => {
                let mut buf = text.as_bytes().to_vec();
                buf.push(0);
                if !(400..=599).contains(code) {
                    return Err(InputError::InvalidReplyCode(*code));
                }
                Ok((ACT_REPLYCODE, buf))
            }
        }
    }

    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, WireError> {
        match code {
            ACT_CONTINUE => Ok(Response::Continue),
            ACT_ACCEPT => Ok(Response::Accept),
            ACT_DISCARD => Ok(Response::Discard),
            ACT_REJECT => Ok(Response::Reject),
            ACT_TEMPFAIL => Ok(Response::TempFail),
            ACT_SKIP => Ok(Response::Skip),
            ACT_REPLYCODE => {
                let reply = parse_reject_code(payload)?;
                Ok(Response::RejectWithCode {
                    code: reply.code,
                    text: reply.text,
                })
            }
            other => Err(WireError::UnknownCode(other)),
        }
    }
}

/// A single end-of-message modification. Each variant is gated by a
/// specific `ActionMask` bit and, for `ChangeFrom`/`AddRecipient` with
/// ESMTP args, by protocol version >= 6 — enforced by `Modifier`, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModificationAction {
    AddRecipient { addr: String, args: Option<String> },
    DeleteRecipient { addr: String },
    ReplaceBody { bytes: Vec<u8> },
    Quarantine { reason: String },
    ChangeFrom { addr: String, args: Option<String> },
    AddHeader { name: String, value: String },
    /// 1-based; a caller-supplied index of 0 is normalized to 1 for
    /// compatibility with filters written against the historical bug in
    /// widely deployed libmilter clients.
    ChangeHeader { index: u32, name: String, value: String },
    /// 0-based, unlike `ChangeHeader`.
    InsertHeader { index: u32, name: String, value: String },
}

impl ModificationAction {
    pub fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            ModificationAction::AddRecipient { addr, args: None } => {
                let mut buf = Vec::new();
                write_cstr(&mut buf, addr);
                (MOD_ADD_RCPT, buf)
            }
            ModificationAction::AddRecipient { addr, args: Some(args) } => {
                let mut buf = Vec::new();
                write_cstr(&mut buf, addr);
                write_cstr(&mut buf, args);
                (MOD_ADD_RCPT_PAR, buf)
            }
            ModificationAction::DeleteRecipient { addr } => {
                let mut buf = Vec::new();
                write_cstr(&mut buf, addr);
                (MOD_DEL_RCPT, buf)
            }
            ModificationAction::ReplaceBody { bytes } => (MOD_REPL_BODY, bytes.clone()),
            ModificationAction::Quarantine { reason } => {
                let mut buf = Vec::new();
                write_cstr(&mut buf, reason);
                (MOD_QUARANTINE, buf)
            }
            ModificationAction::ChangeFrom { addr, args } => {
                let mut buf = Vec::new();
                write_cstr(&mut buf, addr);
                if let Some(args) = args {
                    write_cstr(&mut buf, args);
                }
                (MOD_CHANGE_FROM, buf)
            }
            ModificationAction::AddHeader { name, value } => {
                let mut buf = Vec::new();
                write_cstr(&mut buf, name);
                write_cstr(&mut buf, value);
                (MOD_ADD_HEADER, buf)
            }
            ModificationAction::ChangeHeader { index, name, value } => {
                let mut buf = index.to_be_bytes().to_vec();
                write_cstr(&mut buf, name);
                write_cstr(&mut buf, value);
                (MOD_CHANGE_HEADER, buf)
            }
            ModificationAction::InsertHeader { index, name, value } => {
                let mut buf = index.to_be_bytes().to_vec();
                write_cstr(&mut buf, name);
                write_cstr(&mut buf, value);
                (MOD_INS_HEADER, buf)
            }
        }
    }

    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, WireError> {
        match code {
            MOD_ADD_RCPT => {
                let (addr, _) = read_cstr(payload)?;
                Ok(ModificationAction::AddRecipient { addr, args: None })
            }
            MOD_ADD_RCPT_PAR => {
                let (addr, rest) = read_cstr(payload)?;
                let (args, _) = read_cstr(rest)?;
                Ok(ModificationAction::AddRecipient {
                    addr,
                    args: Some(args),
                })
            }
            MOD_DEL_RCPT => {
                let (addr, _) = read_cstr(payload)?;
                Ok(ModificationAction::DeleteRecipient { addr })
            }
            MOD_REPL_BODY => Ok(ModificationAction::ReplaceBody {
                bytes: payload.to_vec(),
            }),
            MOD_QUARANTINE => {
                let (reason, _) = read_cstr(payload)?;
                Ok(ModificationAction::Quarantine { reason })
            }
            MOD_CHANGE_FROM => {
                let (addr, rest) = read_cstr(payload)?;
                let args = if rest.is_empty() {
                    None
                } else {
                    Some(read_cstr(rest)?.0)
                };
                Ok(ModificationAction::ChangeFrom { addr, args })
            }
            MOD_ADD_HEADER => {
                let (name, rest) = read_cstr(payload)?;
                let (value, _) = read_cstr(rest)?;
                Ok(ModificationAction::AddHeader { name, value })
            }
            MOD_CHANGE_HEADER => {
                if payload.len() < 4 {
                    return Err(WireError::Truncated);
                }
                let mut index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                if index == 0 {
                    index = 1;
                }
                let (name, rest) = read_cstr(&payload[4..])?;
                let (value, _) = read_cstr(rest)?;
                Ok(ModificationAction::ChangeHeader { index, name, value })
            }
            MOD_INS_HEADER => {
                if payload.len() < 4 {
                    return Err(WireError::Truncated);
                }
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let (name, rest) = read_cstr(&payload[4..])?;
                let (value, _) = read_cstr(rest)?;
                Ok(ModificationAction::InsertHeader { index, name, value })
            }
            other => Err(WireError::UnknownCode(other)),
        }
    }
}

pub fn is_modification_code(code: u8) -> bool {
    matches!(
        code,
        MOD_ADD_RCPT
            | MOD_ADD_RCPT_PAR
            | MOD_DEL_RCPT
            | MOD_REPL_BODY
            | MOD_QUARANTINE
            | MOD_CHANGE_FROM
            | MOD_ADD_HEADER
            | MOD_INS_HEADER
            | MOD_CHANGE_HEADER
    )
}

/// Distinguishes the two kinds of frame that can follow an EOB command:
/// zero or more modifications, then exactly one final action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Action(Response),
    Modification(ModificationAction),
}

impl ServerFrame {
    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, WireError> {
        if is_modification_code(code) {
            Ok(ServerFrame::Modification(ModificationAction::decode(code, payload)?))
        } else {
            Ok(ServerFrame::Action(Response::decode(code, payload)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_encodes_to_empty_payload() {
        let (code, payload) = Response::Continue.encode().unwrap();
        assert_eq!(code, ACT_CONTINUE);
        assert!(payload.is_empty());
    }

    #[test]
    fn reject_with_code_round_trips_through_decode() {
        let resp = Response::reject_with_code(550, "go away\r\nreally!").unwrap();
        let (code, payload) = resp.encode().unwrap();
        let decoded = Response::decode(code, &payload).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn change_header_zero_index_normalizes_to_one() {
        let mut payload = 0u32.to_be_bytes().to_vec();
        write_cstr(&mut payload, "Subject");
        write_cstr(&mut payload, "hi");
        let action = ModificationAction::decode(MOD_CHANGE_HEADER, &payload).unwrap();
        assert_eq!(
            action,
            ModificationAction::ChangeHeader {
                index: 1,
                name: "Subject".to_string(),
                value: "hi".to_string(),
            }
        );
    }

    #[test]
    fn insert_header_index_zero_stays_zero() {
        let mut payload = 0u32.to_be_bytes().to_vec();
        write_cstr(&mut payload, "X-New");
        write_cstr(&mut payload, "v");
        let action = ModificationAction::decode(MOD_INS_HEADER, &payload).unwrap();
        assert_eq!(
            action,
            ModificationAction::InsertHeader {
                index: 0,
                name: "X-New".to_string(),
                value: "v".to_string(),
            }
        );
    }

    #[test]
    fn add_recipient_with_and_without_args_round_trip() {
        let plain = ModificationAction::AddRecipient {
            addr: "<a@b>".to_string(),
            args: None,
        };
        let (code, payload) = plain.encode();
        assert_eq!(ModificationAction::decode(code, &payload).unwrap(), plain);

        let with_args = ModificationAction::AddRecipient {
            addr: "<a@b>".to_string(),
            args: Some("SIZE=1".to_string()),
        };
        let (code, payload) = with_args.encode();
        assert_eq!(ModificationAction::decode(code, &payload).unwrap(), with_args);
    }

    #[test]
    fn server_frame_distinguishes_action_from_modification() {
        let (code, payload) = Response::Accept.encode().unwrap();
        assert!(matches!(
            ServerFrame::decode(code, &payload).unwrap(),
            ServerFrame::Action(Response::Accept)
        ));

        let modification = ModificationAction::Quarantine {
            reason: "spam".to_string(),
        };
        let (code, payload) = modification.encode();
        assert!(matches!(
            ServerFrame::decode(code, &payload).unwrap(),
            ServerFrame::Modification(ModificationAction::Quarantine { .. })
        ));
    }
}
