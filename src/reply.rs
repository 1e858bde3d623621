//! Pure formatting/parsing for the `RejectWithCode` reply-code action,
//! factored out of `response.rs` per spec.md's own design note that this
//! deserves to be independently testable.

use crate::error::{InputError, WireError};
use crate::wire::read_cstr;

const MAX_REPLY_PAYLOAD: usize = 65_536 - 5;
/// Conservative SMTP line-length budget for a single wrapped line, leaving
/// room for the "NNN-"/"NNN " prefix.
const MAX_LINE_LEN: usize = 998;

pub struct ReplyCode {
    pub code: u16,
    pub text: String,
}

/// Builds the NUL-terminated multi-line reply payload libmilter expects
/// for `SMFIR_REPLYCODE`: `%` doubled, CRLF canonicalized, long lines
/// wrapped, every line but the last using a '-' continuation marker.
pub fn format_reject_code(code: u16, reason: &str) -> Result<Vec<u8>, InputError> {
    if !(400..=599).contains(&code) {
        return Err(InputError::InvalidReplyCode(code));
    }

    let escaped = reason.replace('%', "%%");
    let normalized = escaped.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\r\n");

    let mut wrapped_lines = Vec::new();
    for line in normalized.split("\r\n") {
        if line.len() <= MAX_LINE_LEN {
            wrapped_lines.push(line.to_string());
        } else {
            for chunk in line.as_bytes().chunks(MAX_LINE_LEN) {
                wrapped_lines.push(String::from_utf8_lossy(chunk).into_owned());
            }
        }
    }
    if wrapped_lines.is_empty() {
        wrapped_lines.push(String::new());
    }

    let last = wrapped_lines.len() - 1;
    let mut buf = Vec::new();
    for (i, line) in wrapped_lines.iter().enumerate() {
        buf.extend_from_slice(code.to_string().as_bytes());
        buf.push(if i == last { b' ' } else { b'-' });
        buf.extend_from_slice(line.as_bytes());
        if i != last {
            buf.extend_from_slice(b"\r\n");
        }
    }
    buf.push(0);

    if buf.len() > MAX_REPLY_PAYLOAD {
        return Err(InputError::ReplyTextTooLong);
    }
    Ok(buf)
}

/// Recovers the numeric code and the full formatted text (sans the
/// trailing NUL) from a `SMFIR_REPLYCODE` payload.
pub fn parse_reject_code(payload: &[u8]) -> Result<ReplyCode, WireError> {
    let (text, _) = read_cstr(payload)?;
    let code_str = text.get(0..3).ok_or(WireError::Truncated)?;
    let code: u16 = code_str.parse().map_err(|_| WireError::Truncated)?;
    Ok(ReplyCode { code, text })
}
