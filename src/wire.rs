//! The length-prefixed framing every milter message rides on: a 4-byte
//! big-endian body length (which includes the 1-byte command/action code)
//! followed by the code and payload. Replaces the teacher's manual
//! `Vec<u8>` accumulator (`Milter::handle_stream`) with a per-frame
//! blocking read under a caller-supplied timeout.

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::WireError;
use crate::transport::Transport;

/// Sendmail's own hard cap on a single frame body.
pub const MAX_FRAME_LEN: u32 = 512 * 1024 * 1024;

pub fn read_frame<T: Transport + ?Sized>(
    stream: &mut T,
    timeout: Option<Duration>,
) -> Result<(u8, Vec<u8>), WireError> {
    stream.set_read_timeout(timeout)?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len, MAX_FRAME_LEN));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    let code = body[0];
    let payload = body.split_off(1);
    Ok((code, payload))
}

pub fn write_frame<T: Transport + ?Sized>(
    stream: &mut T,
    code: u8,
    payload: &[u8],
    timeout: Option<Duration>,
) -> Result<(), WireError> {
    stream.set_write_timeout(timeout)?;

    let body_len = payload
        .len()
        .checked_add(1)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(WireError::FrameTooLarge(u32::MAX, MAX_FRAME_LEN))?;
    if body_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body_len, MAX_FRAME_LEN));
    }

    stream.write_all(&body_len.to_be_bytes())?;
    stream.write_all(&[code])?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

/// Reads up to (not including) the first NUL byte, lossily. Macro and
/// address values are opaque octet strings to this crate; only C-string
/// termination is actually enforced.
pub fn read_cstr(buf: &[u8]) -> Result<(String, &[u8]), WireError> {
    let pos = buf.iter().position(|&b| b == 0).ok_or(WireError::MissingNul)?;
    let s = String::from_utf8_lossy(&buf[..pos]).into_owned();
    Ok((s, &buf[pos + 1..]))
}

pub fn write_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Splits a payload on NUL separators, preserving empty segments. Callers
/// that know a trailing NUL is a terminator rather than a separator (ESMTP
/// arg lists, macro k/v lists) drop the resulting trailing empty element
/// themselves.
pub fn split_nul(buf: &[u8]) -> Vec<String> {
    buf.split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Splits on NUL and drops a single trailing empty segment produced by a
/// final terminating NUL (the common case for ESMTP arg lists and macro
/// name/value lists).
pub fn split_nul_terminated(buf: &[u8]) -> Vec<String> {
    let mut parts = split_nul(buf);
    if parts.last().map_or(false, |s| s.is_empty()) {
        parts.pop();
    }
    parts
}
