//! Error taxonomy. Seven kinds, one flat enum at the top so callers can
//! match broadly (`MilterError::Io(_)`) or drill into a nested enum when
//! they care about the specific cause.

use std::io;

use thiserror::Error;

use crate::options::{ActionMask, ProtocolMask};

#[derive(Debug, Error)]
pub enum MilterError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("operation attempted on a session or server that is already closed")]
    Closed,
}

impl MilterError {
    /// Fatal errors leave the session unusable and move it to `Error`/closed.
    /// Permission and Input errors are recoverable: the caller made a single
    /// bad call and may retry with different arguments.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MilterError::Permission(_) | MilterError::Input(_))
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame length {0} exceeds the {1} byte cap")]
    FrameTooLarge(u32, u32),
    #[error("frame of length zero is missing a command code")]
    EmptyFrame,
    #[error("unexpected end of stream while reading a frame")]
    UnexpectedEof,
    #[error("unknown command or action code {0:#04x}")]
    UnknownCode(u8),
    #[error("malformed payload: missing terminating NUL in a C string field")]
    MissingNul,
    #[error("malformed payload: truncated or invalid fixed-width field")]
    Truncated,
    #[error("i/o error on the underlying transport: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::UnexpectedEof
        } else {
            WireError::Io(e)
        }
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer requested protocol version {requested}, outside the supported range 2..={max}")]
    VersionOutOfRange { requested: u32, max: u32 },
    #[error("requested action bits {requested:?} are not a subset of the offered bits {offered:?}")]
    ActionsNotOffered {
        requested: ActionMask,
        offered: ActionMask,
    },
    #[error("requested protocol bits {requested:?} are not a subset of the offered bits {offered:?}")]
    ProtocolNotOffered {
        requested: ProtocolMask,
        offered: ProtocolMask,
    },
    #[error("negotiation callback refused the connection")]
    Refused,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("{command} is illegal in session state {state}")]
    IllegalTransition {
        command: &'static str,
        state: &'static str,
    },
    #[error("Skip response received outside a Rcpt/HeaderField/BodyChunk context")]
    UnexpectedSkip,
}

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("the modifier is read-only in this callback phase")]
    WrongPhase,
    #[error("this operation requires protocol version >= {required}, negotiated {negotiated}")]
    VersionTooLow { required: u32, negotiated: u32 },
    #[error("this modification was not granted by the negotiated action mask")]
    NotAllowed,
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("header name is empty or contains a control character or ':'")]
    InvalidHeaderName,
    #[error("body chunk of {0} bytes exceeds the negotiated maximum of {1} bytes")]
    ChunkTooLarge(usize, usize),
    #[error("SMTP reply code {0} is outside 400..=599")]
    InvalidReplyCode(u16),
    #[error("reply text exceeds the maximum encoded length")]
    ReplyTextTooLong,
}
