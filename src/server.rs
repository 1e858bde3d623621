//! The filter-implementing side of the protocol: negotiates with an MTA,
//! then drives one `Filter` instance through the command dispatch table
//! for the lifetime of a single connection. Grounded on the teacher's
//! `MessageHandler` trait (one default-`Continue` method per command)
//! for the `Filter` shape, and on `miltr_server::{Milter,
//! Server::handle_connection}` for the dispatch-table/cleanup-table
//! shape, reworked from that crate's async `Framed` loop into the
//! teacher's blocking, thread-per-connection model.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::commands::{self, strip_brackets, wrap_angle, ConnInfo, HeaderField, Mail, MacroDef, Rcpt};
use crate::error::{InputError, MilterError, PermissionError};
use crate::macro_store::{MacroStore, MacroSubscriptions};
use crate::negotiate::{encode_subscriptions, server_negotiate_default, Negotiated, OptNeg};
use crate::options::{ActionMask, MacroStage, ProtocolMask, MAX_VERSION};
use crate::response::Response;
use crate::transport::Transport;
use crate::wire::{read_frame, write_frame};

static NEXT_MILTER_ID: AtomicU64 = AtomicU64::new(1);

/// The callbacks a filter implementation supplies. Every method defaults
/// to `Continue`/no-op, matching the teacher's `MessageHandler`: a filter
/// overrides only the commands it cares about.
pub trait Filter {
    fn new_connection(&mut self) {}
    fn connect(&mut self, _m: &mut Modifier<'_>, _info: &ConnInfo) -> Response {
        Response::Continue
    }
    fn helo(&mut self, _m: &mut Modifier<'_>, _hostname: &str) -> Response {
        Response::Continue
    }
    fn mail_from(&mut self, _m: &mut Modifier<'_>, _from: &str, _args: &[String]) -> Response {
        Response::Continue
    }
    fn rcpt_to(&mut self, _m: &mut Modifier<'_>, _to: &str, _args: &[String]) -> Response {
        Response::Continue
    }
    fn data(&mut self, _m: &mut Modifier<'_>) -> Response {
        Response::Continue
    }
    fn header(&mut self, _m: &mut Modifier<'_>, _name: &str, _value: &str) -> Response {
        Response::Continue
    }
    fn headers(&mut self, _m: &mut Modifier<'_>) -> Response {
        Response::Continue
    }
    fn body_chunk(&mut self, _m: &mut Modifier<'_>, _chunk: &[u8]) -> Response {
        Response::Continue
    }
    /// `None` (the default) is treated as `Accept`.
    fn end_of_message(&mut self, _m: &mut Modifier<'_>) -> Option<Response> {
        None
    }
    fn abort(&mut self, _m: &mut Modifier<'_>) {}
    fn unknown(&mut self, _m: &mut Modifier<'_>, _line: &str) -> Response {
        Response::Continue
    }
    fn cleanup(&mut self, _m: &mut Modifier<'_>) {}
}

/// Type-erased sink a `Modifier` writes Progress frames through, and that
/// `ServerSession` writes every other response/modification frame
/// through. Keeps `Filter`/`Modifier` free of a transport type parameter
/// — a filter implementation is the same code whether the MTA connected
/// over TCP or a Unix socket.
trait FrameSink: Send {
    fn write_frame(&mut self, code: u8, payload: &[u8], timeout: Duration) -> Result<(), MilterError>;
}

impl<T: Transport> FrameSink for T {
    fn write_frame(&mut self, code: u8, payload: &[u8], timeout: Duration) -> Result<(), MilterError> {
        write_frame(self, code, payload, Some(timeout))?;
        Ok(())
    }
}

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

/// What a `Modifier` permits a filter to do during the callback it was
/// handed into. Matches the three distinct situations the dispatch
/// table puts a callback in: a response is pending and only Progress can
/// be sent early (`ProgressOnly`), the callback owns the final response
/// and may mutate the message (`ReadWrite`), or no response frame is
/// being built at all (`ReadOnly`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierPhase {
    ReadOnly,
    ProgressOnly,
    ReadWrite,
}

/// The per-callback handle a `Filter` uses to read macros and, at
/// end-of-message, queue modifications. Modification methods are gated
/// by `phase`, the negotiated `ActionMask` bit, and (for the version-6
/// additions) the negotiated protocol version.
pub struct Modifier<'a> {
    macros: &'a MacroStore,
    negotiated: &'a Negotiated,
    phase: ModifierPhase,
    pending: Vec<(u8, Vec<u8>)>,
    writer: SharedSink,
    write_timeout: Duration,
}

impl<'a> Modifier<'a> {
    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.macros.get(name)
    }

    fn require_write(&self) -> Result<(), PermissionError> {
        if self.phase == ModifierPhase::ReadWrite {
            Ok(())
        } else {
            Err(PermissionError::WrongPhase)
        }
    }

    fn require_action(&self, bit: ActionMask) -> Result<(), PermissionError> {
        if self.negotiated.actions.contains(bit) {
            Ok(())
        } else {
            Err(PermissionError::NotAllowed)
        }
    }

    fn require_version(&self, required: u32) -> Result<(), PermissionError> {
        if self.negotiated.version >= required {
            Ok(())
        } else {
            Err(PermissionError::VersionTooLow {
                required,
                negotiated: self.negotiated.version,
            })
        }
    }

    /// Sends an out-of-band Progress frame, the one mutation allowed in
    /// any non-`ReadOnly` phase regardless of the negotiated action mask.
    pub fn progress(&self) -> Result<(), MilterError> {
        if self.phase == ModifierPhase::ReadOnly {
            return Err(PermissionError::WrongPhase.into());
        }
        self.require_version(6)?;
        let mut guard = self.writer.lock().expect("milter writer mutex poisoned");
        guard.write_frame(crate::response::ACT_PROGRESS, &[], self.write_timeout)?;
        Ok(())
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), MilterError> {
        self.require_write()?;
        self.require_action(ActionMask::ADD_HEADER)?;
        let (name, value) = sanitize_header(name, value)?;
        let mut buf = Vec::new();
        crate::wire::write_cstr(&mut buf, &name);
        crate::wire::write_cstr(&mut buf, &value);
        self.pending.push((crate::response::MOD_ADD_HEADER, buf));
        Ok(())
    }

    /// `index` is 1-based; 0 is normalized to 1 for compatibility with
    /// filters written against a long-standing libmilter client bug.
    pub fn change_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), MilterError> {
        self.require_write()?;
        self.require_action(ActionMask::CHANGE_HEADER)?;
        let (name, value) = sanitize_header(name, value)?;
        let index = if index == 0 { 1 } else { index };
        let mut buf = index.to_be_bytes().to_vec();
        crate::wire::write_cstr(&mut buf, &name);
        crate::wire::write_cstr(&mut buf, &value);
        self.pending.push((crate::response::MOD_CHANGE_HEADER, buf));
        Ok(())
    }

    /// `index` is 0-based, unlike `change_header`.
    pub fn insert_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), MilterError> {
        self.require_write()?;
        self.require_action(ActionMask::CHANGE_HEADER)?;
        let (name, value) = sanitize_header(name, value)?;
        let mut buf = index.to_be_bytes().to_vec();
        crate::wire::write_cstr(&mut buf, &name);
        crate::wire::write_cstr(&mut buf, &value);
        self.pending.push((crate::response::MOD_INS_HEADER, buf));
        Ok(())
    }

    pub fn add_recipient(&mut self, addr: &str, args: Option<&str>) -> Result<(), MilterError> {
        self.require_write()?;
        let addr = wrap_angle(&sanitize_addr_text(addr));
        let mut buf = Vec::new();
        crate::wire::write_cstr(&mut buf, &addr);
        let code = if let Some(args) = args {
            self.require_version(6)?;
            self.require_action(ActionMask::ADD_RCPT_WITH_ARGS)?;
            crate::wire::write_cstr(&mut buf, args);
            crate::response::MOD_ADD_RCPT_PAR
        } else {
            self.require_action(ActionMask::ADD_RCPT)?;
            crate::response::MOD_ADD_RCPT
        };
        self.pending.push((code, buf));
        Ok(())
    }

    pub fn delete_recipient(&mut self, addr: &str) -> Result<(), MilterError> {
        self.require_write()?;
        self.require_action(ActionMask::REMOVE_RCPT)?;
        let addr = wrap_angle(&sanitize_addr_text(addr));
        let mut buf = Vec::new();
        crate::wire::write_cstr(&mut buf, &addr);
        self.pending.push((crate::response::MOD_DEL_RCPT, buf));
        Ok(())
    }

    pub fn change_from(&mut self, addr: &str, args: Option<&str>) -> Result<(), MilterError> {
        self.require_write()?;
        self.require_version(6)?;
        self.require_action(ActionMask::CHANGE_FROM)?;
        let addr = wrap_angle(&sanitize_addr_text(addr));
        let mut buf = Vec::new();
        crate::wire::write_cstr(&mut buf, &addr);
        if let Some(args) = args {
            crate::wire::write_cstr(&mut buf, args);
        }
        self.pending.push((crate::response::MOD_CHANGE_FROM, buf));
        Ok(())
    }

    pub fn quarantine(&mut self, reason: &str) -> Result<(), MilterError> {
        self.require_write()?;
        self.require_action(ActionMask::QUARANTINE)?;
        let reason = sanitize_addr_text(reason);
        let mut buf = Vec::new();
        crate::wire::write_cstr(&mut buf, &reason);
        self.pending.push((crate::response::MOD_QUARANTINE, buf));
        Ok(())
    }

    pub fn replace_body<R: Read>(&mut self, src: &mut R) -> Result<(), MilterError> {
        self.require_write()?;
        self.require_action(ActionMask::CHANGE_BODY)?;
        let mut bytes = Vec::new();
        src.read_to_end(&mut bytes).map_err(MilterError::Io)?;
        let chunk_size = self.negotiated.max_data.bytes();
        for chunk in bytes.chunks(chunk_size.max(1)) {
            self.pending.push((crate::response::MOD_REPL_BODY, chunk.to_vec()));
        }
        Ok(())
    }
}

fn sanitize_header(name: &str, value: &str) -> Result<(String, String), InputError> {
    if name.is_empty() || name.contains(':') || name.bytes().any(|b| b <= 0x20 || b >= 0x7F) {
        return Err(InputError::InvalidHeaderName);
    }
    let value = value.replace("\r\n", "\n").replace('\r', "\n").replace('\0', " ");
    Ok((name.to_string(), value))
}

fn sanitize_addr_text(s: &str) -> String {
    s.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

#[derive(Clone)]
pub struct ServerConfig {
    pub write_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub max_version: u32,
    pub filter_actions: ActionMask,
    pub filter_protocol: ProtocolMask,
    pub macro_subscriptions: MacroSubscriptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            read_timeout: None,
            max_version: MAX_VERSION,
            filter_actions: ActionMask::all(),
            filter_protocol: ProtocolMask::empty(),
            macro_subscriptions: MacroSubscriptions::default(),
        }
    }
}

/// Maps a command's code to the `MacroStage` its macros were delivered
/// under. `None` for commands that never carry macros of their own.
fn emission_stage(code: u8) -> Option<MacroStage> {
    match code {
        commands::CODE_CONN => Some(MacroStage::Connect),
        commands::CODE_HELO => Some(MacroStage::Helo),
        commands::CODE_MAIL => Some(MacroStage::Mail),
        commands::CODE_RCPT => Some(MacroStage::Rcpt),
        commands::CODE_DATA => Some(MacroStage::Data),
        commands::CODE_HEADER | commands::CODE_BODY | commands::CODE_UNKNOWN => Some(MacroStage::EndMarker),
        commands::CODE_EOH => Some(MacroStage::EndOfHeaders),
        commands::CODE_EOB => Some(MacroStage::EndOfMessage),
        _ => None,
    }
}

/// Clears the macro store per the dispatch table's per-command cleanup
/// entries, run after that command's response has been sent.
fn cleanup_after(store: &mut MacroStore, code: u8) {
    match code {
        commands::CODE_CONN => store.delete_stage_and_above(MacroStage::Helo),
        commands::CODE_HELO => store.delete_stage_and_above(MacroStage::Mail),
        commands::CODE_MAIL => store.delete_stage_and_above(MacroStage::Rcpt),
        commands::CODE_RCPT => store.delete_stage_and_above(MacroStage::Data),
        commands::CODE_DATA => store.delete_stage_and_above(MacroStage::EndOfHeaders),
        commands::CODE_HEADER | commands::CODE_BODY | commands::CODE_UNKNOWN => store.clear_end_marker(),
        commands::CODE_EOH => store.delete_stage_and_above(MacroStage::EndOfMessage),
        commands::CODE_ABORT => store.delete_stage_and_above(MacroStage::Helo),
        commands::CODE_QUIT_NC => store.delete_stage_and_above(MacroStage::Connect),
        _ => {}
    }
}

/// One accepted connection's worth of protocol state: the negotiated
/// parameters, the macro store, and the bookkeeping needed to detect an
/// implicit restart (a new command whose position in the forward
/// lifecycle regresses without an explicit `ABORT`).
pub struct ServerSession<T: Transport> {
    reader: T,
    writer: SharedSink,
    config: ServerConfig,
    negotiated: Option<Negotiated>,
    macros: MacroStore,
    milter_id: u64,
    last_lifecycle_ordinal: Option<u8>,
    last_was_explicit_abort: bool,
}

impl<T: Transport + 'static> ServerSession<T> {
    pub fn new(transport: T, config: ServerConfig) -> Result<Self, MilterError> {
        let clone = transport.try_clone().map_err(MilterError::Io)?;
        let writer: SharedSink = Arc::new(Mutex::new(Box::new(clone)));
        Ok(Self {
            reader: transport,
            writer,
            config,
            negotiated: None,
            macros: MacroStore::new(),
            milter_id: NEXT_MILTER_ID.fetch_add(1, Ordering::Relaxed),
            last_lifecycle_ordinal: None,
            last_was_explicit_abort: false,
        })
    }

    pub fn milter_id(&self) -> u64 {
        self.milter_id
    }

    fn read(&mut self) -> Result<(u8, Vec<u8>), MilterError> {
        Ok(read_frame(&mut self.reader, self.config.read_timeout)?)
    }

    fn write(&mut self, code: u8, payload: &[u8]) -> Result<(), MilterError> {
        let mut guard = self.writer.lock().expect("milter writer mutex poisoned");
        guard.write_frame(code, payload, self.config.write_timeout)
    }

    fn negotiated(&self) -> &Negotiated {
        self.negotiated.as_ref().expect("negotiate() must run before dispatch")
    }

    /// Performs the OPTNEG handshake. Must be the first thing called on
    /// a fresh session.
    pub fn negotiate(&mut self) -> Result<(), MilterError> {
        let (code, payload) = self.read()?;
        if code != commands::CODE_OPTNEG {
            return Err(crate::error::WireError::UnknownCode(code).into());
        }
        let mta = OptNeg::decode(&payload)?;
        let negotiated = server_negotiate_default(
            &mta,
            self.config.filter_actions,
            self.config.filter_protocol,
            self.config.max_version,
        )?;

        let response = OptNeg {
            version: negotiated.version,
            actions: negotiated.actions,
            protocol: negotiated.protocol,
        };
        let mut payload = response.encode();
        if negotiated.actions.contains(ActionMask::SET_MACROS) {
            payload.extend(encode_subscriptions(&self.config.macro_subscriptions));
        }
        self.write(commands::CODE_OPTNEG, &payload)?;
        self.negotiated = Some(negotiated);
        Ok(())
    }

    fn modifier(&self, phase: ModifierPhase) -> Modifier<'_> {
        Modifier {
            macros: &self.macros,
            negotiated: self.negotiated.as_ref().expect("negotiate() must run before dispatch"),
            phase,
            pending: Vec::new(),
            writer: Arc::clone(&self.writer),
            write_timeout: self.config.write_timeout,
        }
    }

    fn respond(&mut self, nr_bit: ProtocolMask, resp: Response) -> Result<(), MilterError> {
        if self.negotiated().protocol.contains(nr_bit) {
            return Ok(());
        }
        let (code, payload) = resp.encode().map_err(MilterError::from)?;
        self.write(code, &payload)
    }

    fn store_macro(&mut self, def: MacroDef) {
        let Some(stage) = emission_stage(def.command_code) else {
            log::warn!("ignoring MACRO frame for unrecognized command code {:#04x}", def.command_code);
            return;
        };
        self.macros.set_stage(stage, def.entries);
    }

    /// The main per-connection loop: negotiates, then dispatches frames
    /// to `filter` until `QUIT` or a fatal error.
    pub fn serve<F: Filter>(&mut self, filter: &mut F) -> Result<(), MilterError> {
        self.negotiate()?;
        filter.new_connection();

        loop {
            let (code, payload) = self.read()?;

            if let Some(ordinal) = commands::command_ordinal(code) {
                if let Some(prev) = self.last_lifecycle_ordinal {
                    if ordinal < prev && !self.last_was_explicit_abort {
                        self.run_abort(filter)?;
                    }
                }
                self.last_lifecycle_ordinal = Some(ordinal);
                self.last_was_explicit_abort = false;
            }

            match code {
                commands::CODE_MACRO => {
                    let def = MacroDef::decode(&payload)?;
                    self.store_macro(def);
                }
                commands::CODE_CONN => {
                    let info = ConnInfo::parse(&payload)?;
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.connect(&mut m, &info);
                    self.respond(ProtocolMask::NR_CONNECT, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_HELO => {
                    let (hostname, _) = crate::wire::read_cstr(&payload)?;
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.helo(&mut m, &hostname);
                    self.respond(ProtocolMask::NR_HELO, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_MAIL => {
                    let mail = Mail::parse(&payload)?;
                    let from = strip_brackets(&mail.from);
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.mail_from(&mut m, &from, &mail.args);
                    self.respond(ProtocolMask::NR_MAIL, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_RCPT => {
                    let rcpt = Rcpt::parse(&payload)?;
                    let to = strip_brackets(&rcpt.to);
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.rcpt_to(&mut m, &to, &rcpt.args);
                    self.respond(ProtocolMask::NR_RECIPIENT, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_DATA => {
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.data(&mut m);
                    self.respond(ProtocolMask::NR_DATA, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_HEADER => {
                    let field = HeaderField::parse(&payload)?;
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.header(&mut m, &field.name, &field.value);
                    self.respond(ProtocolMask::NO_HEADER_REPLY, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_EOH => {
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.headers(&mut m);
                    self.respond(ProtocolMask::NR_END_OF_HEADER, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_BODY => {
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.body_chunk(&mut m, &payload);
                    self.respond(ProtocolMask::NR_BODY, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_EOB => {
                    self.run_end_of_message(filter)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_UNKNOWN => {
                    let (line, _) = crate::wire::read_cstr(&payload)?;
                    let mut m = self.modifier(ModifierPhase::ProgressOnly);
                    let resp = filter.unknown(&mut m, &line);
                    self.respond(ProtocolMask::NR_UNKNOWN, resp)?;
                    cleanup_after(&mut self.macros, code);
                }
                commands::CODE_ABORT => {
                    if !self.last_was_explicit_abort {
                        self.run_abort(filter)?;
                        self.last_was_explicit_abort = true;
                    }
                }
                commands::CODE_QUIT => {
                    let mut m = self.modifier(ModifierPhase::ReadOnly);
                    filter.cleanup(&mut m);
                    return Ok(());
                }
                commands::CODE_QUIT_NC => {
                    cleanup_after(&mut self.macros, code);
                    self.last_lifecycle_ordinal = None;
                    self.last_was_explicit_abort = false;
                    filter.new_connection();
                }
                other => {
                    return Err(crate::error::WireError::UnknownCode(other).into());
                }
            }
        }
    }

    fn run_abort<F: Filter>(&mut self, filter: &mut F) -> Result<(), MilterError> {
        let mut m = self.modifier(ModifierPhase::ReadOnly);
        filter.abort(&mut m);
        self.macros.delete_stage_and_above(MacroStage::Helo);
        Ok(())
    }

    /// `EOB` always gets a response — no No*Reply bit applies to it. Any
    /// pending modifications are sent before the final action, and a
    /// `None`/`Continue` callback result is treated as `Accept`.
    fn run_end_of_message<F: Filter>(&mut self, filter: &mut F) -> Result<(), MilterError> {
        let mut m = self.modifier(ModifierPhase::ReadWrite);
        let resp = filter.end_of_message(&mut m).unwrap_or(Response::Accept);
        let resp = if resp == Response::Continue { Response::Accept } else { resp };
        let pending = std::mem::take(&mut m.pending);

        for (code, payload) in pending {
            self.write(code, &payload)?;
        }
        let (code, payload) = resp.encode().map_err(MilterError::from)?;
        self.write(code, &payload)
    }
}
