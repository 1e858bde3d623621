//! The filter-consuming side of the protocol: drives an MTA-shaped
//! conversation against a server (real sendmail/postfix, or another
//! `ServerSession` in tests). No teacher equivalent — `rmilter` only ever
//! plays the filter/server role — grounded on `miltr_client::Client`/
//! `Connection` for the command-by-command request/response dance, with
//! method naming kept close to the teacher's `MessageHandler` call shape.

use std::io::Read;
use std::time::Duration;

use crate::commands::{self, wrap_angle, ConnInfo, HeaderField, Mail, MacroDef, Rcpt};
use crate::error::{InputError, MilterError, StateError, WireError};
use crate::macro_store::MacroSubscriptions;
use crate::negotiate::{client_validate_response, parse_subscriptions, Negotiated, OptNeg};
use crate::options::{ActionMask, MacroStage, MaxDataSize, ProtocolMask, MAX_VERSION};
use crate::response::{ModificationAction, Response, ServerFrame};
use crate::transport::Transport;
use crate::wire::{read_frame, write_frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Closed,
    Negotiated,
    ConnectCalled,
    HeloCalled,
    MailCalled,
    RcptCalled,
    DataCalled,
    HeaderFieldCalled,
    HeaderEndCalled,
    BodyChunkCalled,
    Error,
}

/// The three commands a `Skip` response can accelerate past. Issuing a
/// command outside the current class clears acceleration even if the new
/// command is itself skip-eligible for a different class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipClass {
    Rcpt,
    HeaderField,
    BodyChunk,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_data: MaxDataSize,
    pub requested_version: u32,
    pub requested_actions: ActionMask,
    pub requested_protocol: ProtocolMask,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_data: MaxDataSize::default(),
            requested_version: MAX_VERSION,
            requested_actions: ActionMask::all(),
            requested_protocol: ProtocolMask::empty(),
        }
    }
}

/// Drives one SMTP-session-shaped conversation with a filter over `T`.
/// One instance per connection being filtered; `reset`/`quit` return it
/// to a state where a fresh conversation can start on the same socket.
pub struct ClientSession<T: Transport> {
    transport: T,
    state: ClientState,
    negotiated: Negotiated,
    subscriptions: MacroSubscriptions,
    skip: Option<SkipClass>,
    config: ClientConfig,
    closed: bool,
}

impl<T: Transport> ClientSession<T> {
    /// Performs the OPTNEG handshake and returns a session ready for
    /// `conn`.
    pub fn connect(mut transport: T, config: ClientConfig) -> Result<Self, MilterError> {
        let request = OptNeg {
            version: config.requested_version,
            actions: config.requested_actions,
            protocol: config.requested_protocol | config.max_data.protocol_bit(),
        };
        write_frame(&mut transport, commands::CODE_OPTNEG, &request.encode(), Some(config.write_timeout))?;
        let (code, payload) = read_frame(&mut transport, Some(config.read_timeout))?;
        if code != commands::CODE_OPTNEG {
            return Err(WireError::UnknownCode(code).into());
        }
        let response = OptNeg::decode(&payload)?;
        let negotiated = client_validate_response(&request, &response)?;
        let subscriptions = if payload.len() > 12 {
            parse_subscriptions(&payload[12..])
        } else {
            MacroSubscriptions::default()
        };

        Ok(Self {
            transport,
            state: ClientState::Negotiated,
            negotiated,
            subscriptions,
            skip: None,
            config,
            closed: false,
        })
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    fn require_state(&mut self, allowed: &[ClientState], command: &'static str) -> Result<(), MilterError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.fail(StateError::IllegalTransition {
                command,
                state: state_name(self.state),
            }
            .into()))
        }
    }

    fn fail(&mut self, e: MilterError) -> MilterError {
        if e.is_fatal() {
            self.state = ClientState::Error;
        }
        e
    }

    fn update_skip_on_command(&mut self, class: Option<SkipClass>) {
        if self.skip != class {
            self.skip = None;
        }
    }

    /// Emits a MACRO frame for `stage` if the MTA side has subscribed to
    /// at least one name for it and the caller supplied a value for at
    /// least one of those names.
    fn emit_macros(
        &mut self,
        stage: MacroStage,
        cmd_code: u8,
        macros: &[(&str, &str)],
    ) -> Result<(), MilterError> {
        let wanted = self.subscriptions.get(stage);
        if wanted.is_empty() {
            return Ok(());
        }
        let entries: Vec<(String, String)> = wanted
            .iter()
            .filter_map(|name| {
                macros
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(n, v)| (n.to_string(), v.to_string()))
            })
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        let def = MacroDef { command_code: cmd_code, entries };
        write_frame(&mut self.transport, commands::CODE_MACRO, &def.encode(), Some(self.config.write_timeout))
            .map_err(|e| self.fail(e.into()))
    }

    fn send_command(
        &mut self,
        code: u8,
        payload: &[u8],
        no_bit: ProtocolMask,
        nr_bit: ProtocolMask,
    ) -> Result<Response, MilterError> {
        if self.negotiated.protocol.contains(no_bit) {
            return Ok(Response::Continue);
        }
        write_frame(&mut self.transport, code, payload, Some(self.config.write_timeout))
            .map_err(|e| self.fail(e.into()))?;
        if self.negotiated.protocol.contains(nr_bit) {
            return Ok(Response::Continue);
        }
        self.read_final_action()
    }

    /// Consumes any number of Progress frames before the terminal action.
    fn read_final_action(&mut self) -> Result<Response, MilterError> {
        loop {
            let (code, payload) = read_frame(&mut self.transport, Some(self.config.read_timeout))
                .map_err(|e| self.fail(e.into()))?;
            if code == crate::response::ACT_PROGRESS {
                continue;
            }
            return Response::decode(code, &payload).map_err(|e| self.fail(e.into()));
        }
    }

    fn disallow_skip(&mut self, resp: Response) -> Result<Response, MilterError> {
        if resp == Response::Skip {
            Err(self.fail(StateError::UnexpectedSkip.into()))
        } else {
            Ok(resp)
        }
    }

    /// `Discard` from Conn/Helo is not a legal outcome for those two
    /// commands at this point in the conversation (there's no message to
    /// discard yet) and is downgraded to `Continue`.
    fn downgrade_discard(&self, resp: Response, context: &str) -> Response {
        if resp == Response::Discard {
            log::warn!("filter returned Discard for {context}, downgrading to Continue");
            Response::Continue
        } else {
            resp
        }
    }

    pub fn conn(&mut self, info: &ConnInfo, macros: &[(&str, &str)]) -> Result<Response, MilterError> {
        self.require_state(&[ClientState::Negotiated], "conn")?;
        self.update_skip_on_command(None);
        self.emit_macros(MacroStage::Connect, commands::CODE_CONN, macros)?;
        let resp = self.send_command(
            commands::CODE_CONN,
            &info.encode(),
            ProtocolMask::NO_CONNECT,
            ProtocolMask::NR_CONNECT,
        )?;
        let resp = self.disallow_skip(resp)?;
        let resp = self.downgrade_discard(resp, "conn");
        self.state = ClientState::ConnectCalled;
        Ok(resp)
    }

    pub fn helo(&mut self, hostname: &str, macros: &[(&str, &str)]) -> Result<Response, MilterError> {
        self.require_state(&[ClientState::ConnectCalled, ClientState::HeloCalled], "helo")?;
        self.update_skip_on_command(None);
        self.emit_macros(MacroStage::Helo, commands::CODE_HELO, macros)?;
        let mut payload = hostname.as_bytes().to_vec();
        payload.push(0);
        let resp = self.send_command(
            commands::CODE_HELO,
            &payload,
            ProtocolMask::NO_HELO,
            ProtocolMask::NR_HELO,
        )?;
        let resp = self.disallow_skip(resp)?;
        let resp = self.downgrade_discard(resp, "helo");
        self.state = ClientState::HeloCalled;
        Ok(resp)
    }

    pub fn mail(&mut self, from: &str, args: &[String], macros: &[(&str, &str)]) -> Result<Response, MilterError> {
        self.require_state(&[ClientState::HeloCalled], "mail")?;
        self.update_skip_on_command(None);
        self.emit_macros(MacroStage::Mail, commands::CODE_MAIL, macros)?;
        let mail = Mail {
            from: wrap_angle(from),
            args: args.to_vec(),
        };
        let resp = self.send_command(
            commands::CODE_MAIL,
            &mail.encode(),
            ProtocolMask::NO_MAIL,
            ProtocolMask::NR_MAIL,
        )?;
        let resp = self.disallow_skip(resp)?;
        self.state = ClientState::MailCalled;
        Ok(resp)
    }

    pub fn rcpt(&mut self, to: &str, args: &[String], macros: &[(&str, &str)]) -> Result<Response, MilterError> {
        self.require_state(&[ClientState::MailCalled, ClientState::RcptCalled], "rcpt")?;
        self.update_skip_on_command(Some(SkipClass::Rcpt));
        if self.skip == Some(SkipClass::Rcpt) {
            self.state = ClientState::RcptCalled;
            return Ok(Response::Continue);
        }
        self.emit_macros(MacroStage::Rcpt, commands::CODE_RCPT, macros)?;
        let rcpt = Rcpt {
            to: wrap_angle(to),
            args: args.to_vec(),
        };
        let resp = self.send_command(
            commands::CODE_RCPT,
            &rcpt.encode(),
            ProtocolMask::NO_RECIPIENT,
            ProtocolMask::NR_RECIPIENT,
        )?;
        if resp == Response::Skip {
            self.skip = Some(SkipClass::Rcpt);
        }
        self.state = ClientState::RcptCalled;
        Ok(resp)
    }

    pub fn data_start(&mut self, macros: &[(&str, &str)]) -> Result<Response, MilterError> {
        self.require_state(&[ClientState::RcptCalled], "data")?;
        self.update_skip_on_command(None);
        self.emit_macros(MacroStage::Data, commands::CODE_DATA, macros)?;
        let resp = self.send_command(commands::CODE_DATA, &[], ProtocolMask::NO_DATA, ProtocolMask::NR_DATA)?;
        let resp = self.disallow_skip(resp)?;
        self.state = ClientState::DataCalled;
        Ok(resp)
    }

    pub fn header_field(&mut self, field: &HeaderField) -> Result<Response, MilterError> {
        self.require_state(
            &[ClientState::DataCalled, ClientState::HeaderFieldCalled],
            "header",
        )?;
        self.update_skip_on_command(Some(SkipClass::HeaderField));
        if self.skip == Some(SkipClass::HeaderField) {
            self.state = ClientState::HeaderFieldCalled;
            return Ok(Response::Continue);
        }
        let resp = self.send_command(
            commands::CODE_HEADER,
            &field.encode(),
            ProtocolMask::NO_HEADER,
            ProtocolMask::NO_HEADER_REPLY,
        )?;
        if resp == Response::Skip {
            self.skip = Some(SkipClass::HeaderField);
        }
        self.state = ClientState::HeaderFieldCalled;
        Ok(resp)
    }

    pub fn header_end(&mut self, macros: &[(&str, &str)]) -> Result<Response, MilterError> {
        self.require_state(
            &[ClientState::DataCalled, ClientState::HeaderFieldCalled],
            "end-of-headers",
        )?;
        self.update_skip_on_command(None);
        self.emit_macros(MacroStage::EndOfHeaders, commands::CODE_EOH, macros)?;
        let resp = self.send_command(
            commands::CODE_EOH,
            &[],
            ProtocolMask::NO_END_OF_HEADER,
            ProtocolMask::NR_END_OF_HEADER,
        )?;
        let resp = self.disallow_skip(resp)?;
        self.state = ClientState::HeaderEndCalled;
        Ok(resp)
    }

    pub fn body_chunk(&mut self, chunk: &[u8]) -> Result<Response, MilterError> {
        self.require_state(
            &[ClientState::HeaderEndCalled, ClientState::BodyChunkCalled],
            "body",
        )?;
        if chunk.len() > self.negotiated.max_data.bytes() {
            return Err(self.fail(
                InputError::ChunkTooLarge(chunk.len(), self.negotiated.max_data.bytes()).into(),
            ));
        }
        self.update_skip_on_command(Some(SkipClass::BodyChunk));
        if self.skip == Some(SkipClass::BodyChunk) {
            self.state = ClientState::BodyChunkCalled;
            return Ok(Response::Continue);
        }
        let resp = self.send_command(
            commands::CODE_BODY,
            chunk,
            ProtocolMask::NO_BODY,
            ProtocolMask::NR_BODY,
        )?;
        if resp == Response::Skip {
            self.skip = Some(SkipClass::BodyChunk);
        }
        self.state = ClientState::BodyChunkCalled;
        Ok(resp)
    }

    /// Streams `src` to the filter in chunks no larger than the
    /// negotiated maximum, stopping early on any non-`Continue` response,
    /// then always finishes with `end`.
    pub fn body_stream<R: Read>(&mut self, src: &mut R) -> Result<(Response, Vec<ModificationAction>), MilterError> {
        let chunk_size = self.negotiated.max_data.bytes();
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = src.read(&mut buf).map_err(|e| self.fail(WireError::from(e).into()))?;
            if n == 0 {
                break;
            }
            let resp = self.body_chunk(&buf[..n])?;
            if resp != Response::Continue && resp != Response::Skip {
                break;
            }
        }
        self.end()
    }

    /// Sends EOB and collects every modification frame up to the
    /// terminal action, returning both.
    pub fn end(&mut self) -> Result<(Response, Vec<ModificationAction>), MilterError> {
        self.require_state(
            &[ClientState::HeaderEndCalled, ClientState::BodyChunkCalled],
            "end-of-message",
        )?;
        self.update_skip_on_command(None);
        write_frame(&mut self.transport, commands::CODE_EOB, &[], Some(self.config.write_timeout))
            .map_err(|e| self.fail(e.into()))?;

        let mut mods = Vec::new();
        loop {
            let (code, payload) = read_frame(&mut self.transport, Some(self.config.read_timeout))
                .map_err(|e| self.fail(e.into()))?;
            if code == crate::response::ACT_PROGRESS {
                continue;
            }
            match ServerFrame::decode(code, &payload).map_err(|e| self.fail(e.into()))? {
                ServerFrame::Modification(m) => mods.push(m),
                ServerFrame::Action(resp) => {
                    self.state = ClientState::HeloCalled;
                    return Ok((resp, mods));
                }
            }
        }
    }

    pub fn unknown(&mut self, line: &str, macros: &[(&str, &str)]) -> Result<Response, MilterError> {
        self.update_skip_on_command(None);
        self.emit_macros(MacroStage::EndMarker, commands::CODE_UNKNOWN, macros)?;
        let mut payload = line.as_bytes().to_vec();
        payload.push(0);
        let resp = self.send_command(
            commands::CODE_UNKNOWN,
            &payload,
            ProtocolMask::NO_UNKNOWN,
            ProtocolMask::NR_UNKNOWN,
        )?;
        self.disallow_skip(resp)
    }

    pub fn abort(&mut self) -> Result<(), MilterError> {
        self.require_state(
            &[
                ClientState::HeloCalled,
                ClientState::MailCalled,
                ClientState::RcptCalled,
                ClientState::DataCalled,
                ClientState::HeaderFieldCalled,
                ClientState::HeaderEndCalled,
                ClientState::BodyChunkCalled,
            ],
            "abort",
        )?;
        self.update_skip_on_command(None);
        write_frame(&mut self.transport, commands::CODE_ABORT, &[], Some(self.config.write_timeout))
            .map_err(|e| self.fail(e.into()))?;
        self.state = ClientState::HeloCalled;
        Ok(())
    }

    /// Sends QUIT-NEW-CONN, returning the session to a state where a
    /// fresh `conn` can start over the same socket.
    pub fn reset(&mut self) -> Result<(), MilterError> {
        self.require_state(
            &[
                ClientState::Negotiated,
                ClientState::ConnectCalled,
                ClientState::HeloCalled,
                ClientState::MailCalled,
                ClientState::RcptCalled,
                ClientState::DataCalled,
                ClientState::HeaderFieldCalled,
                ClientState::HeaderEndCalled,
                ClientState::BodyChunkCalled,
            ],
            "reset",
        )?;
        self.update_skip_on_command(None);
        write_frame(&mut self.transport, commands::CODE_QUIT_NC, &[], Some(self.config.write_timeout))
            .map_err(|e| self.fail(e.into()))?;
        self.state = ClientState::Negotiated;
        Ok(())
    }

    pub fn quit(mut self) -> Result<(), MilterError> {
        write_frame(&mut self.transport, commands::CODE_QUIT, &[], Some(self.config.write_timeout))
            .map_err(|e| self.fail(e.into()))?;
        Ok(())
    }

    /// Idempotent: the first call force-closes the transport and returns
    /// `Ok(())`; every call after that returns `MilterError::Closed`.
    pub fn close(&mut self) -> Result<(), MilterError> {
        if self.closed {
            return Err(MilterError::Closed);
        }
        self.closed = true;
        self.transport.shutdown().map_err(MilterError::Io)
    }
}

fn state_name(state: ClientState) -> &'static str {
    match state {
        ClientState::Closed => "closed",
        ClientState::Negotiated => "negotiated",
        ClientState::ConnectCalled => "connect-called",
        ClientState::HeloCalled => "helo-called",
        ClientState::MailCalled => "mail-called",
        ClientState::RcptCalled => "rcpt-called",
        ClientState::DataCalled => "data-called",
        ClientState::HeaderFieldCalled => "header-field-called",
        ClientState::HeaderEndCalled => "header-end-called",
        ClientState::BodyChunkCalled => "body-chunk-called",
        ClientState::Error => "error",
    }
}
