//! End-to-end scenarios driven over real TCP loopback sockets: one thread
//! plays the MTA side with `ClientSession` (or, where the scenario needs
//! behavior no well-formed client would produce, raw frames), the other
//! runs `ServerSession::serve` against a small test `Filter`.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use smfi::client::{ClientConfig, ClientSession};
use smfi::commands;
use smfi::family::{ConnInfo, ProtocolFamily};
use smfi::negotiate::{client_validate_response, OptNeg};
use smfi::options::{ActionMask, MaxDataSize, ProtocolMask};
use smfi::response::{ModificationAction, Response};
use smfi::server::{Filter, Modifier, ServerConfig, ServerSession};
use smfi::wire::{read_frame, write_frame};

fn bind_loopback() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[derive(Default)]
struct RecordingFilter {
    calls: Arc<Mutex<Vec<String>>>,
    header_calls: Arc<Mutex<u32>>,
    header_response: Option<Response>,
}

impl Filter for RecordingFilter {
    fn connect(&mut self, _m: &mut Modifier<'_>, _info: &ConnInfo) -> Response {
        self.calls.lock().unwrap().push("connect".to_string());
        Response::Continue
    }
    fn helo(&mut self, _m: &mut Modifier<'_>, _hostname: &str) -> Response {
        self.calls.lock().unwrap().push("helo".to_string());
        Response::Continue
    }
    fn mail_from(&mut self, _m: &mut Modifier<'_>, _from: &str, _args: &[String]) -> Response {
        self.calls.lock().unwrap().push("mail".to_string());
        Response::Continue
    }
    fn rcpt_to(&mut self, _m: &mut Modifier<'_>, _to: &str, _args: &[String]) -> Response {
        self.calls.lock().unwrap().push("rcpt".to_string());
        Response::Continue
    }
    fn data(&mut self, _m: &mut Modifier<'_>) -> Response {
        self.calls.lock().unwrap().push("data".to_string());
        Response::Continue
    }
    fn header(&mut self, _m: &mut Modifier<'_>, _name: &str, _value: &str) -> Response {
        *self.header_calls.lock().unwrap() += 1;
        self.calls.lock().unwrap().push("header".to_string());
        self.header_response.clone().unwrap_or(Response::Continue)
    }
    fn headers(&mut self, _m: &mut Modifier<'_>) -> Response {
        self.calls.lock().unwrap().push("headers".to_string());
        Response::Continue
    }
    fn body_chunk(&mut self, _m: &mut Modifier<'_>, _chunk: &[u8]) -> Response {
        self.calls.lock().unwrap().push("body".to_string());
        Response::Continue
    }
    fn end_of_message(&mut self, _m: &mut Modifier<'_>) -> Option<Response> {
        self.calls.lock().unwrap().push("eom".to_string());
        None
    }
    fn abort(&mut self, _m: &mut Modifier<'_>) {
        self.calls.lock().unwrap().push("abort".to_string());
    }
}

fn conn_info() -> ConnInfo {
    ConnInfo {
        hostname: "h".to_string(),
        family: ProtocolFamily::Tcp4,
        port: 25,
        address: "127.0.0.1".to_string(),
    }
}

/// Scenario 1: negotiate + minimal accept, every intermediate action
/// Continue, End returns a bare Accept with no modifications.
#[test]
fn negotiate_and_minimal_message_is_accepted() {
    let (listener, addr) = bind_loopback();
    let server_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let config = ServerConfig {
            filter_actions: ActionMask::ADD_HEADER,
            filter_protocol: ProtocolMask::empty(),
            ..ServerConfig::default()
        };
        let mut session = ServerSession::new(stream, config).unwrap();
        let mut filter = RecordingFilter::default();
        session.serve(&mut filter).unwrap();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let config = ClientConfig {
        requested_version: 6,
        requested_actions: ActionMask::ADD_HEADER,
        requested_protocol: ProtocolMask::empty(),
        max_data: MaxDataSize::Size64K,
        ..ClientConfig::default()
    };
    let mut client = ClientSession::connect(stream, config).unwrap();
    assert_eq!(client.negotiated().actions, ActionMask::ADD_HEADER);

    assert_eq!(client.conn(&conn_info(), &[]).unwrap(), Response::Continue);
    assert_eq!(client.helo("h", &[]).unwrap(), Response::Continue);
    assert_eq!(client.mail("a@x", &[], &[]).unwrap(), Response::Continue);
    assert_eq!(client.rcpt("b@y", &[], &[]).unwrap(), Response::Continue);
    assert_eq!(client.data_start(&[]).unwrap(), Response::Continue);
    let field = commands::HeaderField {
        name: "From".to_string(),
        value: "<a@x>".to_string(),
    };
    assert_eq!(client.header_field(&field).unwrap(), Response::Continue);
    assert_eq!(client.header_end(&[]).unwrap(), Response::Continue);
    assert_eq!(client.body_chunk(b"hi\r\n").unwrap(), Response::Continue);

    let (resp, mods) = client.end().unwrap();
    assert_eq!(resp, Response::Accept);
    assert!(mods.is_empty());

    // A fresh Mail is legal again, confirming `end` returned the state
    // machine to HeloCalled.
    assert_eq!(client.mail("a@x", &[], &[]).unwrap(), Response::Continue);

    client.quit().unwrap();
    server_thread.join().unwrap();
}

/// Scenario 2: a Skip on the first header accelerates past the next two
/// header calls without putting a HEADER frame on the wire; HeaderEnd
/// still makes it through.
#[test]
fn skip_accelerates_past_subsequent_header_calls() {
    let (listener, addr) = bind_loopback();
    let header_calls = Arc::new(Mutex::new(0u32));
    let header_calls_server = Arc::clone(&header_calls);

    let server_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let config = ServerConfig {
            filter_protocol: ProtocolMask::SKIP,
            ..ServerConfig::default()
        };
        let mut session = ServerSession::new(stream, config).unwrap();
        let mut filter = RecordingFilter {
            header_calls: header_calls_server,
            header_response: Some(Response::Skip),
            ..RecordingFilter::default()
        };
        session.serve(&mut filter).unwrap();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let config = ClientConfig {
        requested_protocol: ProtocolMask::SKIP,
        ..ClientConfig::default()
    };
    let mut client = ClientSession::connect(stream, config).unwrap();

    client.conn(&conn_info(), &[]).unwrap();
    client.helo("h", &[]).unwrap();
    client.mail("a@x", &[], &[]).unwrap();
    client.rcpt("b@y", &[], &[]).unwrap();
    client.data_start(&[]).unwrap();

    let first = commands::HeaderField {
        name: "From".to_string(),
        value: "<a@x>".to_string(),
    };
    let resp = client.header_field(&first).unwrap();
    assert_eq!(resp, Response::Skip);

    let second = commands::HeaderField {
        name: "To".to_string(),
        value: "<b@y>".to_string(),
    };
    assert_eq!(client.header_field(&second).unwrap(), Response::Continue);
    let third = commands::HeaderField {
        name: "Subject".to_string(),
        value: "hi".to_string(),
    };
    assert_eq!(client.header_field(&third).unwrap(), Response::Continue);

    assert_eq!(client.header_end(&[]).unwrap(), Response::Continue);

    let (resp, _) = client.body_stream(&mut std::io::Cursor::new(b"body\r\n".to_vec())).unwrap();
    assert_eq!(resp, Response::Accept);

    client.quit().unwrap();
    server_thread.join().unwrap();

    assert_eq!(*header_calls.lock().unwrap(), 1, "only the first HeaderField should have reached the filter");
}

/// Scenario 3: a multi-line RejectWithCode formats and round-trips exactly
/// per the libmilter continuation-line convention.
#[test]
fn reject_with_code_formats_multiline_reply_over_the_wire() {
    let (listener, addr) = bind_loopback();

    struct RejectFilter;
    impl Filter for RejectFilter {
        fn end_of_message(&mut self, _m: &mut Modifier<'_>) -> Option<Response> {
            Some(Response::reject_with_code(550, "go away\r\nreally!").unwrap())
        }
    }

    let server_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = ServerSession::new(stream, ServerConfig::default()).unwrap();
        session.serve(&mut RejectFilter).unwrap();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let mut client = ClientSession::connect(stream, ClientConfig::default()).unwrap();
    client.conn(&conn_info(), &[]).unwrap();
    client.helo("h", &[]).unwrap();
    client.mail("a@x", &[], &[]).unwrap();
    client.rcpt("b@y", &[], &[]).unwrap();
    client.data_start(&[]).unwrap();
    client.header_end(&[]).unwrap();

    let (resp, _) = client.end().unwrap();
    match resp {
        Response::RejectWithCode { code, text } => {
            assert_eq!(code, 550);
            assert_eq!(text, "550-go away\r\n550 really!");
        }
        other => panic!("expected RejectWithCode, got {other:?}"),
    }

    client.quit().unwrap();
    server_thread.join().unwrap();
}

/// Scenario 4: a ChangeHeader modification with index=0 is normalized to
/// index=1 on the wire.
#[test]
fn change_header_index_zero_normalizes_to_one_over_the_wire() {
    let (listener, addr) = bind_loopback();

    struct ChangeHeaderFilter;
    impl Filter for ChangeHeaderFilter {
        fn end_of_message(&mut self, m: &mut Modifier<'_>) -> Option<Response> {
            m.change_header(0, "Subject", "X").unwrap();
            Some(Response::Accept)
        }
    }

    let server_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let config = ServerConfig {
            filter_actions: ActionMask::CHANGE_HEADER,
            ..ServerConfig::default()
        };
        let mut session = ServerSession::new(stream, config).unwrap();
        session.serve(&mut ChangeHeaderFilter).unwrap();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let config = ClientConfig {
        requested_actions: ActionMask::CHANGE_HEADER,
        ..ClientConfig::default()
    };
    let mut client = ClientSession::connect(stream, config).unwrap();
    client.conn(&conn_info(), &[]).unwrap();
    client.helo("h", &[]).unwrap();
    client.mail("a@x", &[], &[]).unwrap();
    client.rcpt("b@y", &[], &[]).unwrap();
    client.data_start(&[]).unwrap();
    client.header_end(&[]).unwrap();

    let (resp, mods) = client.end().unwrap();
    assert_eq!(resp, Response::Accept);
    assert_eq!(
        mods,
        vec![ModificationAction::ChangeHeader {
            index: 1,
            name: "Subject".to_string(),
            value: "X".to_string(),
        }]
    );

    client.quit().unwrap();
    server_thread.join().unwrap();
}

/// Scenario 5: an MTA that sends Mail again after Rcpt without an explicit
/// Abort gets a synthesized Abort delivered to the filter first, and the
/// Rcpt-and-above macros cleared before Mail runs.
#[test]
fn server_synthesizes_abort_on_implicit_restart() {
    let (listener, addr) = bind_loopback();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let calls_server = Arc::clone(&calls);

    let server_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = ServerSession::new(stream, ServerConfig::default()).unwrap();
        let mut filter = RecordingFilter {
            calls: calls_server,
            ..RecordingFilter::default()
        };
        session.serve(&mut filter).unwrap();
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    let timeout = Some(Duration::from_secs(5));

    let request = OptNeg {
        version: 6,
        actions: ActionMask::all(),
        protocol: ProtocolMask::empty(),
    };
    write_frame(&mut stream, commands::CODE_OPTNEG, &request.encode(), timeout).unwrap();
    let (code, payload) = read_frame(&mut stream, timeout).unwrap();
    assert_eq!(code, commands::CODE_OPTNEG);
    let _ = OptNeg::decode(&payload).unwrap();

    let conn = conn_info().encode();
    write_frame(&mut stream, commands::CODE_CONN, &conn, timeout).unwrap();
    read_frame(&mut stream, timeout).unwrap();

    let mut helo = b"h".to_vec();
    helo.push(0);
    write_frame(&mut stream, commands::CODE_HELO, &helo, timeout).unwrap();
    read_frame(&mut stream, timeout).unwrap();

    let mail = commands::Mail {
        from: "<a@x>".to_string(),
        args: vec![],
    };
    write_frame(&mut stream, commands::CODE_MAIL, &mail.encode(), timeout).unwrap();
    read_frame(&mut stream, timeout).unwrap();

    let rcpt = commands::Rcpt {
        to: "<b@y>".to_string(),
        args: vec![],
    };
    write_frame(&mut stream, commands::CODE_RCPT, &rcpt.encode(), timeout).unwrap();
    read_frame(&mut stream, timeout).unwrap();

    // No ABORT here: a second MAIL is an implicit restart.
    let mail2 = commands::Mail {
        from: "<c@z>".to_string(),
        args: vec![],
    };
    write_frame(&mut stream, commands::CODE_MAIL, &mail2.encode(), timeout).unwrap();
    read_frame(&mut stream, timeout).unwrap();

    write_frame(&mut stream, commands::CODE_QUIT, &[], timeout).unwrap();
    server_thread.join().unwrap();

    let seen = calls.lock().unwrap().clone();
    let first_abort = seen.iter().position(|c| c == "abort");
    let second_mail = seen.iter().rposition(|c| c == "mail");
    assert_eq!(seen.iter().filter(|c| *c == "mail").count(), 2);
    assert!(first_abort.is_some(), "expected a synthesized abort, saw {seen:?}");
    assert!(first_abort.unwrap() < second_mail.unwrap(), "abort must precede the second mail, saw {seen:?}");
}

/// Scenario 6: a server that replies with protocol bits the client never
/// requested fails negotiation at the client; `connect` never reaches
/// anything past OPTNEG.
#[test]
fn negotiation_protocol_mismatch_is_rejected_by_client() {
    let (listener, addr) = bind_loopback();

    let server_thread = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let timeout = Some(Duration::from_secs(5));
        let (code, _payload) = read_frame(&mut stream, timeout).unwrap();
        assert_eq!(code, commands::CODE_OPTNEG);

        // Offers NoMailFrom, a bit the client never asked for, instead of
        // the NoEndOfHeader bit it demanded.
        let response = OptNeg {
            version: 6,
            actions: ActionMask::empty(),
            protocol: ProtocolMask::NO_MAIL,
        };
        write_frame(&mut stream, commands::CODE_OPTNEG, &response.encode(), timeout).unwrap();
    });

    let stream = TcpStream::connect(addr).unwrap();
    let config = ClientConfig {
        requested_protocol: ProtocolMask::NO_END_OF_HEADER,
        ..ClientConfig::default()
    };
    let err = ClientSession::connect(stream, config).unwrap_err();
    assert!(matches!(err, smfi::MilterError::Negotiation(_)));

    server_thread.join().unwrap();
}

#[test]
fn client_validate_response_rejects_protocol_not_subset_of_request() {
    let requested = OptNeg {
        version: 6,
        actions: ActionMask::empty(),
        protocol: ProtocolMask::NO_END_OF_HEADER,
    };
    let response = OptNeg {
        version: 6,
        actions: ActionMask::empty(),
        protocol: ProtocolMask::NO_MAIL,
    };
    assert!(client_validate_response(&requested, &response).is_err());
}
