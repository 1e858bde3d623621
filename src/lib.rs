//! smfi
//! ====
//!
//! **smfi** implements both peers of the sendmail/postfix milter wire
//! protocol in pure, safe Rust: the MTA-facing `ClientSession`, embeddable
//! in a mail transfer agent, and the `ServerSession`/`Filter` pair used to
//! write a filter that an MTA connects to.
//!
//! Features
//! --------
//!
//! - Drive or implement the full milter wire protocol over TCP or Unix
//!   domain sockets, with no dependency on libmilter.
//! - Feature negotiation (`OPTNEG`) with version compatibility down to
//!   protocol version 2.
//! - Macro subscription and lookup, end-of-message modification actions,
//!   skip acceleration, and the synthesized-ABORT implicit-restart rule.
//!
//! Usage
//! -----
//!
//! This crate is [on crates.io](https://crates.io/crates/smfi) and can be
//! used by adding `smfi` to your dependencies in your project's
//! `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! smfi = "0.1"
//! ```
//!
//! Example
//! -------
//!
//! ```
//! use smfi::{Filter, Modifier, Response};
//!
//! struct MyFilter;
//!
//! impl Filter for MyFilter {
//!     fn header(&mut self, _m: &mut Modifier<'_>, name: &str, value: &str) -> Response {
//!         println!("name: {}, value: {}", name, value);
//!         Response::Continue
//!     }
//! }
//!
//! fn main() {
//!     // let mut filter = MyFilter;
//!     // let server = smfi::listener::Server::new(|| MyFilter, Default::default());
//!     // server.serve_tcp("127.0.0.1:31337").expect("failed to run milter server");
//! }
//! ```
//!
//! Status
//! ------
//!
//! Both the client and server roles are implemented: connecting to an MTA
//! as an embedded filter driver, and accepting MTA connections as a
//! filter server with full end-of-message modification support.

pub mod client;
pub mod commands;
pub mod error;
pub mod family;
pub mod listener;
pub mod macro_store;
pub mod negotiate;
pub mod options;
pub mod reply;
pub mod response;
pub mod server;
pub mod transport;
pub mod wire;

pub use client::{ClientConfig, ClientSession, ClientState};
pub use error::MilterError;
pub use family::{ConnInfo, ProtocolFamily};
pub use listener::Server;
pub use negotiate::Negotiated;
pub use options::{ActionMask, MacroStage, MaxDataSize, ProtocolMask};
pub use response::{ModificationAction, Response};
pub use server::{Filter, Modifier, ServerConfig, ServerSession};
pub use transport::Transport;
