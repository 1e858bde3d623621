//! The accept loop: binds a socket, spawns one thread per connection
//! running a fresh `Filter` instance through `ServerSession::serve`, and
//! offers graceful (`shutdown`) and immediate (`close`) teardown.
//! Grounded on the teacher's `Milter::run` (`TcpListener::incoming`
//! loop), extended with a Unix-socket listener and a session registry so
//! `shutdown` can wait for in-flight connections to drain.

use std::collections::HashMap;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::MilterError;
use crate::server::{Filter, ServerConfig, ServerSession};
use crate::transport::Transport;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

type CloseFn = Box<dyn Fn() -> std::io::Result<()> + Send>;

/// A filter factory plus the listener bookkeeping. `NF` builds a fresh
/// `FI` for every accepted connection, since a `Filter` is meant to carry
/// per-session state, not be shared across connections.
pub struct Server<NF, FI>
where
    NF: Fn() -> FI + Send + Sync + 'static,
    FI: Filter + Send + 'static,
{
    factory: Arc<NF>,
    config: ServerConfig,
    sessions: Arc<Mutex<HashMap<u64, CloseFn>>>,
    shutting_down: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    _filter: std::marker::PhantomData<fn() -> FI>,
}

impl<NF, FI> Server<NF, FI>
where
    NF: Fn() -> FI + Send + Sync + 'static,
    FI: Filter + Send + 'static,
{
    pub fn new(factory: NF, config: ServerConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            _filter: std::marker::PhantomData,
        }
    }

    pub fn serve_tcp<A: ToSocketAddrs>(&self, addr: A) -> Result<(), MilterError> {
        let listener = TcpListener::bind(addr).map_err(MilterError::Io)?;
        listener.set_nonblocking(true).map_err(MilterError::Io)?;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, _)) => self.spawn_session(stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(MilterError::Io(e)),
            }
        }
    }

    #[cfg(unix)]
    pub fn serve_unix<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), MilterError> {
        use std::os::unix::net::UnixListener;

        let listener = UnixListener::bind(path).map_err(MilterError::Io)?;
        listener.set_nonblocking(true).map_err(MilterError::Io)?;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, _)) => self.spawn_session(stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(MilterError::Io(e)),
            }
        }
    }

    fn spawn_session<T: Transport + 'static>(&self, transport: T) {
        let id = next_session_id();
        if let Ok(close_handle) = transport.try_clone() {
            let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");
            sessions.insert(id, Box::new(move || close_handle.shutdown()));
        }

        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let sessions = Arc::clone(&self.sessions);

        thread::spawn(move || {
            let mut filter = factory();
            match ServerSession::new(transport, config) {
                Ok(mut session) => {
                    if let Err(e) = session.serve(&mut filter) {
                        log::warn!("milter session {id} ended with an error: {e}");
                    }
                }
                Err(e) => log::warn!("failed to set up milter session {id}: {e}"),
            }
            sessions.lock().expect("session registry mutex poisoned").remove(&id);
        });
    }

    /// Force-closes every tracked session immediately and marks the
    /// server closed. Idempotent: only the first call does anything;
    /// later calls return `MilterError::Closed`.
    pub fn close(&self) -> Result<(), MilterError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(MilterError::Closed);
        }
        self.shutting_down.store(true, Ordering::Release);
        self.force_close_all();
        Ok(())
    }

    /// Stops accepting new connections immediately, then waits up to
    /// `deadline` for in-flight sessions to finish on their own before
    /// force-closing whatever remains. Idempotent like `close`.
    pub fn shutdown(&self, deadline: Duration) -> Result<(), MilterError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(MilterError::Closed);
        }
        self.shutting_down.store(true, Ordering::Release);

        let start = Instant::now();
        while start.elapsed() < deadline {
            if self.sessions.lock().expect("session registry mutex poisoned").is_empty() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
        self.force_close_all();
        Ok(())
    }

    fn force_close_all(&self) {
        let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");
        for (id, close) in sessions.drain() {
            if let Err(e) = close() {
                log::warn!("error force-closing milter session {id}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Filter;

    struct NoopFilter;
    impl Filter for NoopFilter {}

    #[test]
    fn close_is_idempotent() {
        let server = Server::new(|| NoopFilter, ServerConfig::default());
        assert!(server.close().is_ok());
        assert!(matches!(server.close(), Err(MilterError::Closed)));
    }

    #[test]
    fn shutdown_after_close_returns_closed_sentinel() {
        let server = Server::new(|| NoopFilter, ServerConfig::default());
        assert!(server.shutdown(Duration::from_millis(10)).is_ok());
        assert!(matches!(server.shutdown(Duration::from_millis(10)), Err(MilterError::Closed)));
    }
}
