// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Listening sockets on top of the reactor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use weft::{Engine, Future, FutureState, Generator, Step, defer};

use crate::error::{Error, sys as sys_error};
use crate::reactor::{EventSink, Reactor, Ticket};
use crate::resource::Resource;
use crate::sys;

/// Process-wide networking startup/teardown pair, scoped to the engine
/// lifetime. Required on Windows (`WSAStartup`/`WSACleanup`); a no-op
/// elsewhere, kept for uniform call sites.
pub struct NetStartup(());

// === impl NetStartup ===

impl NetStartup {
    pub fn new() -> Result<Self, Error> {
        #[cfg(windows)]
        sys::wsa_startup()?;
        Ok(Self(()))
    }
}

impl Drop for NetStartup {
    fn drop(&mut self) {
        #[cfg(windows)]
        sys::wsa_cleanup();
    }
}

/// Decision of the error handler: whether the listener should stop.
pub type ShouldStop = bool;

/// Events the reactor (or a shutdown request) posts at the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenEvent {
    Accept,
    Error(i32),
    Close,
}

/// A listening socket. Constructed by [`net_listen`]; accepting starts when
/// the future returned by [`listen`](Listener::listen) is executed, and runs
/// until [`shutdown`](Listener::shutdown).
#[derive(Clone)]
pub struct Listener {
    shared: Arc<ListenerShared>,
}

struct ListenerShared {
    reactor: Reactor,
    sock: sys::RawHandle,
    addr: SocketAddr,
    engif: Future<ListenEvent>,
    token: Mutex<Option<usize>>,
    /// Set by [`Listener::shutdown`]; survives even when the Close event
    /// loses the race against an unconsumed accept event.
    closing: AtomicBool,
    closed: AtomicBool,
    _ticket: Ticket,
    #[cfg(windows)]
    windows: sys::ListenerState,
}

/// Creates a non-blocking listening socket for `addr`.
///
/// `stype`/`proto` are the raw socket type and protocol (e.g. `SOCK_STREAM`
/// and 0); the domain follows from the address family.
pub fn net_listen(
    reactor: &Reactor,
    addr: SocketAddr,
    stype: i32,
    proto: i32,
) -> Result<Listener, Error> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            let sock = sys::socket(&addr, stype, proto)?;
        } else {
            let windows = sys::ListenerState::new();
            let sock = sys::socket(&addr, stype, proto, &windows)?;
        }
    }
    Ok(Listener {
        shared: Arc::new(ListenerShared {
            reactor: reactor.clone(),
            sock,
            addr,
            engif: Future::external(),
            token: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            _ticket: reactor.ticket(),
            #[cfg(windows)]
            windows,
        }),
    })
}

// === impl Listener ===

impl Listener {
    /// Binds, starts listening, and returns the accept-loop future.
    ///
    /// The future is deferred; execute it to start accepting. It completes
    /// when the listener [`shutdown`](Listener::shutdown)s, or when
    /// `on_error` answers `true` to a reported error. Each accepted
    /// connection is handed to `on_accept` as an adopted [`Resource`].
    pub fn listen(
        &self,
        on_error: impl FnMut(i32, &str) -> ShouldStop + Send + 'static,
        on_accept: impl FnMut(Option<SocketAddr>, Resource) + Send + 'static,
    ) -> Result<Future<Result<(), Error>>, Error> {
        sys::bind_listen(self.shared.sock, &self.shared.addr, 200)?;
        tracing::debug!(addr = %self.shared.addr, "listening");
        Ok(defer(AcceptGenerator {
            shared: Arc::clone(&self.shared),
            on_error: Box::new(on_error),
            on_accept: Box::new(on_accept),
            finished: false,
        }))
    }

    /// The actual local address, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        sys::local_addr(self.shared.sock)
    }

    /// Initiates the shutdown sequence: no new connections are accepted
    /// from this point on, and the listen future completes.
    pub fn shutdown(&self) {
        tracing::debug!(addr = %self.shared.addr, "listener shutdown requested");
        self.shared.closing.store(true, Ordering::Release);
        self.shared.post(ListenEvent::Close);
    }
}

impl ListenerShared {
    fn post(&self, event: ListenEvent) {
        if self.engif.try_complete(event) {
            self.reactor.engine().notify(&self.engif.any());
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(token) = *self.token.lock() {
            #[cfg(unix)]
            self.reactor.poller().deregister(self.sock);
            self.reactor.remove_sink(token);
        }
        sys::close_handle(self.sock);
        tracing::debug!(addr = %self.addr, "listener closed");
    }
}

impl Drop for ListenerShared {
    fn drop(&mut self) {
        self.close();
    }
}

impl EventSink for ListenerShared {
    fn deliver(&self, completion: sys::Completion) {
        let Some(event) = sys::listen_event(completion, self.sock) else {
            return;
        };
        self.post(event);
    }
}

struct AcceptGenerator {
    shared: Arc<ListenerShared>,
    on_error: Box<dyn FnMut(i32, &str) -> ShouldStop + Send>,
    on_accept: Box<dyn FnMut(Option<SocketAddr>, Resource) + Send>,
    finished: bool,
}

impl AcceptGenerator {
    fn stop(&mut self, result: Result<(), Error>) -> Step<Result<(), Error>> {
        self.finished = true;
        self.shared.close();
        Step::Produced(result)
    }

    fn hand_over(&mut self, handle: sys::RawHandle, peer: Option<SocketAddr>) {
        match self.shared.reactor.take(handle) {
            Ok(resource) => {
                tracing::trace!(?peer, "accepted connection");
                (self.on_accept)(peer, resource);
            }
            Err(err) => {
                tracing::debug!(%err, "dropping connection the reactor refused");
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl AcceptGenerator {
            /// Drains `accept` until it would block. Returns `true` if the
            /// error handler requested a stop.
            fn drain(&mut self) -> bool {
                loop {
                    match sys::accept_once(self.shared.sock) {
                        sys::Accepted::Connection(handle, peer) => {
                            self.hand_over(handle, peer);
                        }
                        sys::Accepted::Retry => {}
                        sys::Accepted::WouldBlock => return false,
                        sys::Accepted::Failed(code) => {
                            if (self.on_error)(code, "accept failed") {
                                return true;
                            }
                            return false;
                        }
                    }
                }
            }
        }
    } else {
        impl AcceptGenerator {
            /// Harvests the one connection the completed `AcceptEx`
            /// produced; the next one is armed by `arm`.
            fn drain(&mut self) -> bool {
                if let Some((handle, peer)) =
                    sys::take_accepted(&self.shared.windows, self.shared.sock)
                {
                    self.hand_over(handle, peer);
                }
                false
            }
        }
    }
}

impl Generator<Result<(), Error>> for AcceptGenerator {
    fn done(&self) -> bool {
        self.finished
    }

    fn resume(&mut self, _engine: &Engine) -> Step<Result<(), Error>> {
        debug_assert!(!self.finished, "accept loop resumed after completion");

        if self.shared.closing.load(Ordering::Acquire) {
            return self.stop(Ok(()));
        }

        if self.shared.engif.state() == FutureState::Completed {
            let event = self
                .shared
                .engif
                .result()
                .expect("listen interrupt completed without an event");
            self.shared.engif.rearm();
            match event {
                ListenEvent::Close => return self.stop(Ok(())),
                ListenEvent::Error(code) => {
                    if (self.on_error)(code, "async accept error") {
                        return self.stop(Ok(()));
                    }
                }
                ListenEvent::Accept => {
                    if self.drain() {
                        return self.stop(Ok(()));
                    }
                }
            }
        }

        match self.arm() {
            Ok(()) => Step::Awaiting(self.shared.engif.any()),
            Err(err) => {
                tracing::debug!(%err, "listener could not re-arm");
                self.stop(Err(err))
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl AcceptGenerator {
            fn arm(&self) -> Result<(), Error> {
                let mut token = self.shared.token.lock();
                if let Some(token) = *token {
                    return self
                        .shared
                        .reactor
                        .poller()
                        .rearm(self.shared.sock, token, sys::Interest::Read)
                        .map_err(|code| sys_error("re-arm listener with reactor", code));
                }
                let sink = Arc::downgrade(&self.shared) as Weak<dyn EventSink>;
                let slot = self.shared.reactor.add_sink(sink);
                match self
                    .shared
                    .reactor
                    .poller()
                    .register(self.shared.sock, slot, sys::Interest::Read)
                {
                    Ok(()) => {
                        *token = Some(slot);
                        Ok(())
                    }
                    Err(code) => {
                        self.shared.reactor.remove_sink(slot);
                        Err(sys_error("register listener with reactor", code))
                    }
                }
            }
        }
    } else {
        impl AcceptGenerator {
            fn arm(&self) -> Result<(), Error> {
                let mut token = self.shared.token.lock();
                if token.is_none() {
                    let sink = Arc::downgrade(&self.shared) as Weak<dyn EventSink>;
                    let slot = self.shared.reactor.add_sink(sink);
                    sys::associate_listener(
                        &self.shared.reactor,
                        self.shared.sock,
                        slot,
                        &self.shared.windows,
                    )?;
                    *token = Some(slot);
                }
                sys::start_accept(&self.shared.windows, self.shared.sock)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Write as _;
    use std::net::TcpStream;

    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;
    use weft::combinator::await_blocking;

    use super::*;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default()
    }

    #[test]
    fn listener_shutdown_completes_the_listen_future() {
        let _trace = trace();
        let _net = NetStartup::new().unwrap();
        let engine = Engine::new(2);
        let reactor = Reactor::new(&engine).unwrap();

        let listener = net_listen(
            &reactor,
            "127.0.0.1:0".parse().unwrap(),
            libc::SOCK_STREAM,
            0,
        )
        .unwrap();
        let serving = listener
            .listen(|_, _| true, |_, _| panic!("no connection expected"))
            .unwrap();
        let serving = engine.execute(serving);

        std::thread::sleep(std::time::Duration::from_millis(20));
        listener.shutdown();
        assert_eq!(await_blocking(&engine, &serving), Ok(()));

        drop(listener);
        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn accepted_connection_round_trips() {
        let _trace = trace();
        let _net = NetStartup::new().unwrap();
        let engine = Engine::new(2);
        let reactor = Reactor::new(&engine).unwrap();

        let listener = net_listen(
            &reactor,
            "127.0.0.1:0".parse().unwrap(),
            libc::SOCK_STREAM,
            0,
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let serving = listener
            .listen(
                |_, _| true,
                move |peer, resource| {
                    let _ = tx.send((peer, resource));
                },
            )
            .unwrap();
        let serving = engine.execute(serving);
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();

        let (peer, resource) = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(peer.is_some());
        let read = resource.read(4);
        assert_eq!(await_blocking(&engine, &read), Ok(b"ping".to_vec()));

        listener.shutdown();
        assert_eq!(await_blocking(&engine, &serving), Ok(()));

        drop((read, resource, client, listener));
        reactor.shutdown();
        engine.shutdown();
    }
}
