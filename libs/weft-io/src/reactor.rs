// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use slab::Slab;
use weft::Engine;

use crate::error::Error;
use crate::sys;

/// Something the reactor can deliver a platform event to: a resource or a
/// listener. Implementations complete their engine-interrupt future and call
/// [`Engine::notify`]; they never run user generators on the reactor thread.
pub(crate) trait EventSink: Send + Sync {
    fn deliver(&self, event: sys::Completion);
}

/// The platform event loop.
///
/// One thread owns the platform completion object (an epoll instance on
/// Unix, an I/O completion port on Windows) and routes each event to the
/// resource registered under its token. The handle is cheap to clone.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

struct Shared {
    engine: Engine,
    poller: sys::Poller,
    /// token -> resource. Weak: the reactor must not keep dead resources
    /// alive, a dropped resource's late events are simply discarded.
    sinks: Mutex<Slab<Weak<dyn EventSink>>>,
    /// Outstanding resource count; see [`Ticket`].
    outstanding: Mutex<usize>,
    idle: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// === impl Reactor ===

impl Reactor {
    /// Starts the reactor thread for `engine`.
    pub fn new(engine: &Engine) -> Result<Self, Error> {
        let reactor = Self {
            shared: Arc::new(Shared {
                engine: engine.clone(),
                poller: sys::Poller::new()?,
                sinks: Mutex::new(Slab::new()),
                outstanding: Mutex::new(0),
                idle: Condvar::new(),
                thread: Mutex::new(None),
            }),
        };

        let shared = Arc::clone(&reactor.shared);
        let handle = thread::Builder::new()
            .name("weft-reactor".into())
            .spawn(move || Self::run(&shared))
            .expect("failed to spawn reactor thread");
        *reactor.shared.thread.lock() = Some(handle);

        tracing::debug!("reactor started");
        Ok(reactor)
    }

    fn run(shared: &Shared) {
        let _span = tracing::debug_span!("reactor main loop").entered();
        let mut events = Vec::new();

        loop {
            if let Err(err) = shared.poller.wait(&mut events) {
                tracing::debug!(%err, "poller failed, shutting down");
                return;
            }
            for &(token, completion) in &events {
                if token == sys::STOP_TOKEN {
                    tracing::debug!("stop signal received, shutting down");
                    return;
                }
                let sink = shared
                    .sinks
                    .lock()
                    .get(token)
                    .and_then(Weak::upgrade);
                match sink {
                    Some(sink) => {
                        tracing::trace!(token, ?completion, "delivering event");
                        sink.deliver(completion);
                    }
                    None => tracing::trace!(token, "event for a dropped resource"),
                }
            }
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.shared.engine
    }

    /// Signals the reactor thread and joins it. Safe to call once; further
    /// calls are no-ops.
    pub fn shutdown(&self) {
        self.shared.poller.stop();
        if let Some(handle) = self.shared.thread.lock().take() {
            handle.join().expect("reactor thread panicked");
        }
        tracing::debug!("reactor shut down");
    }

    /// Blocks until no resource is outstanding: the reactor's own quiescence
    /// condition, observable independently from the scheduler's.
    pub fn wait_idle(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.idle.wait(&mut outstanding);
        }
    }

    pub(crate) fn poller(&self) -> &sys::Poller {
        &self.shared.poller
    }

    pub(crate) fn add_sink(&self, sink: Weak<dyn EventSink>) -> usize {
        self.shared.sinks.lock().insert(sink)
    }

    pub(crate) fn remove_sink(&self, token: usize) {
        self.shared.sinks.lock().try_remove(token);
    }

    /// Takes out a ticket counting one outstanding resource.
    pub(crate) fn ticket(&self) -> Ticket {
        *self.shared.outstanding.lock() += 1;
        Ticket {
            reactor: self.clone(),
        }
    }
}

/// RAII count of one outstanding resource on the reactor.
pub(crate) struct Ticket {
    reactor: Reactor,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut outstanding = self.reactor.shared.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.reactor.shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_gate_reactor_quiescence() {
        let engine = Engine::new(1);
        let reactor = Reactor::new(&engine).unwrap();

        let ticket = reactor.ticket();
        let waiter = {
            let reactor = reactor.clone();
            thread::spawn(move || reactor.wait_idle())
        };
        thread::sleep(std::time::Duration::from_millis(10));
        assert!(!waiter.is_finished());
        drop(ticket);
        waiter.join().unwrap();

        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let engine = Engine::new(1);
        let reactor = Reactor::new(&engine).unwrap();
        reactor.shutdown();
        reactor.shutdown();
        engine.shutdown();
    }
}
