// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use weft::{Future, FutureState, Generator, defer};

use crate::error::{Error, ReadResult, WriteResult, sys as sys_error};
use crate::reactor::{EventSink, Reactor, Ticket};
use crate::sys;

/// An asynchronous resource: a file, pipe or socket driven through the
/// reactor.
///
/// Each primitive operation is a generator that consumes a pending
/// completion, attempts the transfer without blocking, and arms the reactor
/// when the attempt would block. At most one operation per resource may be
/// in flight at a time; the engine-interrupt future the resource carries is
/// shared across operations and re-armed by each.
///
/// The handle is cheap to clone; dropping the last clone closes the
/// underlying OS handle and releases the reactor ticket.
#[derive(Clone)]
pub struct Resource {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    reactor: Reactor,
    pub(crate) handle: sys::RawHandle,
    /// The engine-interrupt future: the resource is its unique producer, the
    /// reactor (or a cancellation) its unique completer.
    engif: Future<sys::Completion>,
    token: Mutex<Option<usize>>,
    /// Prefetched bytes for the buffered surface.
    pub(crate) prefetch: Mutex<Vec<u8>>,
    _ticket: Ticket,
    #[cfg(windows)]
    pub(crate) windows: sys::WindowsState,
}

// === impl Reactor: resource acquisition ===

impl Reactor {
    /// Opens `path` for asynchronous reading.
    pub fn file_open_read(&self, path: impl AsRef<Path>) -> Result<Resource, Error> {
        let handle = sys::open_read(path.as_ref())?;
        Ok(Resource::adopt(self, handle))
    }

    /// Opens `path` for asynchronous writing, creating it if necessary.
    pub fn file_open_write(&self, path: impl AsRef<Path>) -> Result<Resource, Error> {
        let handle = sys::open_write(path.as_ref())?;
        Ok(Resource::adopt(self, handle))
    }

    /// Adopts an existing OS handle, switching it into non-blocking mode.
    /// The resource takes ownership; the handle is closed on drop.
    pub fn take(&self, handle: sys::RawHandle) -> Result<Resource, Error> {
        sys::set_nonblocking(handle)?;
        Ok(Resource::adopt(self, handle))
    }
}

// === impl Resource ===

impl Resource {
    pub(crate) fn adopt(reactor: &Reactor, handle: sys::RawHandle) -> Self {
        let shared = Arc::new(Shared {
            reactor: reactor.clone(),
            handle,
            engif: Future::external(),
            token: Mutex::new(None),
            prefetch: Mutex::new(Vec::new()),
            _ticket: reactor.ticket(),
            #[cfg(windows)]
            windows: sys::WindowsState::new(),
        });
        #[cfg(windows)]
        sys::associate(&shared);
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Requests cancellation of the pending operation: posts a synthetic
    /// `Cancelled` completion, which surfaces as `Err(Cancelled)` on the
    /// operation's next resume.
    pub fn cancel(&self) {
        tracing::debug!(handle = ?self.shared.handle, "cancelling pending operation");
        self.shared.deliver(sys::Completion::Cancelled);
    }

    /// Writes `data` to the resource. The returned future is deferred, not
    /// executed.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Future<WriteResult> {
        defer(WriteGenerator {
            res: Arc::clone(&self.shared),
            data: data.into(),
            finished: false,
        })
    }

    /// Reads up to `upto` bytes (exactly `upto` unless end-of-data comes
    /// first), straight from the OS, bypassing the prefetch buffer. `0`
    /// means read until end-of-data.
    pub(crate) fn raw_read(&self, upto: usize) -> Future<ReadResult> {
        let mode = if upto == 0 {
            ReadMode::ToEnd
        } else {
            ReadMode::Upto(upto)
        };
        defer(ReadGenerator {
            res: Arc::clone(&self.shared),
            mode,
            data: Vec::new(),
            finished: false,
        })
    }

    /// Reads whatever single chunk is available next (or empty at
    /// end-of-data). Backs the buffered surface.
    pub(crate) fn read_chunk(&self) -> Future<ReadResult> {
        defer(ReadGenerator {
            res: Arc::clone(&self.shared),
            mode: ReadMode::Chunk,
            data: Vec::new(),
            finished: false,
        })
    }
}

impl Shared {
    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Takes the pending completion out of the engine-interrupt future and
    /// re-arms it, if one is there.
    fn consume_completion(&self) -> Option<sys::Completion> {
        if self.engif.state() != FutureState::Completed {
            return None;
        }
        let completion = self
            .engif
            .result()
            .expect("engine-interrupt future completed without an event");
        self.engif.rearm();
        Some(completion)
    }

    fn interrupt(&self) -> Future<sys::Completion> {
        self.engif.clone()
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl Shared {
            /// Arms the reactor for one readiness event, registering the
            /// handle on first use and re-arming the one-shot registration
            /// afterwards.
            ///
            /// A handle that does not support non-blocking I/O (`EPERM` from
            /// the poller) is reported always-ready instead: every
            /// subsequent attempt will simply complete synchronously.
            fn arm(self: &Arc<Self>, interest: sys::Interest) -> Result<(), Error> {
                let mut token = self.token.lock();
                if let Some(token) = *token {
                    return self
                        .reactor
                        .poller()
                        .rearm(self.handle, token, interest)
                        .map_err(|code| sys_error("re-arm with reactor", code));
                }

                let sink = Arc::downgrade(self) as Weak<dyn EventSink>;
                let slot = self.reactor.add_sink(sink);
                match self.reactor.poller().register(self.handle, slot, interest) {
                    Ok(()) => {
                        *token = Some(slot);
                        Ok(())
                    }
                    Err(libc::EPERM) => {
                        self.reactor.remove_sink(slot);
                        self.engif.try_complete(sys::Completion::always_ready(interest));
                        Ok(())
                    }
                    Err(code) => {
                        self.reactor.remove_sink(slot);
                        Err(sys_error("register with reactor", code))
                    }
                }
            }
        }

        impl Drop for Shared {
            fn drop(&mut self) {
                if let Some(token) = *self.token.lock() {
                    self.reactor.poller().deregister(self.handle);
                    self.reactor.remove_sink(token);
                }
                sys::close_handle(self.handle);
            }
        }
    } else {
        impl Drop for Shared {
            fn drop(&mut self) {
                if let Some(token) = *self.token.lock() {
                    self.reactor.remove_sink(token);
                }
                sys::close_handle(self.handle);
            }
        }
    }
}

impl EventSink for Shared {
    fn deliver(&self, completion: sys::Completion) {
        if self.engif.try_complete(completion) {
            self.reactor.engine().notify(&self.engif.any());
        } else {
            // completion raced a cancellation; the loser is dropped
            tracing::trace!(handle = ?self.handle, "completion for an already-completed interrupt");
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadMode {
    /// Return once this many bytes have accumulated (or end-of-data).
    Upto(usize),
    /// Return at end-of-data only.
    ToEnd,
    /// Return after the first successful transfer (or end-of-data).
    Chunk,
}

struct ReadGenerator {
    res: Arc<Shared>,
    mode: ReadMode,
    data: Vec<u8>,
    finished: bool,
}

impl ReadGenerator {
    fn finish(&mut self, result: ReadResult) -> weft::Step<ReadResult> {
        self.finished = true;
        weft::Step::Produced(result)
    }

    fn satisfied(&self) -> bool {
        match self.mode {
            ReadMode::Upto(limit) => self.data.len() >= limit,
            ReadMode::ToEnd => false,
            ReadMode::Chunk => !self.data.is_empty(),
        }
    }
}

struct WriteGenerator {
    res: Arc<Shared>,
    /// Bytes not yet handed to the OS.
    data: Vec<u8>,
    finished: bool,
}

impl WriteGenerator {
    fn finish(&mut self, result: WriteResult) -> weft::Step<WriteResult> {
        self.finished = true;
        weft::Step::Produced(result)
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl Generator<ReadResult> for ReadGenerator {
            fn done(&self) -> bool {
                self.finished
            }

            fn resume(&mut self, _engine: &weft::Engine) -> weft::Step<ReadResult> {
                debug_assert!(!self.finished, "read generator resumed after completion");

                if let Some(completion) = self.res.consume_completion() {
                    match completion {
                        sys::Completion::Cancelled => return self.finish(Err(Error::Cancelled)),
                        sys::Completion::Ready(bits)
                            if sys::is_hangup(bits, sys::Interest::Read) =>
                        {
                            return self.finish(Err(Error::Cancelled));
                        }
                        sys::Completion::Ready(_) => {}
                    }
                }

                let mut scratch = [0_u8; sys::OBS];
                loop {
                    let want = match self.mode {
                        ReadMode::Upto(limit) => (limit - self.data.len()).min(sys::OBS),
                        ReadMode::ToEnd | ReadMode::Chunk => sys::OBS,
                    };
                    match sys::read_once(self.res.handle, &mut scratch[..want]) {
                        sys::Attempt::Eod => {
                            let data = std::mem::take(&mut self.data);
                            return self.finish(Ok(data));
                        }
                        sys::Attempt::Transferred(count) => {
                            self.data.extend_from_slice(&scratch[..count]);
                            if self.satisfied() {
                                let data = std::mem::take(&mut self.data);
                                return self.finish(Ok(data));
                            }
                        }
                        sys::Attempt::WouldBlock => break,
                        sys::Attempt::HungUp => return self.finish(Err(Error::Cancelled)),
                        sys::Attempt::Failed(code) => {
                            return self.finish(Err(sys_error("read from resource", code)));
                        }
                    }
                }

                match self.res.arm(sys::Interest::Read) {
                    Ok(()) => weft::Step::Awaiting(self.res.interrupt().any()),
                    Err(err) => self.finish(Err(err)),
                }
            }
        }

        impl Generator<WriteResult> for WriteGenerator {
            fn done(&self) -> bool {
                self.finished
            }

            fn resume(&mut self, _engine: &weft::Engine) -> weft::Step<WriteResult> {
                debug_assert!(!self.finished, "write generator resumed after completion");

                if let Some(completion) = self.res.consume_completion() {
                    match completion {
                        sys::Completion::Cancelled => return self.finish(Err(Error::Cancelled)),
                        sys::Completion::Ready(bits)
                            if sys::is_hangup(bits, sys::Interest::Write) =>
                        {
                            return self.finish(Err(Error::Cancelled));
                        }
                        sys::Completion::Ready(_) => {}
                    }
                }

                while !self.data.is_empty() {
                    match sys::write_once(self.res.handle, &self.data) {
                        sys::Attempt::Transferred(count) => {
                            self.data.drain(..count);
                        }
                        sys::Attempt::WouldBlock => {
                            return match self.res.arm(sys::Interest::Write) {
                                Ok(()) => weft::Step::Awaiting(self.res.interrupt().any()),
                                Err(err) => self.finish(Err(err)),
                            };
                        }
                        sys::Attempt::HungUp => return self.finish(Err(Error::Cancelled)),
                        sys::Attempt::Failed(code) => {
                            return self.finish(Err(sys_error("write to resource", code)));
                        }
                        sys::Attempt::Eod => unreachable!("write cannot reach end-of-data"),
                    }
                }
                self.finish(Ok(()))
            }
        }
    } else {
        impl Generator<ReadResult> for ReadGenerator {
            fn done(&self) -> bool {
                self.finished
            }

            fn resume(&mut self, _engine: &weft::Engine) -> weft::Step<ReadResult> {
                debug_assert!(!self.finished, "read generator resumed after completion");

                if let Some(completion) = self.res.consume_completion() {
                    match completion {
                        sys::Completion::Cancelled => return self.finish(Err(Error::Cancelled)),
                        sys::Completion::Done { ok: false, err, .. } => {
                            return if err == sys::ERROR_EOF {
                                self.finish(Ok(std::mem::take(&mut self.data)))
                            } else {
                                self.finish(Err(sys_error("read from resource", err)))
                            };
                        }
                        sys::Completion::Done { ok: true, transferred, .. } => {
                            self.res.windows.consume_read(&mut self.data, transferred);
                            if self.satisfied() {
                                return self.finish(Ok(std::mem::take(&mut self.data)));
                            }
                        }
                    }
                }

                let want = match self.mode {
                    ReadMode::Upto(limit) => (limit - self.data.len()).min(sys::OBS),
                    ReadMode::ToEnd | ReadMode::Chunk => sys::OBS,
                };
                match sys::start_read(&self.res, want) {
                    sys::Started::Pending => weft::Step::Awaiting(self.res.interrupt().any()),
                    sys::Started::Eod => self.finish(Ok(std::mem::take(&mut self.data))),
                    sys::Started::Failed(code) => {
                        self.finish(Err(sys_error("read from resource", code)))
                    }
                }
            }
        }

        impl Generator<WriteResult> for WriteGenerator {
            fn done(&self) -> bool {
                self.finished
            }

            fn resume(&mut self, _engine: &weft::Engine) -> weft::Step<WriteResult> {
                debug_assert!(!self.finished, "write generator resumed after completion");

                if let Some(completion) = self.res.consume_completion() {
                    match completion {
                        sys::Completion::Cancelled => return self.finish(Err(Error::Cancelled)),
                        sys::Completion::Done { ok: false, err, .. } => {
                            return self.finish(Err(sys_error("write to resource", err)));
                        }
                        sys::Completion::Done { ok: true, transferred, .. } => {
                            let count = usize::try_from(transferred)
                                .expect("transfer count fits usize");
                            self.res.windows.advance(transferred);
                            self.data.drain(..count.min(self.data.len()));
                        }
                    }
                }

                if self.data.is_empty() {
                    return self.finish(Ok(()));
                }
                match sys::start_write(&self.res, &self.data) {
                    sys::Started::Pending => weft::Step::Awaiting(self.res.interrupt().any()),
                    sys::Started::Failed(code) => {
                        self.finish(Err(sys_error("write to resource", code)))
                    }
                    sys::Started::Eod => unreachable!("write cannot reach end-of-data"),
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;
    use weft::Engine;
    use weft::combinator::await_blocking;

    use super::*;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default()
    }

    fn rig() -> (Engine, Reactor) {
        let engine = Engine::new(2);
        let reactor = Reactor::new(&engine).unwrap();
        (engine, reactor)
    }

    #[test]
    fn pipe_round_trip() {
        let _trace = trace();
        let (engine, reactor) = rig();

        let (read_end, write_end) = sys::pipe();
        let reader = reactor.take(read_end).unwrap();
        let writer = reactor.take(write_end).unwrap();

        let payload = b"tell them a story".to_vec();
        let wrote = writer.write(payload.clone());
        assert_eq!(await_blocking(&engine, &wrote), Ok(()));

        let read = reader.raw_read(payload.len());
        assert_eq!(await_blocking(&engine, &read), Ok(payload));

        drop((reader, writer));
        reactor.wait_idle();
        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn read_parks_until_data_arrives() {
        let _trace = trace();
        let (engine, reactor) = rig();

        let (read_end, write_end) = sys::pipe();
        let reader = reactor.take(read_end).unwrap();
        let writer = reactor.take(write_end).unwrap();

        let read = engine.execute(reader.raw_read(3));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(read.state().is_pending());

        let _ = engine.execute(writer.write(&b"abc"[..]));
        assert_eq!(await_blocking(&engine, &read), Ok(b"abc".to_vec()));

        drop((reader, writer));
        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn file_round_trip_all_byte_values() {
        let _trace = trace();
        let (engine, reactor) = rig();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bytes.bin");
        let payload: Vec<u8> = (0..=255_u8).collect();

        {
            let file = reactor.file_open_write(&path).unwrap();
            let wrote = file.write(payload.clone());
            assert_eq!(await_blocking(&engine, &wrote), Ok(()));
        }
        {
            let file = reactor.file_open_read(&path).unwrap();
            let read = file.raw_read(0);
            assert_eq!(await_blocking(&engine, &read), Ok(payload));
        }

        reactor.wait_idle();
        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn cancel_surfaces_as_cancelled() {
        let _trace = trace();
        let (engine, reactor) = rig();

        let (read_end, _write_keepalive) = sys::pipe();
        let reader = reactor.take(read_end).unwrap();

        let read = engine.execute(reader.raw_read(16));
        std::thread::sleep(std::time::Duration::from_millis(20));
        reader.cancel();

        assert_eq!(await_blocking(&engine, &read), Err(Error::Cancelled));

        sys::close_handle(_write_keepalive);
        drop(reader);
        reactor.shutdown();
        engine.shutdown();
    }
}
