// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The buffered surface on top of the primitive read/write operations:
//! a prefetch buffer for reads (sized reads, peeking, delimiter-terminated
//! reads) and a deferred writer that accumulates locally and flushes in
//! order.

use std::mem;
use std::sync::Arc;

use weft::{Engine, Future, FutureState, Generator, Step, defer};

use crate::error::{Error, ReadResult, WriteResult};
use crate::resource::{Resource, Shared};

impl Resource {
    /// Reads exactly `upto` bytes, unless end-of-data comes first; `0` reads
    /// until end-of-data. Consumes the prefetch buffer before touching the
    /// OS. The returned future is deferred, not executed.
    pub fn read(&self, upto: usize) -> Future<ReadResult> {
        let want = if upto == 0 {
            Want::All
        } else {
            Want::Exactly(upto)
        };
        self.buffered(want)
    }

    /// Reads until end-of-data.
    pub fn read_to_end(&self) -> Future<ReadResult> {
        self.read(0)
    }

    /// Returns the next `upto` bytes (less at end-of-data) without consuming
    /// them: a subsequent read sees the same bytes again.
    pub fn peek(&self, upto: usize) -> Future<ReadResult> {
        self.buffered(Want::Peek(upto))
    }

    /// Reads up to and including `delimiter`. Reaching end-of-data without
    /// the delimiter is a [`Error::Protocol`] error.
    pub fn read_until(&self, delimiter: impl Into<Vec<u8>>) -> Future<ReadResult> {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "empty read delimiter");
        self.buffered(Want::Until(delimiter))
    }

    /// Creates a new deferred writer for the resource.
    pub fn writer(&self) -> Writer {
        Writer {
            resource: self.clone(),
            engine: self.shared().reactor().engine().clone(),
            pending: Vec::new(),
            last: Future::completed(Ok(())),
            eod: Future::external(),
        }
    }

    fn buffered(&self, want: Want) -> Future<ReadResult> {
        defer(BufferedReadGenerator {
            resource: self.clone(),
            want,
            fetch: None,
            eod: false,
            finished: false,
        })
    }
}

enum Want {
    Exactly(usize),
    All,
    Until(Vec<u8>),
    Peek(usize),
}

/// Satisfies a read request out of the shared prefetch buffer, fetching
/// chunks through the primitive layer as long as the request is still
/// hungry. Leftover bytes stay buffered for the next request.
struct BufferedReadGenerator {
    resource: Resource,
    want: Want,
    /// In-flight chunk fetch, if any.
    fetch: Option<Future<ReadResult>>,
    eod: bool,
    finished: bool,
}

impl BufferedReadGenerator {
    fn finish(&mut self, result: ReadResult) -> Step<ReadResult> {
        self.finished = true;
        Step::Produced(result)
    }

    /// Checks the prefetch buffer against the request. `None` means still
    /// hungry.
    fn satisfy(&self, shared: &Arc<Shared>) -> Option<ReadResult> {
        let mut buffer = shared.prefetch.lock();
        match &self.want {
            Want::Exactly(upto) => {
                if buffer.len() >= *upto {
                    let rest = buffer.split_off(*upto);
                    return Some(Ok(mem::replace(&mut *buffer, rest)));
                }
                if self.eod {
                    return Some(Ok(mem::take(&mut *buffer)));
                }
                None
            }
            Want::All => self.eod.then(|| Ok(mem::take(&mut *buffer))),
            Want::Until(delimiter) => {
                if let Some(end) = find(&buffer, delimiter) {
                    let rest = buffer.split_off(end + delimiter.len());
                    return Some(Ok(mem::replace(&mut *buffer, rest)));
                }
                if self.eod {
                    return Some(Err(Error::Protocol(
                        "delimiter not found before end of data".into(),
                    )));
                }
                None
            }
            Want::Peek(upto) => {
                if buffer.len() >= *upto || self.eod {
                    let end = (*upto).min(buffer.len());
                    return Some(Ok(buffer[..end].to_vec()));
                }
                None
            }
        }
    }
}

impl Generator<ReadResult> for BufferedReadGenerator {
    fn done(&self) -> bool {
        self.finished
    }

    fn resume(&mut self, _engine: &Engine) -> Step<ReadResult> {
        loop {
            if let Some(fetch) = self.fetch.take() {
                if fetch.state() != FutureState::Completed {
                    let dep = fetch.any();
                    self.fetch = Some(fetch);
                    return Step::Awaiting(dep);
                }
                let chunk = fetch.result().expect("completed fetch has no result");
                match chunk {
                    Err(err) => return self.finish(Err(err)),
                    Ok(chunk) if chunk.is_empty() => self.eod = true,
                    Ok(chunk) => self.resource.shared().prefetch.lock().extend(chunk),
                }
            }

            if let Some(result) = self.satisfy(self.resource.shared()) {
                return self.finish(result);
            }
            self.fetch = Some(self.resource.read_chunk());
        }
    }
}

/// Naive subsequence search; delimiters are tiny.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&at| &haystack[at..at + needle.len()] == needle)
}

/// Stream-like deferred writer.
///
/// Data accumulates locally and goes out on [`flush`](Writer::flush), with
/// flushes serialized in order through the resource. Dropping the writer
/// performs the final flush; [`eod`](Writer::eod) gives out a future that
/// completes once that last flush has fully drained.
pub struct Writer {
    resource: Resource,
    engine: Engine,
    pending: Vec<u8>,
    /// The latest link of the flush chain. Its result is consumed by the
    /// *next* link only; user-visible completions go out through separate
    /// notified futures so the one-observer contract holds.
    last: Future<WriteResult>,
    eod: Future<WriteResult>,
}

// === impl Writer ===

impl Writer {
    /// Accumulates `data` locally.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.pending.extend_from_slice(data.as_ref());
        self
    }

    /// Proactively flushes the accumulated data. The writer can still be
    /// used afterwards; flushes complete in issue order, and an earlier
    /// failure short-circuits the later flushes.
    pub fn flush(&mut self) -> Future<WriteResult> {
        let done = Future::external();
        self.flush_into(done.clone());
        done
    }

    fn flush_into(&mut self, done: Future<WriteResult>) {
        let link = defer(FlushGenerator {
            prev: self.last.clone(),
            resource: self.resource.clone(),
            chunk: Some(mem::take(&mut self.pending)),
            write: None,
            done,
            state: FlushState::AwaitPrev,
        });
        self.last = self.engine.execute(link);
    }

    /// A future resolved when the writer has finished *all* writing,
    /// including the final flush its destructor issues.
    pub fn eod(&self) -> Future<WriteResult> {
        self.eod.clone()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let eod = self.eod.clone();
        self.flush_into(eod);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FlushState {
    AwaitPrev,
    AwaitWrite,
    Done,
}

/// One link of a writer's flush chain: waits for the previous link, writes
/// its chunk, and reports the outcome both into its user-visible `done`
/// future and as its own production (which the next link consumes).
struct FlushGenerator {
    prev: Future<WriteResult>,
    resource: Resource,
    chunk: Option<Vec<u8>>,
    write: Option<Future<WriteResult>>,
    done: Future<WriteResult>,
    state: FlushState,
}

impl FlushGenerator {
    fn conclude(&mut self, engine: &Engine, result: WriteResult) -> Step<WriteResult> {
        self.state = FlushState::Done;
        self.done.complete(result.clone());
        engine.notify(&self.done.any());
        Step::Produced(result)
    }
}

impl Generator<WriteResult> for FlushGenerator {
    fn done(&self) -> bool {
        self.state == FlushState::Done
    }

    fn resume(&mut self, engine: &Engine) -> Step<WriteResult> {
        match self.state {
            FlushState::AwaitPrev => {
                if self.prev.state() != FutureState::Completed {
                    return Step::Awaiting(self.prev.any());
                }
                match self.prev.result().expect("flush chain link lost its result") {
                    Err(err) => self.conclude(engine, Err(err)),
                    Ok(()) => {
                        let write = self
                            .resource
                            .write(self.chunk.take().expect("flush chunk taken twice"));
                        let dep = write.any();
                        self.write = Some(write);
                        self.state = FlushState::AwaitWrite;
                        Step::Awaiting(dep)
                    }
                }
            }
            FlushState::AwaitWrite => {
                let write = self.write.as_ref().expect("write future missing");
                if write.state() != FutureState::Completed {
                    return Step::Awaiting(write.any());
                }
                let result = write.result().expect("completed write has no result");
                self.conclude(engine, result)
            }
            FlushState::Done => unreachable!("flush link resumed after completion"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;
    use weft::combinator::await_blocking;

    use super::*;
    use crate::reactor::Reactor;
    use crate::sys;

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

    fn pipe_pair(reactor: &Reactor) -> (Resource, Resource) {
        let (read_end, write_end) = sys::pipe();
        (
            reactor.take(read_end).unwrap(),
            reactor.take(write_end).unwrap(),
        )
    }

    #[test]
    fn read_until_keeps_the_remainder_buffered() {
        let _trace = trace();
        let (engine, reactor) = rig();
        let (reader, writer) = pipe_pair(&reactor);

        let wrote = writer.write(&b"hello\nworld"[..]);
        assert_eq!(await_blocking(&engine, &wrote), Ok(()));

        let line = reader.read_until(&b"\n"[..]);
        assert_eq!(await_blocking(&engine, &line), Ok(b"hello\n".to_vec()));

        // the completed write future still pins the writer resource; both
        // must go for the read end to see end-of-data
        drop((wrote, writer));
        let rest = reader.read_to_end();
        assert_eq!(await_blocking(&engine, &rest), Ok(b"world".to_vec()));

        drop(reader);
        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn missing_delimiter_is_a_protocol_error() {
        let _trace = trace();
        let (engine, reactor) = rig();
        let (reader, writer) = pipe_pair(&reactor);

        let wrote = writer.write(&b"no terminator here"[..]);
        assert_eq!(await_blocking(&engine, &wrote), Ok(()));
        drop((wrote, writer));

        let line = reader.read_until(&b"\n"[..]);
        assert!(matches!(
            await_blocking(&engine, &line),
            Err(Error::Protocol(_))
        ));

        drop(reader);
        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn peek_does_not_consume() {
        let _trace = trace();
        let (engine, reactor) = rig();
        let (reader, writer) = pipe_pair(&reactor);

        let wrote = writer.write(&b"abcdef"[..]);
        assert_eq!(await_blocking(&engine, &wrote), Ok(()));

        let peeked = reader.peek(3);
        assert_eq!(await_blocking(&engine, &peeked), Ok(b"abc".to_vec()));
        let read = reader.read(6);
        assert_eq!(await_blocking(&engine, &read), Ok(b"abcdef".to_vec()));

        drop((reader, writer));
        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn sized_read_stops_at_end_of_data() {
        let _trace = trace();
        let (engine, reactor) = rig();
        let (reader, writer) = pipe_pair(&reactor);

        let wrote = writer.write(&b"xy"[..]);
        assert_eq!(await_blocking(&engine, &wrote), Ok(()));
        drop((wrote, writer));

        // asks for more than will ever arrive
        let read = reader.read(10);
        assert_eq!(await_blocking(&engine, &read), Ok(b"xy".to_vec()));

        drop(reader);
        reactor.shutdown();
        engine.shutdown();
    }

    #[test]
    fn writer_flushes_in_order_and_resolves_eod() {
        let _trace = trace();
        let (engine, reactor) = rig();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");

        let eod = {
            let file = reactor.file_open_write(&path).unwrap();
            let mut writer = file.writer();
            writer.write(b"alpha ").write(b"beta ");
            let mid = writer.flush();
            writer.write(b"gamma");
            let eod = writer.eod();
            drop(writer);
            assert_eq!(await_blocking(&engine, &mid), Ok(()));
            eod
        };
        assert_eq!(await_blocking(&engine, &eod), Ok(()));

        let file = reactor.file_open_read(&path).unwrap();
        let content = file.read_to_end();
        assert_eq!(
            await_blocking(&engine, &content),
            Ok(b"alpha beta gamma".to_vec())
        );

        drop(file);
        reactor.wait_idle();
        reactor.shutdown();
        engine.shutdown();
    }
}
