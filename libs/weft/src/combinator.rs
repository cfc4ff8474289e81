// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Combinators over futures.
//!
//! The identity redirect and the sequential chain are the two primitives the
//! scheduler protocol requires; everything else here ([`await_blocking`],
//! [`join_all`]) is a pure client of the public engine API.

use std::sync::Arc;
use std::sync::mpsc;

use parking_lot::Mutex;

use crate::engine::{Engine, defer};
use crate::future::{AnyFuture, Future, FutureState};
use crate::generator::{Generator, RawGenerator, RawStep, Step};

/// Identity redirect: wraps a future and completes as soon as it does.
///
/// [`Engine::notify`] uses this to re-enter the scheduler on external
/// completion: the parked awaiter is re-parked on a redirect, which is the
/// thing that actually goes through the work queue. Nobody ever reads the
/// redirect's own result, so it produces a unit payload rather than
/// duplicating the wrapped future's move-only value.
pub(crate) struct Redirect {
    inner: AnyFuture,
    requested: bool,
    finished: bool,
}

// === impl Redirect ===

impl Redirect {
    pub(crate) fn new(inner: AnyFuture) -> Self {
        Self {
            inner,
            requested: false,
            finished: false,
        }
    }
}

impl RawGenerator for Redirect {
    fn done(&self) -> bool {
        self.finished
    }

    fn resume(&mut self, _engine: &Engine) -> RawStep {
        if self.inner.state() == FutureState::Completed {
            self.finished = true;
            return RawStep::Produced(Box::new(()));
        }
        // alternate await/produce so an intermediate production of a
        // multi-shot inner future ascends to the awaiter
        self.requested = !self.requested;
        if self.requested {
            RawStep::Awaiting(self.inner.clone())
        } else {
            RawStep::Produced(Box::new(()))
        }
    }
}

/// Transforms future value(s) by a synchronous function: the returned future
/// produces `map(v)` for every value `v` the upstream produces, and finishes
/// when the upstream does.
///
/// The returned future is deferred, not executed.
pub fn then<U, V, F>(future: &Future<U>, map: F) -> Future<V>
where
    U: Send + 'static,
    V: Send + 'static,
    F: FnMut(U) -> V + Send + 'static,
{
    defer(ChainGenerator {
        upstream: future.clone(),
        map,
        requested: false,
        finished: false,
    })
}

struct ChainGenerator<U, F> {
    upstream: Future<U>,
    map: F,
    requested: bool,
    finished: bool,
}

impl<U, V, F> Generator<V> for ChainGenerator<U, F>
where
    U: Send + 'static,
    V: Send + 'static,
    F: FnMut(U) -> V + Send,
{
    fn done(&self) -> bool {
        self.finished
    }

    fn resume(&mut self, _engine: &Engine) -> Step<V> {
        if self.upstream.state() == FutureState::Completed {
            self.finished = true;
            let value = self
                .upstream
                .result()
                .expect("completed upstream future has no result");
            return Step::Produced((self.map)(value));
        }
        self.requested = !self.requested;
        if self.requested {
            Step::Awaiting(self.upstream.any())
        } else {
            let value = self
                .upstream
                .result()
                .expect("upstream future produced no value");
            Step::Produced((self.map)(value))
        }
    }
}

/// Transforms future value(s) by an asynchronous function: like [`then`],
/// but `map` returns a future whose result becomes the production.
///
/// After the inner future completes while the upstream is still pending, the
/// state machine re-arms and awaits the upstream again; this is what lets a
/// wrapping chain drive a multi-shot upstream all the way to completion.
///
/// The returned future is deferred, not executed.
pub fn then_wrap<U, V, F>(future: &Future<U>, map: F) -> Future<V>
where
    U: Send + 'static,
    V: Send + 'static,
    F: FnMut(U) -> Future<V> + Send + 'static,
{
    defer(FlatChainGenerator {
        upstream: future.clone(),
        next: None,
        map,
        state: FlatState::Init,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlatState {
    Init,
    Await0,
    Await1Rearm,
    Await1,
    Finished,
}

struct FlatChainGenerator<U, V, F> {
    upstream: Future<U>,
    next: Option<Future<V>>,
    map: F,
    state: FlatState,
}

impl<U, V, F> Generator<V> for FlatChainGenerator<U, V, F>
where
    U: Send + 'static,
    V: Send + 'static,
    F: FnMut(U) -> Future<V> + Send,
{
    fn done(&self) -> bool {
        self.state == FlatState::Finished
    }

    fn resume(&mut self, _engine: &Engine) -> Step<V> {
        match self.state {
            FlatState::Init => {
                self.state = FlatState::Await0;
                Step::Awaiting(self.upstream.any())
            }
            FlatState::Await0 => {
                let value = self
                    .upstream
                    .result()
                    .expect("upstream future produced no value");
                let next = (self.map)(value);
                self.next = Some(next.clone());
                self.state = FlatState::Await1;
                Step::Awaiting(next.into())
            }
            FlatState::Await1Rearm => {
                let next = self.next.as_ref().expect("inner future missing").clone();
                self.state = FlatState::Await1;
                Step::Awaiting(next.into())
            }
            FlatState::Await1 => {
                let next = self.next.as_ref().expect("inner future missing").clone();
                if next.state() == FutureState::Completed {
                    if self.upstream.state() == FutureState::Completed {
                        self.state = FlatState::Finished;
                    } else {
                        // inner round done, upstream still going: re-arm
                        self.state = FlatState::Init;
                        self.next = None;
                    }
                } else {
                    self.state = FlatState::Await1Rearm;
                }
                let value = next.result().expect("inner future produced no value");
                Step::Produced(value)
            }
            FlatState::Finished => unreachable!("chain resumed after completion"),
        }
    }
}

/// Blocks the calling thread until `future` completes, returning its final
/// production.
///
/// An observer generator is parked on the future inside the engine; the
/// value crosses back over a channel. Must not be called from inside a
/// generator: it would wedge the worker it runs on.
pub fn await_blocking<T>(engine: &Engine, future: &Future<T>) -> T
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    engine.launch(ForwardGenerator {
        inner: future.clone(),
        tx,
        finished: false,
    });
    rx.recv().expect("engine dropped the awaited future")
}

struct ForwardGenerator<T> {
    inner: Future<T>,
    tx: mpsc::Sender<T>,
    finished: bool,
}

impl<T> Generator<()> for ForwardGenerator<T>
where
    T: Send + 'static,
{
    fn done(&self) -> bool {
        self.finished
    }

    fn resume(&mut self, _engine: &Engine) -> Step<()> {
        if self.inner.state() == FutureState::Completed {
            let value = self
                .inner
                .result()
                .expect("completed future has no result");
            self.finished = true;
            let _ = self.tx.send(value);
            Step::Produced(())
        } else {
            // intermediate productions of a multi-shot future pass through
            // untouched; keep waiting for the final one
            Step::Awaiting(self.inner.any())
        }
    }
}

/// Aggregates a set of futures into one that produces every result, in
/// completion order.
///
/// Each input gets its own observer task, so results are pushed the moment
/// their future completes. The inputs must be distinct futures: parking two
/// observers on one future violates the unique-awaiter contract.
pub fn join_all<T>(engine: &Engine, futures: Vec<Future<T>>) -> Future<Vec<T>>
where
    T: Send + 'static,
{
    let total = futures.len();
    let collected: Future<Vec<T>> = Future::external();
    if total == 0 {
        collected.complete(Vec::new());
        return collected;
    }

    let results = Arc::new(Mutex::new(Vec::with_capacity(total)));
    for future in futures {
        engine.launch(CollectGenerator {
            inner: future,
            results: Arc::clone(&results),
            collected: collected.clone(),
            total,
            finished: false,
        });
    }
    collected
}

struct CollectGenerator<T> {
    inner: Future<T>,
    results: Arc<Mutex<Vec<T>>>,
    collected: Future<Vec<T>>,
    total: usize,
    finished: bool,
}

impl<T> Generator<()> for CollectGenerator<T>
where
    T: Send + 'static,
{
    fn done(&self) -> bool {
        self.finished
    }

    fn resume(&mut self, engine: &Engine) -> Step<()> {
        if self.inner.state() != FutureState::Completed {
            return Step::Awaiting(self.inner.any());
        }
        let value = self
            .inner
            .result()
            .expect("completed future has no result");
        self.finished = true;

        let mut results = self.results.lock();
        results.push(value);
        if results.len() == self.total {
            let all = std::mem::take(&mut *results);
            drop(results);
            self.collected.complete(all);
            engine.notify(&self.collected.any());
        }
        Step::Produced(())
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    use super::*;
    use crate::generator::from_fn;
    use crate::time::sleep;
    use std::time::{Duration, Instant};

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default()
    }

    /// Produces `start..=end`, one value per resume.
    struct RangeGenerator {
        cur: i64,
        end: i64,
    }

    impl Generator<i64> for RangeGenerator {
        fn done(&self) -> bool {
            self.cur > self.end
        }

        fn resume(&mut self, _engine: &Engine) -> Step<i64> {
            let value = self.cur;
            self.cur += 1;
            Step::Produced(value)
        }
    }

    #[test]
    fn range_accumulated_through_a_wrapping_chain() {
        let _trace = trace();
        let engine = Engine::new(2);

        let range = defer(RangeGenerator { cur: 0, end: 4 });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let drain = {
            let seen = Arc::clone(&seen);
            engine.execute(then_wrap(&range, move |v: i64| {
                seen.lock().push(v);
                Future::completed(())
            }))
        };

        let _: () = await_blocking(&engine, &drain);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(range.state(), FutureState::Completed);

        engine.shutdown();
    }

    #[test]
    fn identity_chain_equals_direct_read() {
        let _trace = trace();
        let engine = Engine::new(1);

        let direct = engine.launch(from_fn((), |_, done, _| {
            *done = true;
            Step::Produced(1234_u64)
        }));
        let value = await_blocking(&engine, &direct);

        let again = engine.launch(from_fn((), |_, done, _| {
            *done = true;
            Step::Produced(1234_u64)
        }));
        let identity = engine.execute(then(&again, |v: u64| v));
        assert_eq!(await_blocking(&engine, &identity), value);

        engine.shutdown();
    }

    #[test]
    fn sleep_then_value() {
        let _trace = trace();
        let engine = Engine::new(2);

        let started = Instant::now();
        let slept = sleep(&engine, Duration::from_millis(50), 42_u32);
        let bumped = engine.execute(then(&slept, |v: u32| v + 1));

        assert_eq!(await_blocking(&engine, &bumped), 43);
        assert!(started.elapsed() >= Duration::from_millis(50));

        engine.shutdown();
    }

    #[test]
    fn fan_in_completes_in_completion_order() {
        let _trace = trace();
        let engine = Engine::new(2);

        let started = Instant::now();
        // deliberately passed in reverse completion order
        let futures = vec![
            sleep(&engine, Duration::from_millis(30), 30_u32),
            sleep(&engine, Duration::from_millis(10), 10_u32),
            sleep(&engine, Duration::from_millis(20), 20_u32),
        ];
        let all = join_all(&engine, futures);

        assert_eq!(await_blocking(&engine, &all), vec![10, 20, 30]);
        assert!(started.elapsed() >= Duration::from_millis(30));

        engine.shutdown();
    }

    #[test]
    fn join_all_of_nothing_is_already_complete() {
        let _trace = trace();
        let engine = Engine::new(1);
        let all = join_all::<u8>(&engine, Vec::new());
        assert_eq!(all.state(), FutureState::Completed);
        assert_eq!(all.result(), Some(Vec::new()));
        engine.shutdown();
    }

    #[test]
    fn then_over_an_already_completed_future() {
        let _trace = trace();
        let engine = Engine::new(1);

        let ready = Future::completed("abc");
        let len = engine.execute(then(&ready, |s: &'static str| s.len()));
        assert_eq!(await_blocking(&engine, &len), 3);

        engine.shutdown();
    }

    #[test]
    fn then_wrap_flattens_a_nested_future() {
        let _trace = trace();
        let engine = Engine::new(2);

        let outer = sleep(&engine, Duration::from_millis(5), 6_u32);
        let engine2 = engine.clone();
        let nested = engine.execute(then_wrap(&outer, move |v: u32| {
            sleep(&engine2, Duration::from_millis(5), v * 7)
        }));

        assert_eq!(await_blocking(&engine, &nested), 42);
        engine.shutdown();
    }
}
