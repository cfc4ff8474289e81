// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::combinator::Redirect;
use crate::future::{AnyFuture, Future, FutureState, Resumed};
use crate::generator::{Erased, Generator};
use crate::queue::{TryPop, WorkQueue};

/// Transforms a generator into a future.
///
/// The future starts out `Suspended`: nothing runs until it is either
/// [`execute`](Engine::execute)d or awaited by a running task (in which case
/// the awaiting worker drives it inline).
pub fn defer<T, G>(generator: G) -> Future<T>
where
    T: Send + 'static,
    G: Generator<T> + 'static,
{
    Future::from_raw(AnyFuture::generated(Box::new(Erased::new(generator))))
}

/// Handle to the scheduler: a fixed pool of worker threads repeatedly
/// resuming ready generators, tracking their suspension on pending futures
/// through the notification map, and re-queueing them when those futures
/// complete.
///
/// The handle is cheap to clone; all clones drive the same pool. Shutdown is
/// explicit and quiescent: [`wait_idle`](Engine::wait_idle) blocks until no
/// task is runnable and none is parked, then closes the work queue so the
/// workers drain and exit.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

struct Shared {
    work: WorkQueue<AnyFuture>,
    /// Wait graph plus the idle-worker count. Both live under one mutex so
    /// the quiescence condition can be observed without losing the last
    /// wakeup.
    waits: Mutex<Waits>,
    quiesce: Condvar,
    workers: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Waits {
    /// awaited future -> the single task parked on it.
    parked: HashMap<usize, Entry>,
    /// Workers currently blocked on (or about to block on) an empty queue.
    idle: usize,
}

struct Entry {
    /// Keeps the awaited future's allocation (and therefore its map key)
    /// alive for as long as the entry exists.
    awaited: AnyFuture,
    awaiter: AnyFuture,
}

// === impl Engine ===

impl Engine {
    /// Starts an engine with `workers` worker threads.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "an engine needs at least one worker");

        let engine = Self {
            shared: Arc::new(Shared {
                work: WorkQueue::new(),
                waits: Mutex::new(Waits {
                    parked: HashMap::new(),
                    idle: 0,
                }),
                quiesce: Condvar::new(),
                workers,
                threads: Mutex::new(Vec::with_capacity(workers)),
            }),
        };

        let mut threads = engine.shared.threads.lock();
        for id in 0..workers {
            let worker = Worker {
                engine: engine.clone(),
                id,
            };
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .spawn(move || worker.run())
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        drop(threads);

        tracing::debug!(workers, "engine started");
        engine
    }

    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    /// Resumes parallel yield of the future: `Suspended -> Queued`, then
    /// push onto the work queue. Returns the future for chaining.
    ///
    /// # Panics
    ///
    /// Panics if `future` is not a generated future currently `Suspended`
    /// (contract violation).
    pub fn execute<T>(&self, future: Future<T>) -> Future<T> {
        let raw = future.any();
        assert!(raw.is_generated(), "executed a notified future");
        raw.transition_to_queued();
        self.shared.work.push(raw);
        future
    }

    /// Transforms the generator into a future on this engine and executes it
    /// in parallel: `execute(defer(generator))`.
    pub fn launch<T, G>(&self, generator: G) -> Future<T>
    where
        T: Send + 'static,
        G: Generator<T> + 'static,
    {
        self.execute(defer(generator))
    }

    /// Notifies the engine of the completion of an external future.
    ///
    /// Returns almost immediately; if a task is parked on `future`, it is
    /// re-parked on a fresh identity-redirect task which is scheduled in its
    /// stead, and the actual processing happens on a worker. With no parked
    /// awaiter the call is a no-op, and two calls never double-schedule: the
    /// awaiter is removed atomically.
    pub fn notify(&self, future: &AnyFuture) {
        let redirect = AnyFuture::generated(Box::new(Redirect::new(future.clone())));
        // Remove and re-park under one lock: the map must never look empty
        // mid-notify, or a concurrent `wait_idle` could declare quiescence
        // with this wakeup still in hand.
        let reparked = {
            let mut waits = self.shared.waits.lock();
            match waits.parked.remove(&future.key()) {
                Some(entry) => {
                    waits.parked.insert(
                        redirect.key(),
                        Entry {
                            awaited: redirect.clone(),
                            awaiter: entry.awaiter,
                        },
                    );
                    true
                }
                None => false,
            }
        };
        if reparked {
            tracing::trace!(completed = future.key(), "notify: rescheduling awaiter");
            redirect.transition_to_queued();
            self.shared.work.push(redirect);
        } else {
            tracing::trace!(completed = future.key(), "notify: no awaiter, dropped");
        }
    }

    /// Blocks until the engine is quiescent (all workers idle and no task
    /// parked), then closes the work queue so the workers exit. Workers are
    /// joinable afterwards; see [`shutdown`](Engine::shutdown).
    pub fn wait_idle(&self) {
        let mut waits = self.shared.waits.lock();
        while !(waits.parked.is_empty() && waits.idle == self.shared.workers) {
            self.shared.quiesce.wait(&mut waits);
        }
        drop(waits);
        tracing::debug!("engine quiescent, closing work queue");
        self.shared.work.close();
    }

    /// [`wait_idle`](Engine::wait_idle), then join the worker threads.
    pub fn shutdown(&self) {
        self.wait_idle();
        let threads = std::mem::take(&mut *self.shared.threads.lock());
        for handle in threads {
            handle.join().expect("worker thread panicked");
        }
        tracing::debug!("engine shut down");
    }

    /// Parks `awaiter` on `awaited`: when `awaited` completes, `awaiter` is
    /// resumed. At most one entry per awaited future may exist.
    fn add_wait(&self, awaited: &AnyFuture, awaiter: AnyFuture) {
        let mut waits = self.shared.waits.lock();
        let prev = waits.parked.insert(
            awaited.key(),
            Entry {
                awaited: awaited.clone(),
                awaiter,
            },
        );
        debug_assert!(prev.is_none(), "second awaiter parked on one future");
    }

    /// Atomically removes and returns the task parked on `awaited`, if any.
    fn drop_wait(&self, awaited: &AnyFuture) -> Option<AnyFuture> {
        let mut waits = self.shared.waits.lock();
        let entry = waits.parked.remove(&awaited.key())?;
        if waits.parked.is_empty() {
            self.shared.quiesce.notify_all();
        }
        drop(waits);
        drop(entry.awaited);
        Some(entry.awaiter)
    }

    fn enter_idle(&self) {
        let mut waits = self.shared.waits.lock();
        waits.idle += 1;
        if waits.idle == self.shared.workers && waits.parked.is_empty() {
            self.shared.quiesce.notify_all();
        }
    }

    fn exit_idle(&self) {
        self.shared.waits.lock().idle -= 1;
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waits = self.shared.waits.lock();
        f.debug_struct("Engine")
            .field("workers", &self.shared.workers)
            .field("idle", &waits.idle)
            .field("parked", &waits.parked.len())
            .finish_non_exhaustive()
    }
}

struct Worker {
    engine: Engine,
    id: usize,
}

// === impl Worker ===

impl Worker {
    fn run(&self) {
        let _span = tracing::debug_span!("worker main loop", worker = self.id).entered();

        loop {
            match self.engine.shared.work.try_pop() {
                TryPop::Item(task) => self.drive(task),
                TryPop::Closed => break,
                TryPop::Empty => {
                    self.engine.enter_idle();
                    let popped = self.engine.shared.work.pop();
                    self.engine.exit_idle();
                    match popped {
                        Some(task) => self.drive(task),
                        None => break,
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, "work queue closed, shutting down");
    }

    /// The resume/suspend/notify loop, run to exhaustion for one task: keep
    /// resuming until the chain either parks on a parallel dependency or
    /// produces with nobody waiting.
    fn drive(&self, mut task: AnyFuture) {
        // only suspended or queued tasks are resumable
        if task.state() > FutureState::Running {
            return;
        }
        loop {
            task.set_state(FutureState::Running);
            match task.resume(&self.engine) {
                Resumed::Awaiting(dep) => match dep.state() {
                    // continue in-thread, without touching the notification
                    // map
                    FutureState::Completed => {}
                    // a lazy dependency that was deferred but never
                    // executed: walk into it on this thread, threading the
                    // parent through the notification map so completion
                    // ascends back up
                    FutureState::Suspended => {
                        task.set_state(FutureState::Awaiting);
                        self.engine.add_wait(&dep, task);
                        task = dep;
                    }
                    // a parallel dependency owned elsewhere: park
                    FutureState::Queued | FutureState::Awaiting | FutureState::Running => {
                        task.set_state(FutureState::Awaiting);
                        self.engine.add_wait(&dep, task.clone());
                        // completion may have raced the park; whoever
                        // removes the entry first wins the awaiter
                        if dep.state() == FutureState::Completed
                            && let Some(reclaimed) = self.engine.drop_wait(&dep)
                        {
                            task = reclaimed;
                            continue;
                        }
                        return;
                    }
                },
                Resumed::Produced => {
                    // Whether the task finished or merely suspended between
                    // productions, drop it from the notification map either
                    // way: anyone still interested will park on it again.
                    match self.engine.drop_wait(&task) {
                        // proceed up the await chain immediately
                        Some(parent) => task = parent,
                        None => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    use super::*;
    use crate::combinator::{await_blocking, then};
    use crate::generator::{Step, from_fn};

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default()
    }

    #[test]
    fn launch_and_await() {
        let _trace = trace();
        let engine = Engine::new(2);

        let f = engine.launch(from_fn((), |_, done, _| {
            *done = true;
            Step::Produced(42_u32)
        }));
        assert_eq!(await_blocking(&engine, &f), 42);

        engine.shutdown();
    }

    #[test]
    fn finishes_on_initial_resume_and_dispatches_awaiter() {
        let _trace = trace();
        let engine = Engine::new(1);

        // the generator never yields a dependency; its awaiter must still be
        // dispatched
        let f = defer(from_fn((), |_, done, _| {
            *done = true;
            Step::Produced("hello")
        }));
        let chained = engine.execute(then(&f, |s: &'static str| s.len()));
        assert_eq!(await_blocking(&engine, &chained), 5);
        assert_eq!(f.state(), FutureState::Completed);

        engine.shutdown();
    }

    #[test]
    fn completed_state_is_terminal() {
        let _trace = trace();
        let engine = Engine::new(1);

        let f = engine.launch(from_fn((), |_, done, _| {
            *done = true;
            Step::Produced(1_u8)
        }));
        assert_eq!(await_blocking(&engine, &f), 1);
        assert_eq!(f.state(), FutureState::Completed);
        engine.wait_idle();
        assert_eq!(f.state(), FutureState::Completed);

        engine.shutdown();
        assert_eq!(f.state(), FutureState::Completed);
    }

    #[test]
    fn notify_without_awaiter_is_a_noop() {
        let _trace = trace();
        let engine = Engine::new(1);

        let outside = Future::<u32>::external();
        outside.complete(5);
        engine.notify(&outside.any());
        engine.notify(&outside.any());

        // nothing was scheduled; the engine drains immediately
        engine.shutdown();
        assert_eq!(outside.result(), Some(5));
    }

    #[test]
    fn notify_wakes_the_parked_awaiter() {
        let _trace = trace();
        let engine = Engine::new(2);

        let outside = Future::<u32>::external();
        let chained = engine.execute(then(&outside, |v: u32| v * 2));

        // give the chain time to park on the outside future
        std::thread::sleep(std::time::Duration::from_millis(20));
        outside.complete(21);
        engine.notify(&outside.any());

        assert_eq!(await_blocking(&engine, &chained), 42);
        engine.shutdown();
    }

    #[test]
    fn already_completed_dependency_is_resumed_inline() {
        let _trace = trace();
        let engine = Engine::new(1);

        let ready = Future::<u32>::completed(10);
        let chained = engine.execute(then(&ready, |v: u32| v + 1));
        assert_eq!(await_blocking(&engine, &chained), 11);

        // the dependency was already complete, so nothing ever parked on it
        assert!(engine.shared.waits.lock().parked.is_empty());
        engine.shutdown();
    }

    #[test]
    fn fifo_execution_order() {
        let _trace = trace();
        let engine = Engine::new(1);

        let order = Arc::new(Mutex::new(Vec::new()));
        let futures: Vec<_> = (0..8)
            .map(|i| {
                let order = Arc::clone(&order);
                engine.execute(defer(from_fn((), move |_, done, _| {
                    *done = true;
                    order.lock().push(i);
                    Step::Produced(())
                })))
            })
            .collect();
        for f in &futures {
            if f.state().is_pending() {
                let _: () = await_blocking(&engine, f);
            }
        }
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
        engine.shutdown();
    }

    #[test]
    #[should_panic(expected = "not suspended")]
    fn double_execute_is_a_contract_violation() {
        let engine = Engine::new(1);
        let f = defer(from_fn((), |_, done, _| {
            *done = true;
            Step::Produced(())
        }));
        let f = engine.execute(f);
        let _ = engine.execute(f);
    }

    #[test]
    fn quiescent_shutdown_joins_workers() {
        let _trace = trace();
        let engine = Engine::new(4);
        for _ in 0..32 {
            engine.launch(from_fn(0_u32, |_, done, count| {
                *count += 1;
                if *count == 3 {
                    *done = true;
                }
                Step::Produced(*count)
            }));
        }
        engine.shutdown();
        assert!(engine.shared.threads.lock().is_empty());
    }
}
