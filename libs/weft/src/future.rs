// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::engine::Engine;
use crate::generator::{RawGenerator, RawStep};

/// Lifecycle flag of a future.
///
/// The ordering of the variants is meaningful: everything strictly below
/// [`Completed`] is pending, and the scheduler uses `<= Running` to mean
/// "resumable or currently being resumed by this worker".
///
/// [`Completed`]: FutureState::Completed
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FutureState {
    Suspended = 0,
    Queued = 1,
    Running = 2,
    Awaiting = 3,
    Completed = 4,
}

impl FutureState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Suspended,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Awaiting,
            4 => Self::Completed,
            _ => unreachable!("invalid future state tag"),
        }
    }

    /// Whether the future has not produced its final value yet.
    pub fn is_pending(self) -> bool {
        self < Self::Completed
    }
}

impl fmt::Display for FutureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suspended => f.write_str("Suspended"),
            Self::Queued => f.write_str("Queued"),
            Self::Running => f.write_str("Running"),
            Self::Awaiting => f.write_str("Awaiting"),
            Self::Completed => f.write_str("Completed"),
        }
    }
}

/// The move-only result carrier.
///
/// Produced values are boxed on their way into the result slot and moved
/// back out by [`Future::result`]. The void case is `T = ()`, which does not
/// allocate.
pub(crate) type Payload = Box<dyn Any + Send>;

/// Heap allocation behind every future handle. Identity (and therefore
/// equality and hashing) of futures is the address of this allocation.
pub(crate) struct Core {
    /// Owned flag: written only by the worker holding the task in `Running`,
    /// or by the unique producer of a notified future. Reads are sampling
    /// reads (`Acquire`), never synchronization points on their own.
    state: AtomicU8,
    kind: Kind,
}

/// The two variants of a future. A tag check and a field access replace any
/// need for downcasting on the scheduler's hot path.
enum Kind {
    /// Owns a generator and a result slot; has identity as a schedulable
    /// task. The mutex is uncontended by construction (only the owning
    /// worker touches it while pending) and doubles as the release/acquire
    /// edge when ownership is handed to an awaiter.
    Generated(Mutex<Generated>),
    /// A plain result cell completed by some producer outside the scheduler
    /// loop (reactor, timer thread, user code).
    Notified(Mutex<Option<Payload>>),
}

pub(crate) struct Generated {
    pub(crate) generator: Box<dyn RawGenerator>,
    pub(crate) slot: Option<Payload>,
}

/// What [`AnyFuture::resume`] tells the worker loop.
pub(crate) enum Resumed {
    /// The generator yielded a dependency on another future.
    Awaiting(AnyFuture),
    /// The generator produced a value; the slot and state flag have already
    /// been updated (`Completed` if the generator finished, `Suspended`
    /// otherwise).
    Produced,
}

/// A type-erased, reference-counted future handle.
///
/// This is the currency of the scheduler: the work queue and the
/// notification map hold futures in this form. Equality is identity.
#[derive(Clone)]
pub struct AnyFuture(pub(crate) Arc<Core>);

// === impl AnyFuture ===

impl AnyFuture {
    pub(crate) fn generated(generator: Box<dyn RawGenerator>) -> Self {
        Self(Arc::new(Core {
            state: AtomicU8::new(FutureState::Suspended as u8),
            kind: Kind::Generated(Mutex::new(Generated {
                generator,
                slot: None,
            })),
        }))
    }

    fn notified(slot: Option<Payload>, state: FutureState) -> Self {
        Self(Arc::new(Core {
            state: AtomicU8::new(state as u8),
            kind: Kind::Notified(Mutex::new(slot)),
        }))
    }

    /// Samples the state flag. Non-blocking, non-synchronizing.
    pub fn state(&self) -> FutureState {
        FutureState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FutureState) {
        tracing::trace!(future = self.key(), %state, "state transition");
        self.0.state.store(state as u8, Ordering::Release);
    }

    /// `Suspended -> Queued`, or a panic: executing a task that is not
    /// currently suspended is a contract violation.
    pub(crate) fn transition_to_queued(&self) {
        let prev = self.0.state.compare_exchange(
            FutureState::Suspended as u8,
            FutureState::Queued as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(
            prev.is_ok(),
            "executed a task that is not suspended (state {})",
            FutureState::from_u8(prev.unwrap_err())
        );
    }

    /// Stable key for the notification map.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    pub(crate) fn is_generated(&self) -> bool {
        matches!(self.0.kind, Kind::Generated(_))
    }

    /// Drives the owned generator one step. Caller must have set the state
    /// flag to `Running` and be the unique owner of the task.
    pub(crate) fn resume(&self, engine: &Engine) -> Resumed {
        let Kind::Generated(cell) = &self.0.kind else {
            panic!("resumed a notified future");
        };
        let mut inner = cell.lock();
        match inner.generator.resume(engine) {
            RawStep::Awaiting(dep) => Resumed::Awaiting(dep),
            RawStep::Produced(value) => {
                let done = inner.generator.done();
                inner.slot = Some(value);
                drop(inner);
                // The slot is populated before the flag flips; an observer
                // that samples `Completed` will find the value.
                self.set_state(if done {
                    FutureState::Completed
                } else {
                    FutureState::Suspended
                });
                Resumed::Produced
            }
        }
    }

    pub(crate) fn take_payload(&self) -> Option<Payload> {
        match &self.0.kind {
            Kind::Generated(cell) => cell.lock().slot.take(),
            Kind::Notified(slot) => slot.lock().take(),
        }
    }

    fn complete_notified(&self, value: Payload, or_panic: bool) -> bool {
        let Kind::Notified(slot) = &self.0.kind else {
            panic!("completed a generated future from outside the scheduler");
        };
        let mut slot = slot.lock();
        if self.state() == FutureState::Completed {
            assert!(!or_panic, "notified future completed twice");
            return false;
        }
        *slot = Some(value);
        self.set_state(FutureState::Completed);
        true
    }

    fn rearm_notified(&self) {
        let Kind::Notified(slot) = &self.0.kind else {
            panic!("rearmed a generated future");
        };
        let mut slot = slot.lock();
        assert_eq!(
            self.state(),
            FutureState::Completed,
            "rearmed a notified future that is not completed"
        );
        *slot = None;
        self.set_state(FutureState::Running);
    }
}

impl PartialEq for AnyFuture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for AnyFuture {}

impl Hash for AnyFuture {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for AnyFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyFuture")
            .field("key", &self.key())
            .field("state", &self.state())
            .field(
                "kind",
                &match self.0.kind {
                    Kind::Generated(_) => "generated",
                    Kind::Notified(_) => "notified",
                },
            )
            .finish()
    }
}

/// A typed, reference-counted future handle.
///
/// Two flavors exist behind the same type: *generated* futures constructed
/// by [`defer`] bind a generator to a schedulable task, while *notified*
/// (outside) futures constructed by [`Future::external`] are completed by a
/// producer outside the scheduler loop and handed back in through
/// [`Engine::notify`].
///
/// Cloning is shallow; all clones observe the same state and share the same
/// result slot. Reading the result moves it out.
///
/// [`defer`]: crate::engine::defer
/// [`Engine::notify`]: crate::engine::Engine::notify
pub struct Future<T> {
    raw: AnyFuture,
    _marker: PhantomData<fn() -> T>,
}

// === impl Future ===

impl<T> Future<T> {
    pub(crate) fn from_raw(raw: AnyFuture) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Samples the state flag.
    pub fn state(&self) -> FutureState {
        self.raw.state()
    }

    /// The type-erased handle to the same future.
    pub fn any(&self) -> AnyFuture {
        self.raw.clone()
    }
}

impl<T: Send + 'static> Future<T> {
    /// Creates an outside future: a result cell in `Running` state, waiting
    /// to be completed by a producer outside the scheduler loop.
    pub fn external() -> Self {
        Self::from_raw(AnyFuture::notified(None, FutureState::Running))
    }

    /// Creates an already-completed outside future holding `value`.
    pub fn completed(value: T) -> Self {
        Self::from_raw(AnyFuture::notified(
            Some(Box::new(value)),
            FutureState::Completed,
        ))
    }

    /// Completes an outside future.
    ///
    /// The caller is the unique producer; completion releases ownership of
    /// the result to whoever observes `Completed`. Does *not* notify the
    /// engine, call [`Engine::notify`] afterwards to wake a parked awaiter.
    ///
    /// # Panics
    ///
    /// Panics if the future is generated or already completed (contract
    /// violations).
    ///
    /// [`Engine::notify`]: crate::engine::Engine::notify
    pub fn complete(&self, value: T) {
        self.raw.complete_notified(Box::new(value), true);
    }

    /// Like [`complete`](Self::complete) but returns `false` instead of
    /// panicking when the future is already completed. Used where two
    /// producers may legitimately race (a reactor event against a local
    /// cancellation).
    pub fn try_complete(&self, value: T) -> bool {
        self.raw.complete_notified(Box::new(value), false)
    }

    /// Re-arms an outside future: `Completed -> Running`, clearing the
    /// result slot. Only the unique producer may call this, between
    /// productions.
    pub fn rearm(&self) {
        self.raw.rearm_notified();
    }

    /// Moves the result out, if the future is completed and the value has
    /// not been consumed yet.
    ///
    /// This is move-on-read: a second call (or a second observer) gets
    /// `None`. For multi-shot generators this returns the latest production.
    pub fn result(&self) -> Option<T> {
        if self.raw.state() != FutureState::Completed && !self.raw.is_generated() {
            return None;
        }
        self.raw
            .take_payload()
            .map(|payload| *payload.downcast::<T>().expect("future payload type mismatch"))
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Future<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Future<T> {}

impl<T> Hash for Future<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> From<Future<T>> for AnyFuture {
    fn from(f: Future<T>) -> Self {
        f.raw
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Future").field(&self.raw).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering() {
        assert!(FutureState::Suspended < FutureState::Completed);
        assert!(FutureState::Queued < FutureState::Running);
        assert!(FutureState::Running < FutureState::Awaiting);
        assert!(FutureState::Awaiting.is_pending());
        assert!(!FutureState::Completed.is_pending());
    }

    #[test]
    fn external_complete_and_move_on_read() {
        let f = Future::<u32>::external();
        assert_eq!(f.state(), FutureState::Running);
        assert_eq!(f.result(), None);

        f.complete(7);
        assert_eq!(f.state(), FutureState::Completed);
        assert_eq!(f.result(), Some(7));
        // move-on-read: the value is gone
        assert_eq!(f.result(), None);
    }

    #[test]
    fn rearm_clears_the_slot() {
        let f = Future::<&'static str>::external();
        f.complete("first");
        f.rearm();
        assert_eq!(f.state(), FutureState::Running);
        f.complete("second");
        assert_eq!(f.result(), Some("second"));
    }

    #[test]
    fn try_complete_does_not_double_complete() {
        let f = Future::<u8>::external();
        assert!(f.try_complete(1));
        assert!(!f.try_complete(2));
        assert_eq!(f.result(), Some(1));
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_complete_is_a_contract_violation() {
        let f = Future::<u8>::external();
        f.complete(1);
        f.complete(2);
    }

    #[test]
    fn identity_equality() {
        let a = Future::<()>::external();
        let b = Future::<()>::external();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.any(), a.any());
        assert_ne!(a.any(), b.any());
    }

    #[test]
    fn void_payload() {
        let f = Future::<()>::completed(());
        assert_eq!(f.state(), FutureState::Completed);
        assert_eq!(f.result(), Some(()));
    }
}
