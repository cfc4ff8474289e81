// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::marker::PhantomData;

use crate::engine::Engine;
use crate::future::{AnyFuture, Payload};

/// What a generator hands back to the scheduler on each resume.
pub enum Step<T> {
    /// The generator is waiting for this future's completion; it will be
    /// resumed again once the future completes.
    Awaiting(AnyFuture),
    /// The generator produced its next value.
    Produced(T),
}

/// A resumable producer of values.
///
/// The scheduler drives a generator through [`resume`]:
///
/// - [`resume`] is invoked at least once before [`done`] is consulted, and
///   never again after [`done`] reports `true`.
/// - [`done`] may flip from `false` to `true` only as the consequence of a
///   [`Step::Produced`] return, never of a [`Step::Awaiting`] one.
/// - Returning `Awaiting(f)` where `f` is already completed is fine; the
///   scheduler re-invokes [`resume`] immediately without parking.
/// - A generator may produce several values before finishing (multi-shot).
///   Each production overwrites the previous one in the owning future's
///   result slot; observers consume between productions through the
///   notification mechanism, and only one observation per production is
///   guaranteed.
///
/// The `engine` parameter exists so a generator can launch work in parallel
/// while it runs.
///
/// [`resume`]: Generator::resume
/// [`done`]: Generator::done
pub trait Generator<T>: Send {
    /// Whether the generation has finished. Pure query.
    fn done(&self) -> bool;

    /// Resumes the generation process.
    fn resume(&mut self, engine: &Engine) -> Step<T>;
}

/// Type-erased step, with the produced value boxed into the move-only
/// payload carrier.
pub(crate) enum RawStep {
    Awaiting(AnyFuture),
    Produced(Payload),
}

/// The erased twin of [`Generator`]; what the scheduler actually drives.
pub(crate) trait RawGenerator: Send {
    fn done(&self) -> bool;
    fn resume(&mut self, engine: &Engine) -> RawStep;
}

/// Bridges a typed generator into the erased protocol.
pub(crate) struct Erased<T, G> {
    generator: G,
    _marker: PhantomData<fn() -> T>,
}

// === impl Erased ===

impl<T, G> Erased<T, G> {
    pub(crate) fn new(generator: G) -> Self {
        Self {
            generator,
            _marker: PhantomData,
        }
    }
}

impl<T, G> RawGenerator for Erased<T, G>
where
    T: Send + 'static,
    G: Generator<T>,
{
    fn done(&self) -> bool {
        self.generator.done()
    }

    fn resume(&mut self, engine: &Engine) -> RawStep {
        match self.generator.resume(engine) {
            Step::Awaiting(dep) => RawStep::Awaiting(dep),
            Step::Produced(value) => RawStep::Produced(Box::new(value)),
        }
    }
}

/// A generator written as a closure over explicit state, for the cases where
/// a named state machine struct would be ceremony.
///
/// The closure receives the engine, a `done` flag to set on the final
/// production, and its state.
pub fn from_fn<T, S, F>(state: S, f: F) -> impl Generator<T>
where
    S: Send,
    F: FnMut(&Engine, &mut bool, &mut S) -> Step<T> + Send,
{
    FnGenerator {
        f,
        state,
        done: false,
    }
}

struct FnGenerator<S, F> {
    f: F,
    state: S,
    done: bool,
}

impl<T, S, F> Generator<T> for FnGenerator<S, F>
where
    S: Send,
    F: FnMut(&Engine, &mut bool, &mut S) -> Step<T> + Send,
{
    fn done(&self) -> bool {
        self.done
    }

    fn resume(&mut self, engine: &Engine) -> Step<T> {
        (self.f)(engine, &mut self.done, &mut self.state)
    }
}
