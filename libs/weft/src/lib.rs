// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperatively-scheduled task engine.
//!
//! User work is expressed as [`Generator`]s: resumable computations that on
//! each resume either *produce a value* or *yield a dependency* on another
//! [`Future`]. A fixed pool of worker threads resumes ready generators,
//! parks suspended ones in a wait/notify graph, and walks completions back
//! up arbitrarily long dependency chains without recursion.
//!
//! ```
//! use weft::{Engine, Step, combinator};
//!
//! let engine = Engine::new(2);
//! let f = engine.launch(weft::generator::from_fn((), |_, done, _| {
//!     *done = true;
//!     Step::Produced(21_u32)
//! }));
//! let doubled = engine.execute(combinator::then(&f, |v: u32| v * 2));
//! assert_eq!(combinator::await_blocking(&engine, &doubled), 42);
//! engine.shutdown();
//! ```
//!
//! Externally-completed futures ([`Future::external`]) integrate outside
//! event sources: a producer completes the future and calls
//! [`Engine::notify`], and the parked awaiter re-enters the scheduler
//! through an identity-redirect task.

mod engine;
mod future;
mod queue;

pub mod combinator;
pub mod generator;
pub mod time;

pub use engine::{Engine, defer};
pub use future::{AnyFuture, Future, FutureState};
pub use generator::{Generator, Step};
