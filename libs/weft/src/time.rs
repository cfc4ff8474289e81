// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Time as an outside-future producer.

use std::thread;
use std::time::Duration;

use crate::engine::Engine;
use crate::future::Future;

/// Returns a future that completes with `value` after `duration` has
/// elapsed.
///
/// The completion comes from a dedicated timer thread, which hands the
/// result back to the scheduler through [`Engine::notify`] like any other
/// outside producer.
pub fn sleep<T>(engine: &Engine, duration: Duration, value: T) -> Future<T>
where
    T: Send + 'static,
{
    let future = Future::external();
    let handle = future.clone();
    let engine = engine.clone();
    thread::Builder::new()
        .name("weft-timer".into())
        .spawn(move || {
            thread::sleep(duration);
            tracing::trace!(?duration, "timer elapsed");
            handle.complete(value);
            engine.notify(&handle.any());
        })
        .expect("failed to spawn timer thread");
    future
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::combinator::await_blocking;

    #[test]
    fn sleep_completes_after_the_duration() {
        let engine = Engine::new(1);
        let started = Instant::now();
        let f = sleep(&engine, Duration::from_millis(25), "done");
        assert_eq!(await_blocking(&engine, &f), "done");
        assert!(started.elapsed() >= Duration::from_millis(25));
        engine.shutdown();
    }
}
