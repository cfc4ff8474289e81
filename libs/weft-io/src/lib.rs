// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous I/O for the [`weft`] engine.
//!
//! A per-platform [`Reactor`] (completion port on Windows, readiness poll on
//! Unix) runs on its own thread and drives externally-completed futures:
//! each event is routed to the owning [`Resource`], whose engine-interrupt
//! future is completed and handed back to the scheduler via
//! [`weft::Engine::notify`]. The reactor never executes user generators.
//!
//! Resources expose primitive non-blocking reads and writes as futures, a
//! buffered surface (sized reads, peeking, delimiter-terminated reads, a
//! deferred [`Writer`]), listening sockets, and interrupt delivery
//! ([`CtrlC`]).

mod buffered;
mod error;
mod interrupt;
mod reactor;
mod resource;
mod socket;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod sys_unix;
        pub(crate) use self::sys_unix as sys;
    } else {
        mod sys_windows;
        pub(crate) use self::sys_windows as sys;
    }
}

pub use buffered::Writer;
pub use error::{Error, ReadResult, SysError, WriteResult};
pub use interrupt::CtrlC;
pub use reactor::Reactor;
pub use resource::Resource;
pub use socket::{Listener, NetStartup, ShouldStop, net_listen};
