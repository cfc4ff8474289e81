// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interrupt (Ctrl-C) delivery as an outside-future producer.
//!
//! OS signal delivery is process-wide, so the handler state is a one-per-
//! process singleton behind [`CtrlC::on`]/[`CtrlC::un`]; it is deliberately
//! not part of the engine API.

use parking_lot::Mutex;
use weft::{Engine, Future};

use crate::error::Error;

/// Interrupt delivery entry points.
pub struct CtrlC;

static INSTALLED: Mutex<Option<Installed>> = Mutex::new(None);

struct Installed {
    handle: sys::StopHandle,
    thread: std::thread::JoinHandle<()>,
}

// === impl CtrlC ===

impl CtrlC {
    /// Prepares the process for interrupt handling. On Unix this masks the
    /// interrupt signal on the calling thread; call it from the main thread
    /// *before* constructing the engine, so every worker inherits the mask
    /// and delivery is funneled to the dedicated handler thread.
    pub fn setup() {
        sys::mask_on_current_thread();
    }

    /// Installs the process-wide interrupt handler and returns the future it
    /// fires.
    ///
    /// The future completes once per interrupt; the consumer re-arms it
    /// (see [`Future::rearm`]) to observe the next one. Interrupts arriving
    /// while the previous one is unconsumed coalesce. Installing twice
    /// without [`un`](CtrlC::un) in between is an error.
    pub fn on(engine: &Engine) -> Result<Future<()>, Error> {
        let mut installed = INSTALLED.lock();
        if installed.is_some() {
            return Err(Error::Protocol("interrupt handler already installed".into()));
        }

        let fired: Future<()> = Future::external();
        let (handle, thread) = sys::spawn_handler(engine.clone(), fired.clone())?;
        *installed = Some(Installed { handle, thread });
        tracing::debug!("interrupt handler installed");
        Ok(fired)
    }

    /// Uninstalls the handler: the handler thread exits and the future stops
    /// firing. A no-op when no handler is installed.
    pub fn un() {
        let Some(installed) = INSTALLED.lock().take() else {
            return;
        };
        installed.handle.stop();
        installed
            .thread
            .join()
            .expect("interrupt handler thread panicked");
        tracing::debug!("interrupt handler uninstalled");
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod sys {
            use signal_hook::consts::SIGINT;
            use signal_hook::iterator::Signals;
            use weft::{Engine, Future};

            use crate::error::Error;

            pub(super) struct StopHandle(signal_hook::iterator::Handle);

            impl StopHandle {
                pub(super) fn stop(&self) {
                    self.0.close();
                }
            }

            /// Blocks `SIGINT` for the calling thread (and, transitively,
            /// every thread it spawns afterwards).
            pub(super) fn mask_on_current_thread() {
                // Safety: sigset_t is plain old data; sigemptyset initializes it.
                unsafe {
                    let mut sigs: libc::sigset_t = std::mem::zeroed();
                    libc::sigemptyset(&raw mut sigs);
                    libc::sigaddset(&raw mut sigs, SIGINT);
                    libc::pthread_sigmask(libc::SIG_BLOCK, &raw const sigs, std::ptr::null_mut());
                }
            }

            /// Unblocks `SIGINT` for the calling thread only.
            fn unmask_on_current_thread() {
                // Safety: sigset_t is plain old data; sigemptyset initializes it.
                unsafe {
                    let mut sigs: libc::sigset_t = std::mem::zeroed();
                    libc::sigemptyset(&raw mut sigs);
                    libc::sigaddset(&raw mut sigs, SIGINT);
                    libc::pthread_sigmask(libc::SIG_UNBLOCK, &raw const sigs, std::ptr::null_mut());
                }
            }

            pub(super) fn spawn_handler(
                engine: Engine,
                fired: Future<()>,
            ) -> Result<(StopHandle, std::thread::JoinHandle<()>), Error> {
                let mut signals = Signals::new([SIGINT])
                    .map_err(|err| sys_from(&err, "install interrupt handler"))?;
                let handle = StopHandle(signals.handle());

                let thread = std::thread::Builder::new()
                    .name("weft-ctrlc".into())
                    .spawn(move || {
                        // workers inherit the process mask; this thread is
                        // the one place the signal may land
                        unmask_on_current_thread();
                        for signal in signals.forever() {
                            if signal != SIGINT {
                                continue;
                            }
                            tracing::debug!("interrupt received");
                            if fired.try_complete(()) {
                                engine.notify(&fired.any());
                            }
                        }
                        tracing::debug!("interrupt handler thread exiting");
                    })
                    .map_err(|err| sys_from(&err, "spawn interrupt handler thread"))?;

                Ok((handle, thread))
            }

            fn sys_from(err: &std::io::Error, context: &'static str) -> Error {
                crate::error::sys(context, err.raw_os_error().unwrap_or(0))
            }
        }
    } else {
        mod sys {
            use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
            use weft::{Engine, Future};
            use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, TRUE};
            use windows_sys::Win32::System::Console::{
                CTRL_C_EVENT, CTRL_CLOSE_EVENT, SetConsoleCtrlHandler,
            };
            use windows_sys::Win32::System::Threading::{
                CreateEventW, INFINITE, SetEvent, WaitForSingleObject,
            };

            use crate::error::{Error, last_os};

            /// The auto-reset event the console handler signals. Process-wide
            /// because console control callbacks are.
            static EVENT: AtomicIsize = AtomicIsize::new(0);
            static STOPPING: AtomicBool = AtomicBool::new(false);

            pub(super) struct StopHandle(());

            impl StopHandle {
                pub(super) fn stop(&self) {
                    STOPPING.store(true, Ordering::Release);
                    let event = EVENT.load(Ordering::Acquire) as HANDLE;
                    if !event.is_null() {
                        // Safety: the event handle is owned by this module.
                        unsafe { SetEvent(event) };
                    }
                }
            }

            pub(super) fn mask_on_current_thread() {}

            /// Safety: invoked by the OS on its console-control thread.
            unsafe extern "system" fn handler(kind: u32) -> i32 {
                match kind {
                    CTRL_C_EVENT | CTRL_CLOSE_EVENT => {
                        let event = EVENT.load(Ordering::Acquire) as HANDLE;
                        if event.is_null() {
                            return 0;
                        }
                        // Safety: the event handle is owned by this module.
                        unsafe { SetEvent(event) };
                        1
                    }
                    _ => 0,
                }
            }

            pub(super) fn spawn_handler(
                engine: Engine,
                fired: Future<()>,
            ) -> Result<(StopHandle, std::thread::JoinHandle<()>), Error> {
                // Safety: plain event construction.
                let event = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
                if event.is_null() || event == INVALID_HANDLE_VALUE {
                    return Err(last_os("create interrupt event"));
                }
                EVENT.store(event as isize, Ordering::Release);
                STOPPING.store(false, Ordering::Release);

                // Safety: `handler` is a valid console control callback.
                if unsafe { SetConsoleCtrlHandler(Some(handler), TRUE) } == 0 {
                    return Err(last_os("set console control handler"));
                }

                let thread = std::thread::Builder::new()
                    .name("weft-ctrlc".into())
                    .spawn(move || {
                        loop {
                            // Safety: the event handle outlives this thread.
                            unsafe { WaitForSingleObject(event, INFINITE) };
                            if STOPPING.load(Ordering::Acquire) {
                                break;
                            }
                            tracing::debug!("interrupt received");
                            if fired.try_complete(()) {
                                engine.notify(&fired.any());
                            }
                        }
                        EVENT.store(0, Ordering::Release);
                        // Safety: the event handle is owned by this module.
                        unsafe { CloseHandle(event) };
                        tracing::debug!("interrupt handler thread exiting");
                    })
                    .expect("failed to spawn interrupt handler thread");

                Ok((StopHandle(()), thread))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use weft::combinator::{await_blocking, then};

    use super::*;

    #[test]
    fn fires_once_per_interrupt_until_uninstalled() {
        CtrlC::setup();
        let engine = Engine::new(2);

        let fired = CtrlC::on(&engine).unwrap();
        assert!(matches!(CtrlC::on(&engine), Err(Error::Protocol(_))));

        // process-directed, so it lands on the one thread that unblocked it
        // Safety: sends SIGINT to ourselves; the installed handler absorbs it.
        unsafe { libc::kill(libc::getpid(), libc::SIGINT) };
        let observed = engine.execute(then(&fired, |()| 1_u8));
        assert_eq!(await_blocking(&engine, &observed), 1);

        // re-arm and fire again
        fired.rearm();
        std::thread::sleep(Duration::from_millis(10));
        // Safety: as above.
        unsafe { libc::kill(libc::getpid(), libc::SIGINT) };
        let observed = engine.execute(then(&fired, |()| 2_u8));
        assert_eq!(await_blocking(&engine, &observed), 2);

        CtrlC::un();
        CtrlC::un();
        engine.shutdown();
    }
}
