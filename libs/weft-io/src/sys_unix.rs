// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness polling on Unix: an edge-triggered, one-shot epoll instance
//! plus a stop pipe to unblock the reactor on shutdown.

use std::ffi::CString;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, last_os, sys};

pub(crate) type RawHandle = std::os::fd::RawFd;

/// Optimal I/O block size.
pub(crate) const OBS: usize = 4096;

/// Token carried in the epoll user data that identifies the stop pipe.
pub(crate) const STOP_TOKEN: usize = usize::MAX;

const EVENT_CAPACITY: usize = 64;

/// What the reactor delivers into a resource's engine-interrupt future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// Readiness event bits from the poller.
    Ready(u32),
    /// A synthetic completion posted by a local cancellation request.
    Cancelled,
}

impl Completion {
    /// Fabricated readiness for handles that cannot be polled: they never
    /// block, so reporting them ready is truthful.
    pub(crate) fn always_ready(interest: Interest) -> Self {
        Self::Ready(interest.bits())
    }
}

/// Which readiness to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Self::Read => flag(libc::EPOLLIN),
            Self::Write => flag(libc::EPOLLOUT),
        }
    }
}

/// libc event flags are `c_int` bit patterns; epoll carries them as `u32`.
#[expect(clippy::cast_sign_loss, reason = "bit pattern, not a number")]
const fn flag(bits: i32) -> u32 {
    bits as u32
}

/// The platform completion object: an epoll instance.
///
/// Registrations are one-shot: after each delivered event the owning
/// resource re-arms explicitly. The stop pipe's read end is registered
/// permanently; closing the write end hangs it up and unblocks
/// [`wait`](Poller::wait) for good.
pub(crate) struct Poller {
    epoll: RawHandle,
    stop_read: RawHandle,
    stop_write: AtomicI32,
}

// === impl Poller ===

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        // Safety: no preconditions.
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(last_os("initializing epoll"));
        }

        let mut pipe = [0 as RawHandle; 2];
        // Safety: `pipe` is a valid out-pointer for two descriptors.
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            let err = last_os("initializing stop pipe");
            // Safety: `epoll` is a descriptor we own.
            unsafe { libc::close(epoll) };
            return Err(err);
        }
        let [stop_read, stop_write] = pipe;

        let poller = Self {
            epoll,
            stop_read,
            stop_write: AtomicI32::new(stop_write),
        };
        // Registered without ONESHOT: the hangup must stay visible to every
        // subsequent wait.
        poller
            .ctl(libc::EPOLL_CTL_ADD, stop_read, flag(libc::EPOLLIN), STOP_TOKEN)
            .map_err(|code| sys("registering stop pipe", code))?;
        Ok(poller)
    }

    /// One-shot registration of `fd` under `token`.
    pub(crate) fn register(
        &self,
        fd: RawHandle,
        token: usize,
        interest: Interest,
    ) -> Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, oneshot_bits(interest), token)
    }

    /// Re-arms a one-shot registration that has fired.
    pub(crate) fn rearm(&self, fd: RawHandle, token: usize, interest: Interest) -> Result<(), i32> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, oneshot_bits(interest), token)
    }

    /// Removes `fd`. Failure is ignored; the descriptor may already be gone.
    pub(crate) fn deregister(&self, fd: RawHandle) {
        let mut unused = libc::epoll_event { events: 0, u64: 0 };
        // Safety: `epoll` is our descriptor, the event pointer is valid (and
        // only required for pre-2.6.9 kernels anyway).
        unsafe { libc::epoll_ctl(self.epoll, libc::EPOLL_CTL_DEL, fd, &mut unused) };
    }

    fn ctl(&self, op: i32, fd: RawHandle, events: u32, token: usize) -> Result<(), i32> {
        let mut event = libc::epoll_event {
            events,
            u64: token as u64,
        };
        // Safety: `epoll` is our descriptor and `event` is a valid epoll_event.
        if unsafe { libc::epoll_ctl(self.epoll, op, fd, &mut event) } != 0 {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
        } else {
            Ok(())
        }
    }

    /// Blocks for the next batch of events. `EINTR` is retried internally.
    pub(crate) fn wait(&self, out: &mut Vec<(usize, Completion)>) -> Result<(), Error> {
        out.clear();
        let mut events: [libc::epoll_event; EVENT_CAPACITY] =
            // Safety: epoll_event is plain old data; all-zeroes is valid.
            unsafe { std::mem::zeroed() };
        let capacity = i32::try_from(EVENT_CAPACITY).expect("event capacity fits i32");
        let count = loop {
            // Safety: the event buffer is valid for EVENT_CAPACITY entries.
            let n = unsafe { libc::epoll_wait(self.epoll, events.as_mut_ptr(), capacity, -1) };
            if n >= 0 {
                break usize::try_from(n).expect("non-negative event count");
            }
            let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if code != libc::EINTR {
                return Err(sys("epoll wait", code));
            }
        };
        for event in &events[..count] {
            let token = usize::try_from(event.u64).expect("epoll token fits usize");
            out.push((token, Completion::Ready(event.events)));
        }
        Ok(())
    }

    /// Signals shutdown by closing the stop pipe's write end, hanging up the
    /// read end the reactor has registered.
    pub(crate) fn stop(&self) {
        let fd = self.stop_write.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // Safety: we owned this descriptor until the swap.
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
        // Safety: both descriptors are owned by us and closed exactly once.
        unsafe {
            libc::close(self.stop_read);
            libc::close(self.epoll);
        }
    }
}

/// Outcome of one non-blocking syscall attempt.
pub(crate) enum Attempt {
    /// `read` returned 0 (end of data) or `write` is irrelevant here.
    Eod,
    /// Bytes transferred.
    Transferred(usize),
    /// The call would block; arm the reactor.
    WouldBlock,
    /// Peer hung up mid-operation.
    HungUp,
    /// Some other OS failure.
    Failed(i32),
}

/// One non-blocking `read(2)`, with `EINTR` retried.
pub(crate) fn read_once(fd: RawHandle, buf: &mut [u8]) -> Attempt {
    loop {
        // Safety: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            return Attempt::Transferred(usize::try_from(n).expect("non-negative read count"));
        }
        if n == 0 {
            return Attempt::Eod;
        }
        match io::Error::last_os_error().raw_os_error().unwrap_or(0) {
            libc::EINTR => {}
            libc::EAGAIN => return Attempt::WouldBlock,
            libc::ECONNRESET => return Attempt::HungUp,
            code => return Attempt::Failed(code),
        }
    }
}

/// One non-blocking `write(2)`, with `EINTR` retried.
pub(crate) fn write_once(fd: RawHandle, buf: &[u8]) -> Attempt {
    loop {
        // Safety: `buf` is valid for reads of `buf.len()` bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Attempt::Transferred(usize::try_from(n).expect("non-negative write count"));
        }
        match io::Error::last_os_error().raw_os_error().unwrap_or(0) {
            libc::EINTR => {}
            libc::EAGAIN => return Attempt::WouldBlock,
            libc::EPIPE | libc::ECONNRESET => return Attempt::HungUp,
            code => return Attempt::Failed(code),
        }
    }
}

fn oneshot_bits(interest: Interest) -> u32 {
    interest.bits() | flag(libc::EPOLLET) | flag(libc::EPOLLONESHOT)
}

fn c_path(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Protocol("path contains an interior NUL byte".into()))
}

/// Opens `path` for non-blocking reading.
pub(crate) fn open_read(path: &Path) -> Result<RawHandle, Error> {
    let path = c_path(path)?;
    // Safety: `path` is a valid NUL-terminated string.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(last_os("open file for read"));
    }
    Ok(fd)
}

/// Opens (creating if necessary) `path` for non-blocking writing.
pub(crate) fn open_write(path: &Path) -> Result<RawHandle, Error> {
    let path = c_path(path)?;
    // Safety: `path` is a valid NUL-terminated string.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_NONBLOCK | libc::O_CLOEXEC,
            libc::c_uint::from(0o666_u16),
        )
    };
    if fd < 0 {
        return Err(last_os("open file for write"));
    }
    Ok(fd)
}

/// Switches an adopted handle into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawHandle) -> Result<(), Error> {
    // Safety: querying flags of a descriptor we were handed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(last_os("query handle flags"));
    }
    // Safety: setting flags on the same descriptor.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(last_os("set handle non-blocking"));
    }
    Ok(())
}

pub(crate) fn close_handle(fd: RawHandle) {
    // Safety: the caller owns the descriptor and closes it exactly once.
    unsafe { libc::close(fd) };
}

/// Whether readiness bits carry an error/hangup condition without the
/// interest the operation armed for.
pub(crate) fn is_hangup(bits: u32, interest: Interest) -> bool {
    bits & (flag(libc::EPOLLHUP) | flag(libc::EPOLLERR)) != 0 && bits & interest.bits() == 0
}

// --- sockets ---

pub(crate) fn socket(addr: &SocketAddr, stype: i32, proto: i32) -> Result<RawHandle, Error> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // Safety: plain socket construction.
    let sock = unsafe { libc::socket(domain, stype, proto) };
    if sock < 0 {
        return Err(last_os("socket construction"));
    }
    if let Err(err) = set_nonblocking(sock) {
        close_handle(sock);
        return Err(err);
    }
    Ok(sock)
}

pub(crate) fn bind_listen(sock: RawHandle, addr: &SocketAddr, backlog: i32) -> Result<(), Error> {
    let (storage, len) = sockaddr_from(addr);
    // Safety: `storage` holds a valid sockaddr of length `len`.
    if unsafe { libc::bind(sock, (&raw const storage).cast(), len) } < 0 {
        return Err(last_os("bind"));
    }
    // Safety: `sock` is a bound socket.
    if unsafe { libc::listen(sock, backlog) } < 0 {
        return Err(last_os("listen"));
    }
    Ok(())
}

/// Outcome of one non-blocking `accept(2)`.
pub(crate) enum Accepted {
    Connection(RawHandle, Option<SocketAddr>),
    WouldBlock,
    /// Aborted before we got to it; just carry on.
    Retry,
    Failed(i32),
}

pub(crate) fn accept_once(sock: RawHandle) -> Accepted {
    // Safety: sockaddr_storage is plain old data; all-zeroes is valid.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = libc::socklen_t::try_from(std::mem::size_of::<libc::sockaddr_storage>())
        .expect("sockaddr_storage fits socklen_t");
    // Safety: `storage`/`len` form a valid out-parameter pair.
    let conn = unsafe { libc::accept(sock, (&raw mut storage).cast(), &raw mut len) };
    if conn >= 0 {
        if let Err(err) = set_nonblocking(conn) {
            tracing::debug!(%err, "dropping connection that refused non-blocking mode");
            close_handle(conn);
            return Accepted::Retry;
        }
        return Accepted::Connection(conn, sockaddr_to(&storage));
    }
    match io::Error::last_os_error().raw_os_error().unwrap_or(0) {
        libc::EINTR | libc::ECONNABORTED => Accepted::Retry,
        libc::EAGAIN => Accepted::WouldBlock,
        code => Accepted::Failed(code),
    }
}

pub(crate) fn local_addr(sock: RawHandle) -> Result<SocketAddr, Error> {
    // Safety: sockaddr_storage is plain old data; all-zeroes is valid.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = libc::socklen_t::try_from(std::mem::size_of::<libc::sockaddr_storage>())
        .expect("sockaddr_storage fits socklen_t");
    // Safety: `storage`/`len` form a valid out-parameter pair.
    if unsafe { libc::getsockname(sock, (&raw mut storage).cast(), &raw mut len) } < 0 {
        return Err(last_os("query socket name"));
    }
    sockaddr_to(&storage).ok_or_else(|| Error::Protocol("unsupported address family".into()))
}

/// Maps a delivered completion to a listener event. Error readiness fetches
/// the socket's pending error code.
pub(crate) fn listen_event(
    completion: Completion,
    sock: RawHandle,
) -> Option<crate::socket::ListenEvent> {
    use crate::socket::ListenEvent;
    match completion {
        Completion::Cancelled => Some(ListenEvent::Close),
        Completion::Ready(bits) if bits & flag(libc::EPOLLERR) != 0 => {
            Some(ListenEvent::Error(socket_error(sock)))
        }
        Completion::Ready(_) => Some(ListenEvent::Accept),
    }
}

pub(crate) fn socket_error(sock: RawHandle) -> i32 {
    let mut code: i32 = 0;
    let mut len = libc::socklen_t::try_from(std::mem::size_of::<i32>())
        .expect("i32 size fits socklen_t");
    // Safety: `code`/`len` form a valid out-parameter pair for SO_ERROR.
    unsafe {
        libc::getsockopt(
            sock,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut code).cast(),
            &raw mut len,
        )
    };
    code
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: sockaddr_storage is plain old data; all-zeroes is valid.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::sa_family_t::try_from(libc::AF_INET)
                    .expect("AF_INET fits sa_family_t"),
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_in fits inside sockaddr_storage.
            unsafe { (&raw mut storage).cast::<libc::sockaddr_in>().write(sin) };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::sa_family_t::try_from(libc::AF_INET6)
                    .expect("AF_INET6 fits sa_family_t"),
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // Safety: sockaddr_in6 fits inside sockaddr_storage.
            unsafe { (&raw mut storage).cast::<libc::sockaddr_in6>().write(sin6) };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (
        storage,
        libc::socklen_t::try_from(len).expect("sockaddr length fits socklen_t"),
    )
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            // Safety: family says this is a sockaddr_in.
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // Safety: family says this is a sockaddr_in6.
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Test-only pipe pair.
#[cfg(test)]
pub(crate) fn pipe() -> (RawHandle, RawHandle) {
    let mut fds = [0 as RawHandle; 2];
    // Safety: `fds` is a valid out-pointer for two descriptors.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    assert_eq!(rc, 0, "pipe2 failed");
    (fds[0], fds[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip() {
        let v4: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, _) = sockaddr_from(&v4);
        assert_eq!(sockaddr_to(&storage), Some(v4));

        let v6: SocketAddr = "[::1]:443".parse().unwrap();
        let (storage, _) = sockaddr_from(&v6);
        assert_eq!(sockaddr_to(&storage), Some(v6));
    }

    #[test]
    fn read_write_once_on_a_pipe() {
        let (r, w) = pipe();
        assert!(matches!(read_once(r, &mut [0; 16]), Attempt::WouldBlock));
        assert!(matches!(write_once(w, b"abc"), Attempt::Transferred(3)));
        let mut buf = [0; 16];
        assert!(matches!(read_once(r, &mut buf), Attempt::Transferred(3)));
        assert_eq!(&buf[..3], b"abc");
        close_handle(w);
        assert!(matches!(read_once(r, &mut buf), Attempt::Eod));
        close_handle(r);
    }
}
