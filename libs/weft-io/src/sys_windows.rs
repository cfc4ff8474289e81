// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Completion-based I/O on Windows: an I/O completion port whose overlapped
//! records carry the owning resource's token. Shutdown posts a distinguished
//! completion key.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_HANDLE_EOF, ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE, GetLastError,
    HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_OVERLAPPED, OPEN_ALWAYS, OPEN_EXISTING, ReadFile, WriteFile,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED, PostQueuedCompletionStatus,
};

use crate::error::{Error, last_os, sys};
use crate::resource::Shared;
use crate::socket::ListenEvent;

pub(crate) type RawHandle = isize;

pub(crate) const OBS: usize = 4096;
pub(crate) const STOP_TOKEN: usize = usize::MAX;

pub(crate) const ERROR_EOF: i32 = ERROR_HANDLE_EOF as i32;

const KEY_STOP: usize = 1;
const KEY_IO: usize = 2;

/// What the reactor delivers into a resource's engine-interrupt future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// An overlapped operation finished.
    Done { ok: bool, transferred: u32, err: i32 },
    /// A synthetic completion posted by a local cancellation request.
    Cancelled,
}

/// Per-resource overlapped bookkeeping. The record lives inside the
/// resource's shared allocation, so its address is stable for the kernel.
pub(crate) struct WindowsState {
    inner: Mutex<WindowsInner>,
}

struct WindowsInner {
    record: Box<OverlappedRecord>,
    /// File offset of the next operation.
    offset: u64,
    /// In-flight transfer buffer; the kernel writes into (or reads out of)
    /// this while the operation is pending.
    buffer: Vec<u8>,
}

#[repr(C)]
struct OverlappedRecord {
    overlapped: OVERLAPPED,
    token: usize,
}

// === impl WindowsState ===

impl WindowsState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(WindowsInner {
                // Safety: OVERLAPPED is plain old data; all-zeroes is valid.
                record: Box::new(OverlappedRecord {
                    overlapped: unsafe { std::mem::zeroed() },
                    token: 0,
                }),
                offset: 0,
                buffer: vec![0; OBS],
            }),
        }
    }

    /// Copies a finished read out of the in-flight buffer.
    pub(crate) fn consume_read(&self, data: &mut Vec<u8>, transferred: u32) {
        let mut inner = self.inner.lock();
        let count = usize::try_from(transferred).expect("transfer count fits usize");
        data.extend_from_slice(&inner.buffer[..count.min(OBS)]);
        inner.offset += u64::from(transferred);
    }

    pub(crate) fn advance(&self, transferred: u32) {
        self.inner.lock().offset += u64::from(transferred);
    }
}

/// Outcome of starting an overlapped operation.
pub(crate) enum Started {
    /// In flight; a completion will arrive through the port.
    Pending,
    Eod,
    Failed(i32),
}

/// Associates a freshly adopted resource handle with the reactor's port and
/// stamps its overlapped record with its registry token.
pub(crate) fn associate(shared: &Arc<Shared>) {
    let reactor = shared.reactor().clone();
    let token = reactor.add_sink(Arc::downgrade(shared) as std::sync::Weak<dyn crate::reactor::EventSink>);
    shared.windows.inner.lock().record.token = token;
    // Safety: both handles are live; association has no other preconditions.
    unsafe {
        CreateIoCompletionPort(shared.handle as HANDLE, reactor.poller().port as HANDLE, KEY_IO, 0)
    };
}

/// Starts an overlapped read of up to `want` bytes.
pub(crate) fn start_read(shared: &Arc<Shared>, want: usize) -> Started {
    let mut guard = shared.windows.inner.lock();
    let inner = &mut *guard;
    let offset = inner.offset;
    let record = &mut *inner.record;
    record.overlapped.Anonymous.Anonymous.Offset = (offset & 0xFFFF_FFFF) as u32;
    record.overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
    let len = u32::try_from(want.min(OBS)).expect("buffer length fits u32");

    // Safety: the buffer and the overlapped record are owned by the shared
    // allocation and outlive the operation; one operation in flight per
    // resource is enforced by the generator state machine.
    let ok = unsafe {
        ReadFile(
            shared.handle as HANDLE,
            inner.buffer.as_mut_ptr(),
            len,
            std::ptr::null_mut(),
            &raw mut record.overlapped,
        )
    };
    started_from(ok)
}

/// Starts an overlapped write of `data`.
pub(crate) fn start_write(shared: &Arc<Shared>, data: &[u8]) -> Started {
    let mut guard = shared.windows.inner.lock();
    let inner = &mut *guard;
    let count = data.len().min(OBS);
    inner.buffer[..count].copy_from_slice(&data[..count]);
    let offset = inner.offset;
    let record = &mut *inner.record;
    record.overlapped.Anonymous.Anonymous.Offset = (offset & 0xFFFF_FFFF) as u32;
    record.overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
    let len = u32::try_from(count).expect("buffer length fits u32");

    // Safety: as in `start_read`.
    let ok = unsafe {
        WriteFile(
            shared.handle as HANDLE,
            inner.buffer.as_ptr(),
            len,
            std::ptr::null_mut(),
            &raw mut record.overlapped,
        )
    };
    started_from(ok)
}

fn started_from(ok: i32) -> Started {
    // Even a synchronous return queues a completion to the port; treat both
    // as pending so there is exactly one consumption path.
    if ok != 0 {
        return Started::Pending;
    }
    // Safety: querying the calling thread's last error.
    match unsafe { GetLastError() } {
        ERROR_IO_PENDING => Started::Pending,
        ERROR_HANDLE_EOF => Started::Eod,
        code => Started::Failed(code as i32),
    }
}

/// The platform completion object: an I/O completion port.
pub(crate) struct Poller {
    pub(crate) port: RawHandle,
}

// === impl Poller ===

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        // Safety: plain port construction.
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(last_os("initializing completion port"));
        }
        Ok(Self {
            port: port as RawHandle,
        })
    }

    /// Blocks for the next completion.
    pub(crate) fn wait(&self, out: &mut Vec<(usize, Completion)>) -> Result<(), Error> {
        out.clear();
        let mut transferred: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
        // Safety: all out-pointers are valid for the duration of the call.
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.port as HANDLE,
                &raw mut transferred,
                &raw mut key,
                &raw mut overlapped,
                u32::MAX,
            )
        };
        if key == KEY_STOP {
            out.push((STOP_TOKEN, Completion::Cancelled));
            return Ok(());
        }
        if overlapped.is_null() {
            // port failure without a dequeued completion
            return Err(last_os("completion port wait"));
        }
        // Safety: every overlapped pointer passed to this port is the first
        // field of an OverlappedRecord owned by a live registration.
        let token = unsafe { (*overlapped.cast::<OverlappedRecord>()).token };
        // Safety: querying the calling thread's last error.
        let err = if ok == 0 { unsafe { GetLastError() } as i32 } else { 0 };
        out.push((
            token,
            Completion::Done {
                ok: ok != 0,
                transferred,
                err,
            },
        ));
        Ok(())
    }

    pub(crate) fn stop(&self) {
        // Safety: posting to a port we own.
        unsafe {
            PostQueuedCompletionStatus(self.port as HANDLE, 0, KEY_STOP, std::ptr::null_mut())
        };
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Safety: the port handle is owned and closed exactly once.
        unsafe { CloseHandle(self.port as HANDLE) };
    }
}

pub(crate) fn open_read(path: &Path) -> Result<RawHandle, Error> {
    create_file(path, GENERIC_READ, OPEN_EXISTING)
}

pub(crate) fn open_write(path: &Path) -> Result<RawHandle, Error> {
    create_file(path, GENERIC_WRITE, OPEN_ALWAYS)
}

fn create_file(path: &Path, access: u32, disposition: u32) -> Result<RawHandle, Error> {
    use std::os::windows::ffi::OsStrExt;
    let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
    wide.push(0);
    // Safety: `wide` is a valid NUL-terminated wide string.
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            access,
            0,
            std::ptr::null(),
            disposition,
            FILE_FLAG_OVERLAPPED,
            std::ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(last_os("open file"));
    }
    Ok(handle as RawHandle)
}

/// Overlapped handles need no non-blocking flag; adoption is a no-op.
pub(crate) fn set_nonblocking(_handle: RawHandle) -> Result<(), Error> {
    Ok(())
}

pub(crate) fn close_handle(handle: RawHandle) {
    // Safety: the caller owns the handle and closes it exactly once.
    unsafe { CloseHandle(handle as HANDLE) };
}

pub(crate) fn wsa_startup() -> Result<(), Error> {
    // Safety: WSADATA is plain old data; WSAStartup initializes it.
    let code = unsafe {
        let mut data: WinSock::WSADATA = std::mem::zeroed();
        WinSock::WSAStartup(0x0202, &raw mut data)
    };
    if code != 0 {
        return Err(sys("WSA startup", code));
    }
    Ok(())
}

pub(crate) fn wsa_cleanup() {
    // Safety: paired with a successful WSAStartup.
    unsafe { WinSock::WSACleanup() };
}

// --- sockets ---

/// Room for one padded sockaddr, as AcceptEx demands.
const ADDR_PAD: usize = 128 + 16;

const INVALID_SOCKET: RawHandle = -1;

/// Per-listener overlapped bookkeeping: the one in-flight `AcceptEx` and the
/// socket it will hand the next connection to.
pub(crate) struct ListenerState {
    inner: Mutex<ListenerInner>,
}

struct ListenerInner {
    record: Box<OverlappedRecord>,
    family: i32,
    stype: i32,
    proto: i32,
    /// Socket the pending `AcceptEx` targets; `INVALID_SOCKET` when idle.
    pending: RawHandle,
    addr_buf: Box<[u8; 2 * ADDR_PAD]>,
}

// === impl ListenerState ===

impl ListenerState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ListenerInner {
                // Safety: OVERLAPPED is plain old data; all-zeroes is valid.
                record: Box::new(OverlappedRecord {
                    overlapped: unsafe { std::mem::zeroed() },
                    token: 0,
                }),
                family: 0,
                stype: 0,
                proto: 0,
                pending: INVALID_SOCKET,
                addr_buf: Box::new([0; 2 * ADDR_PAD]),
            }),
        }
    }
}

fn family_of(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => WinSock::AF_INET as i32,
        SocketAddr::V6(_) => WinSock::AF_INET6 as i32,
    }
}

fn overlapped_socket(family: i32, stype: i32, proto: i32) -> Result<RawHandle, Error> {
    // Safety: plain socket construction.
    let sock = unsafe {
        WinSock::WSASocketW(
            family,
            stype,
            proto,
            std::ptr::null(),
            0,
            WinSock::WSA_FLAG_OVERLAPPED,
        )
    };
    if sock == WinSock::INVALID_SOCKET {
        // Safety: querying the thread's last WSA error.
        return Err(sys("WSA socket construction", unsafe { WinSock::WSAGetLastError() }));
    }
    Ok(sock as RawHandle)
}

pub(crate) fn socket(
    addr: &SocketAddr,
    stype: i32,
    proto: i32,
    state: &ListenerState,
) -> Result<RawHandle, Error> {
    let family = family_of(addr);
    let sock = overlapped_socket(family, stype, proto)?;
    let mut inner = state.inner.lock();
    inner.family = family;
    inner.stype = stype;
    inner.proto = proto;
    Ok(sock)
}

fn sockaddr_from(addr: &SocketAddr) -> ([u8; ADDR_PAD], i32) {
    let mut buf = [0_u8; ADDR_PAD];
    match addr {
        SocketAddr::V4(v4) => {
            let sin = WinSock::SOCKADDR_IN {
                sin_family: WinSock::AF_INET,
                sin_port: v4.port().to_be(),
                sin_addr: WinSock::IN_ADDR {
                    S_un: WinSock::IN_ADDR_0 {
                        S_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                },
                sin_zero: [0; 8],
            };
            let len = std::mem::size_of::<WinSock::SOCKADDR_IN>();
            // Safety: SOCKADDR_IN fits in the padded buffer.
            unsafe { buf.as_mut_ptr().cast::<WinSock::SOCKADDR_IN>().write_unaligned(sin) };
            (buf, len as i32)
        }
        SocketAddr::V6(v6) => {
            let sin6 = WinSock::SOCKADDR_IN6 {
                sin6_family: WinSock::AF_INET6,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: WinSock::IN6_ADDR {
                    u: WinSock::IN6_ADDR_0 {
                        Byte: v6.ip().octets(),
                    },
                },
                Anonymous: WinSock::SOCKADDR_IN6_0 {
                    sin6_scope_id: v6.scope_id(),
                },
            };
            let len = std::mem::size_of::<WinSock::SOCKADDR_IN6>();
            // Safety: SOCKADDR_IN6 fits in the padded buffer.
            unsafe { buf.as_mut_ptr().cast::<WinSock::SOCKADDR_IN6>().write_unaligned(sin6) };
            (buf, len as i32)
        }
    }
}

pub(crate) fn bind_listen(sock: RawHandle, addr: &SocketAddr, _backlog: i32) -> Result<(), Error> {
    let (storage, len) = sockaddr_from(addr);
    // Safety: `storage` holds a valid sockaddr of length `len`.
    if unsafe { WinSock::bind(sock as usize, storage.as_ptr().cast(), len) } == WinSock::SOCKET_ERROR
    {
        // Safety: querying the thread's last WSA error.
        return Err(sys("WSA bind", unsafe { WinSock::WSAGetLastError() }));
    }
    // Safety: `sock` is a bound socket.
    if unsafe { WinSock::listen(sock as usize, WinSock::SOMAXCONN as i32) } == WinSock::SOCKET_ERROR
    {
        // Safety: querying the thread's last WSA error.
        return Err(sys("WSA listen", unsafe { WinSock::WSAGetLastError() }));
    }
    Ok(())
}

/// Associates the listening socket with the reactor's port and stamps the
/// listener's overlapped record with its registry token.
pub(crate) fn associate_listener(
    reactor: &crate::reactor::Reactor,
    sock: RawHandle,
    token: usize,
    state: &ListenerState,
) -> Result<(), Error> {
    state.inner.lock().record.token = token;
    // Safety: both handles are live; association has no other preconditions.
    let port = unsafe {
        CreateIoCompletionPort(sock as HANDLE, reactor.poller().port as HANDLE, KEY_IO, 0)
    };
    if port.is_null() {
        return Err(last_os("associate listener with completion port"));
    }
    Ok(())
}

/// Issues the next `AcceptEx` if none is in flight.
pub(crate) fn start_accept(state: &ListenerState, listen_sock: RawHandle) -> Result<(), Error> {
    let mut inner = state.inner.lock();
    if inner.pending != INVALID_SOCKET {
        return Ok(());
    }
    let conn = overlapped_socket(inner.family, inner.stype, inner.proto)?;
    inner.pending = conn;

    let mut received: u32 = 0;
    let inner = &mut *inner;
    // Safety: the address buffer and overlapped record live in the shared
    // allocation; one AcceptEx in flight per listener is enforced above.
    let ok = unsafe {
        WinSock::AcceptEx(
            listen_sock as usize,
            conn as usize,
            inner.addr_buf.as_mut_ptr().cast(),
            0,
            ADDR_PAD as u32,
            ADDR_PAD as u32,
            &raw mut received,
            &raw mut inner.record.overlapped,
        )
    };
    if ok == 0 {
        // Safety: querying the thread's last WSA error.
        let code = unsafe { WinSock::WSAGetLastError() };
        if code != WinSock::WSA_IO_PENDING {
            close_handle(inner.pending);
            inner.pending = INVALID_SOCKET;
            return Err(sys("AcceptEx", code));
        }
    }
    Ok(())
}

/// Takes the connection the completed `AcceptEx` produced, inheriting the
/// listening socket's context.
pub(crate) fn take_accepted(
    state: &ListenerState,
    listen_sock: RawHandle,
) -> Option<(RawHandle, Option<SocketAddr>)> {
    let mut inner = state.inner.lock();
    if inner.pending == INVALID_SOCKET {
        return None;
    }
    let conn = std::mem::replace(&mut inner.pending, INVALID_SOCKET);
    let listen = listen_sock as usize;
    // Safety: SO_UPDATE_ACCEPT_CONTEXT takes the listening socket by value.
    unsafe {
        WinSock::setsockopt(
            conn as usize,
            WinSock::SOL_SOCKET,
            WinSock::SO_UPDATE_ACCEPT_CONTEXT,
            (&raw const listen).cast(),
            std::mem::size_of::<usize>() as i32,
        )
    };
    Some((conn, None))
}

pub(crate) fn local_addr(sock: RawHandle) -> Result<SocketAddr, Error> {
    use std::net::{Ipv4Addr, SocketAddrV4};
    let mut storage = [0_u8; ADDR_PAD];
    let mut len = ADDR_PAD as i32;
    // Safety: `storage`/`len` form a valid out-parameter pair.
    if unsafe { WinSock::getsockname(sock as usize, storage.as_mut_ptr().cast(), &raw mut len) }
        == WinSock::SOCKET_ERROR
    {
        // Safety: querying the thread's last WSA error.
        return Err(sys("query socket name", unsafe { WinSock::WSAGetLastError() }));
    }
    // Safety: getsockname wrote a sockaddr into the buffer.
    let sin = unsafe { storage.as_ptr().cast::<WinSock::SOCKADDR_IN>().read_unaligned() };
    if sin.sin_family != WinSock::AF_INET {
        return Err(Error::Protocol("unsupported address family".into()));
    }
    // Safety: the union variant is the plain 32-bit address.
    let ip = unsafe { sin.sin_addr.S_un.S_addr };
    Ok(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(ip.to_ne_bytes()),
        u16::from_be(sin.sin_port),
    )))
}

pub(crate) fn listen_event(completion: Completion, _sock: RawHandle) -> Option<ListenEvent> {
    match completion {
        Completion::Cancelled => Some(ListenEvent::Close),
        Completion::Done { ok: true, .. } => Some(ListenEvent::Accept),
        Completion::Done { ok: false, err, .. } => Some(ListenEvent::Error(err)),
    }
}
