// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

/// Error taxonomy of the I/O layer.
///
/// Resource operations complete their futures *normally* with an `Err` of
/// this type; the scheduler itself never fabricates user-visible errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// An OS call failed.
    #[error("{0}")]
    Sys(SysError),

    /// A pending operation was aborted: local cancellation or peer hangup.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed buffered read, e.g. a delimiter that never arrived before
    /// the end of data.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A failed OS call: numeric code plus the context it failed in. The
/// human-readable OS message is rendered lazily, at display time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysError {
    pub context: &'static str,
    pub code: i32,
}

// === impl SysError ===

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.context,
            io::Error::from_raw_os_error(self.code)
        )
    }
}

impl std::error::Error for SysError {}

/// An OS error with explicit code.
pub(crate) fn sys(context: &'static str, code: i32) -> Error {
    Error::Sys(SysError { context, code })
}

/// The calling thread's last OS error.
pub(crate) fn last_os(context: &'static str) -> Error {
    sys(
        context,
        io::Error::last_os_error().raw_os_error().unwrap_or(0),
    )
}

/// Result of a read operation: the bytes read, or why they could not be.
pub type ReadResult = Result<Vec<u8>, Error>;

/// Result of a write operation.
pub type WriteResult = Result<(), Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn sys_error_renders_lazily() {
        let err = sys("open file for read", libc::ENOENT);
        let rendered = err.to_string();
        assert!(rendered.starts_with("open file for read: "));
        assert!(rendered.len() > "open file for read: ".len());
    }

    #[test]
    fn taxonomy_is_comparable() {
        assert_eq!(Error::Cancelled, Error::Cancelled);
        assert_ne!(Error::Cancelled, sys("x", 1));
        assert_eq!(sys("x", 1), sys("x", 1));
    }
}
