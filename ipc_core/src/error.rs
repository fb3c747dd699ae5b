//! Library result codes and the system-errno mapper.
//!
//! The numeric values are part of the wire contract shared with every
//! client library; they are never renumbered. `contract_tests` pins them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result codes surfaced across the library boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Operation completed successfully
    #[error("Success")]
    Ok,

    /// Generic library failure
    #[error("Library error")]
    LibraryError,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Transient condition, retry later
    #[error("Try again")]
    TryAgain,

    /// Invalid parameter supplied by the caller
    #[error("Invalid parameter")]
    InvalidParam,

    /// Memory allocation failed
    #[error("Out of memory")]
    NoMemory,

    /// Handle is out of range, stale, or already destroyed
    #[error("Bad handle")]
    BadHandle,

    /// Resource is busy
    #[error("Resource busy")]
    Busy,

    /// Credentials rejected
    #[error("Access denied")]
    AccessDenied,

    /// Requested resource does not exist
    #[error("Not found")]
    NotFound,

    /// Endpoint or object name exceeds the supported length
    #[error("Name too long")]
    NameTooLong,

    /// Object already exists
    #[error("Already exists")]
    Exists,

    /// Buffer or channel has no space left
    #[error("No space")]
    NoSpace,

    /// Operation interrupted
    #[error("Interrupted")]
    Interrupted,

    /// Requested service or operation is not supported
    #[error("Not supported")]
    NotSupported,

    /// Malformed or corrupt message
    #[error("Message error")]
    MessageError,

    /// Queue is full
    #[error("Queue full")]
    QueueFull,

    /// Payload exceeds the negotiated maximum
    #[error("Message too big")]
    TooBig,
}

impl ErrorKind {
    /// Returns the stable numeric code for this result.
    pub const fn code(&self) -> i32 {
        match self {
            ErrorKind::Ok => 1,
            ErrorKind::LibraryError => 2,
            ErrorKind::Timeout => 5,
            ErrorKind::TryAgain => 6,
            ErrorKind::InvalidParam => 7,
            ErrorKind::NoMemory => 8,
            ErrorKind::BadHandle => 9,
            ErrorKind::Busy => 10,
            ErrorKind::AccessDenied => 11,
            ErrorKind::NotFound => 12,
            ErrorKind::NameTooLong => 13,
            ErrorKind::Exists => 14,
            ErrorKind::NoSpace => 15,
            ErrorKind::Interrupted => 16,
            ErrorKind::NotSupported => 19,
            ErrorKind::MessageError => 22,
            ErrorKind::QueueFull => 23,
            ErrorKind::TooBig => 26,
        }
    }

    /// Reconstructs a result from its stable numeric code.
    ///
    /// Unknown codes collapse to [`ErrorKind::LibraryError`] so a newer
    /// peer can never crash an older one.
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => ErrorKind::Ok,
            5 => ErrorKind::Timeout,
            6 => ErrorKind::TryAgain,
            7 => ErrorKind::InvalidParam,
            8 => ErrorKind::NoMemory,
            9 => ErrorKind::BadHandle,
            10 => ErrorKind::Busy,
            11 => ErrorKind::AccessDenied,
            12 => ErrorKind::NotFound,
            13 => ErrorKind::NameTooLong,
            14 => ErrorKind::Exists,
            15 => ErrorKind::NoSpace,
            16 => ErrorKind::Interrupted,
            19 => ErrorKind::NotSupported,
            22 => ErrorKind::MessageError,
            23 => ErrorKind::QueueFull,
            26 => ErrorKind::TooBig,
            _ => ErrorKind::LibraryError,
        }
    }

    /// Returns true for the success code.
    pub const fn is_ok(&self) -> bool {
        matches!(self, ErrorKind::Ok)
    }

    /// Converts the code into a `Result`, mapping `Ok` to `Ok(())`.
    pub fn into_result(self) -> Result<(), ErrorKind> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// Translates a negative system error code into a library result code.
///
/// Non-negative input means success. Negative input is matched by
/// magnitude against the errno table; anything unrecognized collapses to
/// [`ErrorKind::LibraryError`]. Total for every `i32`, including
/// `i32::MIN`.
pub fn to_library_error(code: i32) -> ErrorKind {
    if code >= 0 {
        return ErrorKind::Ok;
    }
    let errno = code.unsigned_abs() as i64;
    match errno as i32 {
        libc::ENOENT => ErrorKind::NotFound,
        libc::ENOMEM => ErrorKind::NoMemory,
        libc::ETIMEDOUT => ErrorKind::Timeout,
        libc::EAGAIN => ErrorKind::TryAgain,
        #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on Linux
        libc::EWOULDBLOCK => ErrorKind::TryAgain,
        libc::EINVAL => ErrorKind::InvalidParam,
        libc::EBUSY => ErrorKind::Busy,
        libc::EACCES => ErrorKind::AccessDenied,
        libc::EPERM => ErrorKind::AccessDenied,
        libc::ENAMETOOLONG => ErrorKind::NameTooLong,
        libc::EEXIST => ErrorKind::Exists,
        libc::ENOBUFS => ErrorKind::QueueFull,
        libc::ENOSPC => ErrorKind::NoSpace,
        libc::EINTR => ErrorKind::Interrupted,
        libc::ENOTSUP => ErrorKind::NotSupported,
        #[allow(unreachable_patterns)] // EOPNOTSUPP == ENOTSUP on Linux
        libc::EOPNOTSUPP => ErrorKind::NotSupported,
        libc::EBADMSG => ErrorKind::MessageError,
        libc::E2BIG => ErrorKind::TooBig,
        libc::EMSGSIZE => ErrorKind::TooBig,
        _ => ErrorKind::LibraryError,
    }
}

/// Maps an `std::io::Error` into a library result code through the errno
/// table, falling back to coarse `ErrorKind` buckets when the error
/// carries no raw OS code.
pub fn io_to_library_error(err: &std::io::Error) -> ErrorKind {
    if let Some(raw) = err.raw_os_error() {
        return to_library_error(-raw);
    }
    match err.kind() {
        std::io::ErrorKind::WouldBlock => ErrorKind::TryAgain,
        std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
        std::io::ErrorKind::Interrupted => ErrorKind::Interrupted,
        std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::LibraryError,
    }
}
