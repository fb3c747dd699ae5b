//! Result-code contract
//!
//! The numeric codes travel in response frames and handshake rejections,
//! so they are a wire contract shared with older peers: codes are never
//! renumbered, only appended.

use ipc_core::ErrorKind;

/// The stable code table. Appending is allowed; renumbering is not.
pub const RESULT_CODE_TABLE: &[(ErrorKind, i32)] = &[
    (ErrorKind::Ok, 1),
    (ErrorKind::LibraryError, 2),
    (ErrorKind::Timeout, 5),
    (ErrorKind::TryAgain, 6),
    (ErrorKind::InvalidParam, 7),
    (ErrorKind::NoMemory, 8),
    (ErrorKind::BadHandle, 9),
    (ErrorKind::Busy, 10),
    (ErrorKind::AccessDenied, 11),
    (ErrorKind::NotFound, 12),
    (ErrorKind::NameTooLong, 13),
    (ErrorKind::Exists, 14),
    (ErrorKind::NoSpace, 15),
    (ErrorKind::Interrupted, 16),
    (ErrorKind::NotSupported, 19),
    (ErrorKind::MessageError, 22),
    (ErrorKind::QueueFull, 23),
    (ErrorKind::TooBig, 26),
];

#[cfg(test)]
mod tests {
    use super::*;
    use ipc_core::error::to_library_error;

    #[test]
    fn test_codes_pinned() {
        for (kind, code) in RESULT_CODE_TABLE {
            assert_eq!(kind.code(), *code, "{kind:?} renumbered");
        }
    }

    #[test]
    fn test_codes_round_trip() {
        for (kind, code) in RESULT_CODE_TABLE {
            assert_eq!(ErrorKind::from_code(*code), *kind);
        }
    }

    #[test]
    fn test_unknown_code_collapses_to_library_error() {
        assert_eq!(ErrorKind::from_code(0), ErrorKind::LibraryError);
        assert_eq!(ErrorKind::from_code(999), ErrorKind::LibraryError);
        assert_eq!(ErrorKind::from_code(-1), ErrorKind::LibraryError);
    }

    #[test]
    fn test_errno_mapping_contract() {
        assert_eq!(to_library_error(0), ErrorKind::Ok);
        assert_eq!(to_library_error(17), ErrorKind::Ok);
        assert_eq!(to_library_error(-libc::ENOENT), ErrorKind::NotFound);
        assert_eq!(to_library_error(-libc::EAGAIN), ErrorKind::TryAgain);
        assert_eq!(to_library_error(-libc::ETIMEDOUT), ErrorKind::Timeout);
        assert_eq!(to_library_error(-libc::EACCES), ErrorKind::AccessDenied);
        assert_eq!(to_library_error(-libc::EPERM), ErrorKind::AccessDenied);
        assert_eq!(to_library_error(-9999), ErrorKind::LibraryError);
    }
}
