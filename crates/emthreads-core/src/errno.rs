//! Error number definitions.
//!
//! Every public operation in this crate reports failure as one of these
//! POSIX errno-style codes (0 is success). OSAL failures are folded onto the
//! nearest code by [`errno_of`] and returned to the immediate caller; no
//! error is swallowed.

use emthreads_osal::OsalError;

/// Operation not permitted (unlock of a mutex the caller does not own).
pub const EPERM: i32 = 1;
/// No such thread.
pub const ESRCH: i32 = 3;
/// Interrupted call. Internal to the cancellation machinery; public entry
/// points never return it.
pub const EINTR: i32 = 4;
/// Resource temporarily unavailable (key table or OSAL resources exhausted).
pub const EAGAIN: i32 = 11;
/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Object is in use (destroy of a locked mutex or waited-on condvar).
pub const EBUSY: i32 = 16;
/// Invalid argument or stale handle.
pub const EINVAL: i32 = 22;
/// Resource deadlock would occur (error-checking relock, self-join).
pub const EDEADLK: i32 = 35;
/// Function not implemented by the OSAL backend.
pub const ENOSYS: i32 = 38;
/// A timed operation's deadline elapsed.
pub const ETIMEDOUT: i32 = 110;

/// Returns the symbolic name for a code this crate can produce.
#[must_use]
pub const fn errno_name(code: i32) -> &'static str {
    match code {
        0 => "OK",
        EPERM => "EPERM",
        ESRCH => "ESRCH",
        EINTR => "EINTR",
        EAGAIN => "EAGAIN",
        ENOMEM => "ENOMEM",
        EBUSY => "EBUSY",
        EINVAL => "EINVAL",
        EDEADLK => "EDEADLK",
        ENOSYS => "ENOSYS",
        ETIMEDOUT => "ETIMEDOUT",
        _ => "unknown",
    }
}

/// Maps an OSAL failure onto the nearest POSIX code.
#[must_use]
pub const fn errno_of(err: OsalError) -> i32 {
    match err {
        OsalError::BadHandle => EINVAL,
        OsalError::OutOfMemory => ENOMEM,
        OsalError::NoResources => EAGAIN,
        OsalError::Unsupported => ENOSYS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_all_produced_codes() {
        for code in [
            EPERM, ESRCH, EINTR, EAGAIN, ENOMEM, EBUSY, EINVAL, EDEADLK, ENOSYS, ETIMEDOUT,
        ] {
            assert_ne!(errno_name(code), "unknown", "code {code} has no name");
        }
        assert_eq!(errno_name(0), "OK");
        assert_eq!(errno_name(9999), "unknown");
    }

    #[test]
    fn osal_errors_map_to_posix_codes() {
        assert_eq!(errno_of(OsalError::BadHandle), EINVAL);
        assert_eq!(errno_of(OsalError::OutOfMemory), ENOMEM);
        assert_eq!(errno_of(OsalError::NoResources), EAGAIN);
        assert_eq!(errno_of(OsalError::Unsupported), ENOSYS);
    }
}
