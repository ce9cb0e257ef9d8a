//! The single tagged error type returned by every library crate in the
//! workspace. Daemon binaries wrap these in `anyhow` at the top level only.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad id, blob offset out of range, pattern too long,
    /// count over limit.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Policy or tracker bounds exceeded.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Container id, tracker, or cache key absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Pattern compilation hit a complexity cap.
    #[error("pattern compilation failed: {0}")]
    CompileFailed(String),

    /// Imported profile or wire payload failed structural checks.
    #[error("invalid blob: {0}")]
    InvalidBlob(String),

    /// Layer composition aborted.
    #[error("rootfs setup failed: {0}")]
    RootfsSetup(String),

    /// Underlying read/write/stat/socket failure.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// Platform feature not present; degrades to a no-op where the caller
    /// permits, surfaces otherwise.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Last-resort bucket.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map a raw OS errno onto the taxonomy. Known values get a precise
    /// kind; everything else surfaces as `Io` with the original errno.
    pub fn from_errno(errno: i32, what: &str) -> Self {
        match errno {
            libc::ENOENT => Self::NotFound(format!("{what}: no such file or directory")),
            libc::EINVAL => Self::InvalidArgument(format!("{what}: invalid argument")),
            libc::ENAMETOOLONG => Self::InvalidArgument(format!("{what}: name too long")),
            libc::ENOSPC | libc::E2BIG => Self::Capacity(format!("{what}: out of space")),
            libc::ENOSYS | libc::EOPNOTSUPP => {
                Self::Unavailable(format!("{what}: not supported by this kernel"))
            }
            _ => Self::Io(io::Error::from_raw_os_error(errno)),
        }
    }

    /// True when retrying the same operation cannot succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_maps_to_taxonomy() {
        assert!(matches!(
            Error::from_errno(libc::ENOENT, "stat"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            Error::from_errno(libc::EINVAL, "mount"),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(
            Error::from_errno(libc::ENOSYS, "bpf"),
            Error::Unavailable(_)
        ));
        assert!(matches!(
            Error::from_errno(libc::EACCES, "open"),
            Error::Io(_)
        ));
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_permanent());
    }
}
