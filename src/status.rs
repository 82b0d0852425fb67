//! The host framework's status taxonomy and the errno map.
//!
//! The user-space daemon reports failures as POSIX errnos on the wire; the
//! host framework consumes native statuses. [`status_from_errno`] is the pure
//! translation between the two. Everything else in the crate traffics in
//! [`Status`] only.

use thiserror::Error;

/// Native status codes understood by the host framework.
///
/// `Success` is a first-class value because it travels inside internal
/// responses, not just through `Result` error channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    /// The operation completed.
    #[error("success")]
    Success,
    /// A transact call carried malformed parameters.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The output buffer cannot hold a minimum-size request.
    #[error("buffer too small")]
    BufferTooSmall,
    /// A blocking wait was cancelled or timed out.
    #[error("cancelled")]
    Cancelled,
    /// Permission was denied, or the instance failed its handshake.
    #[error("access denied")]
    AccessDenied,
    /// The name does not exist under its parent.
    #[error("object name not found")]
    ObjectNameNotFound,
    /// The name already exists under its parent.
    #[error("object name collision")]
    ObjectNameCollision,
    /// A path component is not a directory.
    #[error("not a directory")]
    NotADirectory,
    /// The file is a directory.
    #[error("file is a directory")]
    FileIsADirectory,
    /// The daemon reported a generic I/O failure.
    #[error("io device error")]
    IoDeviceError,
    /// The daemon ran out of memory, file handles, or similar.
    #[error("insufficient resources")]
    InsufficientResources,
    /// The volume has no space left.
    #[error("disk full")]
    DiskFull,
    /// The volume is mounted read-only.
    #[error("media write protected")]
    MediaWriteProtected,
    /// The daemon does not implement the requested operation.
    #[error("not implemented")]
    NotImplemented,
    /// A directory was removed or renamed while non-empty.
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// The name exceeds what a minimum-size request can carry.
    #[error("object name invalid")]
    ObjectNameInvalid,
    /// The operation is recognized but not supported by the daemon.
    #[error("not supported")]
    NotSupported,
    /// The daemon took too long to answer.
    #[error("io timeout")]
    IoTimeout,
    /// The daemon no longer recognizes the inode or handle.
    #[error("invalid handle")]
    InvalidHandle,
}

impl Status {
    /// Whether this status reports success.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

/// Translate a FUSE wire errno into the host's native status.
///
/// The wire carries negative errnos per FUSE convention; positive values are
/// tolerated. Zero means success. Errnos without a specific mapping collapse
/// to [`Status::IoDeviceError`].
#[must_use]
pub fn status_from_errno(errno: i32) -> Status {
    match errno.unsigned_abs() as i32 {
        0 => Status::Success,
        libc::EPERM | libc::EACCES => Status::AccessDenied,
        libc::ENOENT => Status::ObjectNameNotFound,
        libc::EEXIST => Status::ObjectNameCollision,
        libc::ENOTDIR => Status::NotADirectory,
        libc::EISDIR => Status::FileIsADirectory,
        libc::EINVAL => Status::InvalidParameter,
        libc::ENFILE | libc::EMFILE | libc::ENOMEM => Status::InsufficientResources,
        libc::ENOSPC | libc::EDQUOT => Status::DiskFull,
        libc::EROFS => Status::MediaWriteProtected,
        libc::ENOSYS => Status::NotImplemented,
        libc::ENOTEMPTY => Status::DirectoryNotEmpty,
        libc::ENAMETOOLONG => Status::ObjectNameInvalid,
        libc::EOPNOTSUPP => Status::NotSupported,
        libc::ETIMEDOUT => Status::IoTimeout,
        libc::ESTALE | libc::EBADF => Status::InvalidHandle,
        _ => Status::IoDeviceError,
    }
}
