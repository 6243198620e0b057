//! POSIX errno constants and normalization.
//!
//! Embedders and handlers see the *negated* errno values, which is what the
//! FUSE protocol carries on the wire. Inside the crate all arithmetic uses
//! the positive POSIX number; the sign flip happens exactly once, at the
//! kernel boundary.

/// Operation not permitted.
pub const EPERM: i32 = -libc::EPERM;
/// No such file or directory.
pub const ENOENT: i32 = -libc::ENOENT;
/// Input/output error.
pub const EIO: i32 = -libc::EIO;
/// Permission denied.
pub const EACCES: i32 = -libc::EACCES;
/// File exists.
pub const EEXIST: i32 = -libc::EEXIST;
/// Not a directory.
pub const ENOTDIR: i32 = -libc::ENOTDIR;
/// Is a directory.
pub const EISDIR: i32 = -libc::EISDIR;
/// Invalid argument.
pub const EINVAL: i32 = -libc::EINVAL;
/// No space left on device.
pub const ENOSPC: i32 = -libc::ENOSPC;
/// Read-only file system.
pub const EROFS: i32 = -libc::EROFS;
/// Device or resource busy.
pub const EBUSY: i32 = -libc::EBUSY;
/// Directory not empty.
pub const ENOTEMPTY: i32 = -libc::ENOTEMPTY;

/// Largest errno the kernel understands. Anything outside (0, MAX_ERRNO]
/// after normalization is treated as a malformed report.
const MAX_ERRNO: i32 = 4095;

/// Normalize a handler-reported error code to a positive errno.
///
/// Handlers may report either the positive POSIX number or the already
/// negated form; both map to the same positive errno. Reports that cannot
/// be an errno at all (zero, or out of the kernel's range) become `EIO`.
pub(crate) fn normalize(raw: i32) -> i32 {
    let abs = raw.unsigned_abs();
    if abs == 0 || abs > MAX_ERRNO as u32 {
        libc::EIO
    } else {
        abs as i32
    }
}
