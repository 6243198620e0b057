//! Filesystem handler contract.

use crate::reply::{DirReply, OpenReply, ReadReply, StatReply, UnitReply, WriteReply};

/// Handler for the filesystem operations of one mount.
///
/// Implementors provide the actual filesystem logic. Operations run on the
/// mount's handler environment thread and are asynchronous: each receives a
/// reply object that must be used exactly once, and the operation may return
/// before doing so (stash the reply and complete it later from anywhere).
/// A reply that is dropped unused fails the request with `EIO`.
///
/// Operations share the environment's single thread, so they should return
/// promptly and defer long work behind the reply; an operation that never
/// returns wedges the environment for every other request.
///
/// The default implementation answers `ENOSYS` for every operation, so a
/// handler only implements what its hierarchy supports.
pub trait FilesystemHandler: Send + 'static {
    /// Get file attributes.
    fn getattr(&self, _path: &str, reply: StatReply) {
        reply.error(libc::ENOSYS);
    }

    /// List directory entry names. `.` and `..` are supplied by the bridge.
    fn readdir(&self, _path: &str, reply: DirReply) {
        reply.error(libc::ENOSYS);
    }

    /// Open a file, yielding the handle passed to later reads and writes.
    fn open(&self, _path: &str, _flags: i32, reply: OpenReply) {
        reply.error(libc::ENOSYS);
    }

    /// Read up to `size` bytes at `offset`. Reporting fewer bytes than
    /// requested is an end-of-file; reporting more is truncated to `size`.
    fn read(&self, _path: &str, _fh: u64, _size: u32, _offset: u64, reply: ReadReply) {
        reply.error(libc::ENOSYS);
    }

    /// Write `data` at `offset`.
    fn write(&self, _path: &str, _fh: u64, _data: &[u8], _offset: u64, reply: WriteReply) {
        reply.error(libc::ENOSYS);
    }

    /// Create a regular file. No handle is assigned; subsequent I/O on the
    /// created file carries handle 0.
    fn create(&self, _path: &str, _mode: u32, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Remove a file.
    fn unlink(&self, _path: &str, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Create a directory.
    fn mkdir(&self, _path: &str, _mode: u32, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Remove a directory.
    fn rmdir(&self, _path: &str, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Rename `from` to `to`.
    fn rename(&self, _from: &str, _to: &str, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Change permission bits.
    fn chmod(&self, _path: &str, _mode: u32, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Change ownership. An id of `u32::MAX` (`(uid_t)-1`) leaves that id
    /// unchanged.
    fn chown(&self, _path: &str, _uid: u32, _gid: u32, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Truncate or extend to `size` bytes.
    fn truncate(&self, _path: &str, _size: u64, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Set access and modification times, in epoch seconds.
    fn utimens(&self, _path: &str, _atime: i64, _mtime: i64, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Release an open file.
    fn release(&self, _path: &str, _fh: u64, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Synchronize file contents.
    fn fsync(&self, _path: &str, _fh: u64, _datasync: bool, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Flush on close of a file descriptor.
    fn flush(&self, _path: &str, _fh: u64, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }

    /// Check access permissions for `mask`.
    fn access(&self, _path: &str, _mask: i32, reply: UnitReply) {
        reply.error(libc::ENOSYS);
    }
}
