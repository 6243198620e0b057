//! Request tickets and the typed continuations handed to handlers.
//!
//! Every inbound FUSE call allocates a ticket: a one-shot completion slot
//! the FUSE worker thread blocks on while the handler environment produces
//! the result. The handler side of the slot is wrapped in a per-operation
//! reply object that is consumed by use, so a reply can be set at most once.
//! Dropping a reply without setting it completes the ticket with `EIO`,
//! which covers both handler panics and continuations that are thrown away.

use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use std::sync::Arc;

use crate::errno;

/// Stat record reported by a handler's `getattr`.
///
/// Times are whole seconds since the Unix epoch. Fields the handler does not
/// care about stay at their zero defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    /// File type and permission bits (`S_IFREG | 0o644` and friends).
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Last access time, epoch seconds.
    pub atime: i64,
    /// Last modification time, epoch seconds.
    pub mtime: i64,
    /// Last status change time, epoch seconds.
    pub ctime: i64,
}

/// Result of one dispatched operation, as seen by the waiting adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OpResult {
    /// File attributes (getattr).
    Attr(FileStat),
    /// Directory entry names, excluding `.` and `..` (readdir).
    Entries(Vec<String>),
    /// File handle (open).
    Opened(u64),
    /// Bytes read plus payload (read).
    Data { count: u32, bytes: Vec<u8> },
    /// Bytes written (write).
    Written(u32),
    /// Success with no payload.
    Done,
    /// Positive errno.
    Err(i32),
}

/// Tickets outstanding against one dispatcher, keyed by ticket id.
///
/// Holds a second sender for each slot so mount teardown can fail every
/// in-flight request without waiting for the handler.
pub(crate) type PendingMap = DashMap<u64, Sender<OpResult>>;

/// Adapter side of a ticket. Blocks until the slot is set.
pub(crate) struct Ticket {
    rx: Receiver<OpResult>,
}

impl Ticket {
    /// Wait for the completion. A closed channel means the handler
    /// environment died with the reply unset.
    pub(crate) fn wait(self) -> OpResult {
        self.rx.recv().unwrap_or(OpResult::Err(libc::EIO))
    }
}

/// Handler side of a ticket: a single-assignment cell.
///
/// The slot is a capacity-1 channel, so the first writer wins; the loser
/// (a completion racing mount teardown, or vice versa) is dropped silently.
pub(crate) struct Completion {
    id: u64,
    tx: Option<Sender<OpResult>>,
    pending: Arc<PendingMap>,
}

impl Completion {
    pub(crate) fn set(mut self, result: OpResult) {
        self.fire(result);
    }

    fn fire(&mut self, result: OpResult) {
        if let Some(tx) = self.tx.take() {
            self.pending.remove(&self.id);
            let _ = tx.try_send(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // A reply discarded without being called can never be answered by
        // the handler; surface it as an I/O error instead of stalling.
        self.fire(OpResult::Err(libc::EIO));
    }
}

/// Allocate a ticket/completion pair registered in `pending` under `id`.
pub(crate) fn ticket_pair(id: u64, pending: &Arc<PendingMap>) -> (Ticket, Completion) {
    let (tx, rx) = bounded(1);
    pending.insert(id, tx.clone());
    let completion = Completion {
        id,
        tx: Some(tx),
        pending: Arc::clone(pending),
    };
    (Ticket { rx }, completion)
}

macro_rules! reply_error {
    () => {
        /// Fail the operation. `errno` may be the positive POSIX number or
        /// the negated form exported by [`crate::errno`].
        pub fn error(self, errno: i32) {
            self.inner.set(OpResult::Err(errno::normalize(errno)));
        }
    };
}

/// Continuation for `getattr`.
pub struct StatReply {
    inner: Completion,
}

impl StatReply {
    pub(crate) fn new(inner: Completion) -> Self {
        Self { inner }
    }

    /// Complete with the file's attributes.
    pub fn stat(self, stat: FileStat) {
        self.inner.set(OpResult::Attr(stat));
    }

    reply_error!();
}

/// Continuation for `readdir`.
pub struct DirReply {
    inner: Completion,
}

impl DirReply {
    pub(crate) fn new(inner: Completion) -> Self {
        Self { inner }
    }

    /// Complete with the entry names. `.` and `..` are added by the bridge
    /// and must not be included.
    pub fn entries(self, names: Vec<String>) {
        self.inner.set(OpResult::Entries(names));
    }

    reply_error!();
}

/// Continuation for `open`.
pub struct OpenReply {
    inner: Completion,
}

impl OpenReply {
    pub(crate) fn new(inner: Completion) -> Self {
        Self { inner }
    }

    /// Complete with the file handle passed back on later reads and writes.
    pub fn opened(self, fh: u64) {
        self.inner.set(OpResult::Opened(fh));
    }

    reply_error!();
}

/// Continuation for `read`.
pub struct ReadReply {
    inner: Completion,
}

impl ReadReply {
    pub(crate) fn new(inner: Completion) -> Self {
        Self { inner }
    }

    /// Complete with `count` bytes read and the payload carrying them.
    /// Zero bytes is a legal end-of-file.
    pub fn data(self, count: u32, bytes: Vec<u8>) {
        self.inner.set(OpResult::Data { count, bytes });
    }

    reply_error!();
}

/// Continuation for `write`.
pub struct WriteReply {
    inner: Completion,
}

impl WriteReply {
    pub(crate) fn new(inner: Completion) -> Self {
        Self { inner }
    }

    /// Complete with the number of bytes written.
    pub fn written(self, count: u32) {
        self.inner.set(OpResult::Written(count));
    }

    reply_error!();
}

/// Continuation for every operation whose success carries no payload.
pub struct UnitReply {
    inner: Completion,
}

impl UnitReply {
    pub(crate) fn new(inner: Completion) -> Self {
        Self { inner }
    }

    /// Complete successfully.
    pub fn ok(self) {
        self.inner.set(OpResult::Done);
    }

    reply_error!();
}
