//! Operation adapters: the `fuser::Filesystem` implementation.
//!
//! Each adapter runs on the FUSE worker thread. It resolves the owning mount
//! through the registry, copies the kernel's arguments (no kernel pointer
//! crosses the submission), submits the handler invocation to the dispatcher,
//! blocks on the request ticket, and translates the payload into the reply
//! `fuser` expects. Errors funnel through [`crate::errno::normalize`].
//!
//! The handler contract is path-based while the kernel speaks inodes, so the
//! bridge keeps an inode↔path table, populated by `lookup` and pruned on
//! unlink/rmdir/rename.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::handler::FilesystemHandler;
use crate::mount::MountCore;
use crate::registry;
use crate::reply::{
    Completion, DirReply, FileStat, OpResult, OpenReply, ReadReply, StatReply, UnitReply,
    WriteReply,
};

/// How long the kernel may cache attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// Fixed statfs geometry: 4 KiB blocks, 1,000,000 total, 500,000 free.
const STATFS_BLOCK_SIZE: u32 = 4096;
const STATFS_TOTAL_BLOCKS: u64 = 1_000_000;
const STATFS_FREE_BLOCKS: u64 = 500_000;

pub(crate) struct BridgeFs {
    mount_point: PathBuf,
    inodes: HashMap<u64, String>,
    paths: HashMap<String, u64>,
    next_ino: u64,
}

impl BridgeFs {
    pub(crate) fn new(mount_point: PathBuf) -> Self {
        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(FUSE_ROOT_ID, "/".to_string());
        paths.insert("/".to_string(), FUSE_ROOT_ID);
        Self {
            mount_point,
            inodes,
            paths,
            next_ino: FUSE_ROOT_ID + 1,
        }
    }

    /// Resolve the owning mount instance; gone means the mount is torn down
    /// and every request answers `EIO`.
    fn core(&self) -> Option<Arc<MountCore>> {
        registry::lookup_for_path(&self.mount_point)
            .filter(|core| core.mount_point() == self.mount_point)
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.get(&ino).cloned()
    }

    fn get_or_alloc_ino(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.paths.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, path.to_string());
        self.paths.insert(path.to_string(), ino);
        ino
    }

    fn drop_path(&mut self, path: &str) {
        if let Some(ino) = self.paths.remove(path) {
            self.inodes.remove(&ino);
        }
    }

    /// Rewrite `from` and everything under it to live under `to`.
    fn remap_tree(&mut self, from: &str, to: &str) {
        self.drop_path(to);
        let prefix = format!("{from}/");
        let moved: Vec<(u64, String)> = self
            .inodes
            .iter()
            .filter(|(_, path)| path.as_str() == from || path.starts_with(&prefix))
            .map(|(ino, path)| (*ino, path.clone()))
            .collect();
        for (ino, old) in moved {
            let new = format!("{to}{}", &old[from.len()..]);
            self.paths.remove(&old);
            self.inodes.insert(ino, new.clone());
            self.paths.insert(new, ino);
        }
    }

    /// Child path of `parent`'s ino and a directory entry name.
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let parent_path = self.path_of(parent).ok_or(libc::ENOENT)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(join_path(&parent_path, name))
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Submit one handler invocation and wait for its ticket.
fn dispatch<F>(core: &MountCore, invoke: F) -> OpResult
where
    F: FnOnce(&dyn FilesystemHandler, Completion) + Send + 'static,
{
    let (ticket, completion) = core.dispatcher().ticket();
    match core.dispatcher().call_in_env(move |h| invoke(h, completion)) {
        Ok(()) => ticket.wait(),
        Err(errno) => OpResult::Err(errno),
    }
}

/// Run an operation whose success carries no payload.
fn unit_op<F>(core: &MountCore, invoke: F) -> Result<(), i32>
where
    F: FnOnce(&dyn FilesystemHandler, UnitReply) + Send + 'static,
{
    match dispatch(core, move |h, c| invoke(h, UnitReply::new(c))) {
        OpResult::Done => Ok(()),
        OpResult::Err(errno) => Err(errno),
        other => {
            warn!(target: "fuse-bridge::fs", ?other, "unexpected handler payload");
            Err(libc::EIO)
        }
    }
}

/// Stat a path through the handler. A mount whose handler has no `getattr`
/// still answers for its root so the mount point itself remains stat-able.
fn stat_for(core: &MountCore, path: &str) -> Result<FileStat, i32> {
    let owned = path.to_string();
    match dispatch(core, move |h, c| h.getattr(&owned, StatReply::new(c))) {
        OpResult::Attr(stat) => Ok(stat),
        OpResult::Err(errno) if errno == libc::ENOSYS && path == "/" => Ok(FileStat {
            mode: libc::S_IFDIR | 0o755,
            ..Default::default()
        }),
        OpResult::Err(errno) => Err(errno),
        other => {
            warn!(target: "fuse-bridge::fs", ?other, "unexpected handler payload");
            Err(libc::EIO)
        }
    }
}

fn to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn epoch_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Convert a handler stat record to `fuser::FileAttr`. Missing fields have
/// defaulted to zero already; a mode without format bits counts as a
/// regular file.
fn to_fuse_attr(stat: &FileStat, ino: u64) -> FileAttr {
    let kind = match stat.mode & libc::S_IFMT {
        x if x == libc::S_IFDIR => FileType::Directory,
        x if x == libc::S_IFREG => FileType::RegularFile,
        x if x == libc::S_IFLNK => FileType::Symlink,
        x if x == libc::S_IFCHR => FileType::CharDevice,
        x if x == libc::S_IFBLK => FileType::BlockDevice,
        x if x == libc::S_IFIFO => FileType::NamedPipe,
        x if x == libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    };

    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: to_system_time(stat.atime),
        mtime: to_system_time(stat.mtime),
        ctime: to_system_time(stat.ctime),
        crtime: UNIX_EPOCH,
        kind,
        perm: (stat.mode & 0o7777) as u16,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: STATFS_BLOCK_SIZE,
        flags: 0,
    }
}

/// Bytes to hand to the kernel: never more than the handler reported, the
/// kernel requested, or the payload holds.
fn read_len(reported: u32, requested: u32, available: usize) -> usize {
    (reported as usize).min(requested as usize).min(available)
}

impl Filesystem for BridgeFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        debug!(target: "fuse-bridge::fs", mount_point = ?self.mount_point, "kernel session initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!(target: "fuse-bridge::fs", mount_point = ?self.mount_point, "kernel session destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match stat_for(&core, &path) {
            Ok(stat) => {
                let ino = self.get_or_alloc_ino(&path);
                reply.entry(&TTL, &to_fuse_attr(&stat, ino), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match stat_for(&core, &path) {
            Ok(stat) => reply.attr(&TTL, &to_fuse_attr(&stat, ino)),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // The kernel folds chmod/chown/truncate/utimens into one setattr;
        // the handler contract keeps them separate. Run the requested pieces
        // in order and stop at the first error.
        if let Some(mode) = mode {
            let p = path.clone();
            if let Err(errno) = unit_op(&core, move |h, r| h.chmod(&p, mode, r)) {
                reply.error(errno);
                return;
            }
        }

        if uid.is_some() || gid.is_some() {
            let p = path.clone();
            // (uid_t)-1 leaves the id unchanged, as in chown(2).
            let uid = uid.unwrap_or(u32::MAX);
            let gid = gid.unwrap_or(u32::MAX);
            if let Err(errno) = unit_op(&core, move |h, r| h.chown(&p, uid, gid, r)) {
                reply.error(errno);
                return;
            }
        }

        if let Some(size) = size {
            let p = path.clone();
            if let Err(errno) = unit_op(&core, move |h, r| h.truncate(&p, size, r)) {
                reply.error(errno);
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let resolve = |t: TimeOrNow| match t {
                TimeOrNow::SpecificTime(t) => epoch_secs(t),
                TimeOrNow::Now => epoch_secs(SystemTime::now()),
            };
            // When only one side changes, keep the other at its current
            // value so the handler always sees both.
            let current = stat_for(&core, &path).unwrap_or_default();
            let atime_secs = atime.map(resolve).unwrap_or(current.atime);
            let mtime_secs = mtime.map(resolve).unwrap_or(current.mtime);
            let p = path.clone();
            if let Err(errno) = unit_op(&core, move |h, r| h.utimens(&p, atime_secs, mtime_secs, r))
            {
                reply.error(errno);
                return;
            }
        }

        match stat_for(&core, &path) {
            Ok(stat) => reply.attr(&TTL, &to_fuse_attr(&stat, ino)),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let p = path.clone();
        if let Err(errno) = unit_op(&core, move |h, r| h.mkdir(&p, mode, r)) {
            reply.error(errno);
            return;
        }
        // The kernel expects the new entry's attributes back.
        match stat_for(&core, &path) {
            Ok(stat) => {
                let ino = self.get_or_alloc_ino(&path);
                reply.entry(&TTL, &to_fuse_attr(&stat, ino), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let p = path.clone();
        match unit_op(&core, move |h, r| h.unlink(&p, r)) {
            Ok(()) => {
                self.drop_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let p = path.clone();
        match unit_op(&core, move |h, r| h.rmdir(&p, r)) {
            Ok(()) => {
                self.drop_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let (from, to) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => {
                reply.error(errno);
                return;
            }
        };
        let (f, t) = (from.clone(), to.clone());
        match unit_op(&core, move |h, r| h.rename(&f, &t, r)) {
            Ok(()) => {
                self.remap_tree(&from, &to);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match dispatch(&core, move |h, c| h.open(&path, flags, OpenReply::new(c))) {
            // direct_io is forced so every userspace read reaches the
            // handler instead of the page cache; handlers may produce
            // content the kernel cannot predict from earlier getattrs.
            OpResult::Opened(fh) => reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO),
            OpResult::Err(errno) => reply.error(errno),
            other => {
                warn!(target: "fuse-bridge::fs", ?other, "unexpected handler payload");
                reply.error(libc::EIO);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let offset = offset.max(0) as u64;
        match dispatch(&core, move |h, c| {
            h.read(&path, fh, size, offset, ReadReply::new(c))
        }) {
            OpResult::Data { count, bytes } => {
                reply.data(&bytes[..read_len(count, size, bytes.len())]);
            }
            OpResult::Err(errno) => reply.error(errno),
            other => {
                warn!(target: "fuse-bridge::fs", ?other, "unexpected handler payload");
                reply.error(libc::EIO);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        // Copy out of the kernel buffer before it leaves this frame.
        let data = data.to_vec();
        let offset = offset.max(0) as u64;
        match dispatch(&core, move |h, c| {
            h.write(&path, fh, &data, offset, WriteReply::new(c))
        }) {
            OpResult::Written(count) => reply.written(count),
            OpResult::Err(errno) => reply.error(errno),
            other => {
                warn!(target: "fuse-bridge::fs", ?other, "unexpected handler payload");
                reply.error(libc::EIO);
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match unit_op(&core, move |h, r| h.flush(&path, fh, r)) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match unit_op(&core, move |h, r| h.release(&path, fh, r)) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match unit_op(&core, move |h, r| h.fsync(&path, fh, datasync, r)) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let dir = path.clone();
        let names = match dispatch(&core, move |h, c| h.readdir(&dir, DirReply::new(c))) {
            OpResult::Entries(names) => names,
            OpResult::Err(errno) => {
                reply.error(errno);
                return;
            }
            other => {
                warn!(target: "fuse-bridge::fs", ?other, "unexpected handler payload");
                reply.error(libc::EIO);
                return;
            }
        };

        let parent_ino = self
            .paths
            .get(parent_path(&path))
            .copied()
            .unwrap_or(FUSE_ROOT_ID);
        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(names.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((parent_ino, FileType::Directory, "..".to_string()));
        for name in names {
            let child = join_path(&path, &name);
            let child_ino = self.get_or_alloc_ino(&child);
            // The entry type here is advisory; the kernel stats through
            // lookup before trusting it.
            entries.push((child_ino, FileType::RegularFile, name));
        }

        for (i, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match unit_op(&core, move |h, r| h.access(&path, mask, r)) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // Answered locally; the virtual hierarchy has no real geometry.
        reply.statfs(
            STATFS_TOTAL_BLOCKS,
            STATFS_FREE_BLOCKS,
            STATFS_FREE_BLOCKS,
            0,
            0,
            STATFS_BLOCK_SIZE,
            255,
            STATFS_BLOCK_SIZE,
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(core) = self.core() else {
            reply.error(libc::EIO);
            return;
        };
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let p = path.clone();
        if let Err(errno) = unit_op(&core, move |h, r| h.create(&p, mode, r)) {
            reply.error(errno);
            return;
        }
        match stat_for(&core, &path) {
            Ok(stat) => {
                let ino = self.get_or_alloc_ino(&path);
                // No open follows a create; I/O on the new file carries
                // handle 0.
                reply.created(
                    &TTL,
                    &to_fuse_attr(&stat, ino),
                    0,
                    0,
                    fuser::consts::FOPEN_DIRECT_IO,
                );
            }
            Err(errno) => reply.error(errno),
        }
    }
}
