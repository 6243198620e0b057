//! Shared test fixture for in-process FUSE mount testing.
//!
//! Provides `TestMount` (mount a handler, wait for the kernel mount to
//! appear, unmount on drop) and `MemFs`, an in-memory handler backed by a
//! shared node table that tests can seed and inspect directly.

// Allow dead code - these utilities are conditionally used by different test files
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use fuse_bridge::{
    DirReply, FileStat, FilesystemHandler, FuseMount, OpenReply, ReadReply, StatReply, UnitReply,
    WriteReply,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Target name for fixture logs.
const TARGET: &str = "fuse_bridge::fixture";

static TRACING_INIT: Once = Once::new();

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    });
}

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Check if a path is a FUSE mount by looking in /proc/mounts.
pub fn is_fuse_mount(path: &Path) -> bool {
    if let Ok(mounts) = fs::read_to_string("/proc/mounts") {
        let path_str = path.to_str().unwrap_or("");
        mounts
            .lines()
            .any(|line| line.contains(path_str) && line.contains("fuse"))
    } else {
        false
    }
}

/// Whether this host can serve FUSE mounts at all.
pub fn fuse_available() -> bool {
    Path::new("/dev/fuse").exists() && FuseMount::is_configured()
}

/// Create a unique mount directory for a test, cleaning up stale state from
/// earlier crashed runs.
pub fn unique_mount_dir(prefix: &str) -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let pid = std::process::id();
    let dir = PathBuf::from(format!("/tmp/{}-mount-{}-{}", prefix, pid, id));

    if is_fuse_mount(&dir) {
        let _ = FuseMount::force_unmount(&dir);
    }
    let _ = fs::remove_dir_all(&dir);
    dir
}

/// In-process FUSE mount fixture. Unmounts and removes the directory on
/// drop.
pub struct TestMount {
    mount: Option<FuseMount>,
    dir: PathBuf,
}

impl TestMount {
    pub fn new<H: FilesystemHandler>(prefix: &str, handler: H) -> Self {
        init_tracing();

        let dir = unique_mount_dir(prefix);
        info!(target: TARGET, mount = ?dir, "mounting");
        let mount = FuseMount::new(&dir, handler);
        mount.mount().expect("mount failed");

        // Wait for the mount to appear in /proc/mounts.
        for i in 0..100 {
            if is_fuse_mount(&dir) {
                debug!(target: TARGET, iterations = i, "mount ready");
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        TestMount {
            mount: Some(mount),
            dir,
        }
    }

    /// Where filesystem operations should be performed.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn mount_ref(&self) -> &FuseMount {
        self.mount.as_ref().unwrap()
    }

    /// Tear down explicitly, propagating unmount errors.
    pub fn unmount(mut self) {
        if let Some(mount) = self.mount.take() {
            mount.unmount().expect("unmount failed");
        }
    }
}

impl Drop for TestMount {
    fn drop(&mut self) {
        // FuseMount unmounts on drop; just clean the directory afterwards.
        drop(self.mount.take());
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// One entry in the in-memory filesystem.
#[derive(Debug, Clone)]
pub struct Node {
    pub mode: u32,
    pub data: Vec<u8>,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
}

impl Node {
    pub fn dir(perm: u32) -> Self {
        Node {
            mode: libc::S_IFDIR | perm,
            data: Vec::new(),
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
        }
    }

    pub fn file(perm: u32, data: &[u8]) -> Self {
        Node {
            mode: libc::S_IFREG | perm,
            data: data.to_vec(),
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
        }
    }

    fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

pub type NodeTable = Arc<Mutex<HashMap<String, Node>>>;

/// In-memory filesystem handler driven by a shared node table.
pub struct MemFs {
    nodes: NodeTable,
    next_fh: AtomicU64,
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::dir(0o755));
        MemFs {
            nodes: Arc::new(Mutex::new(nodes)),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Shared handle on the node table, for seeding and assertions.
    pub fn table(&self) -> NodeTable {
        Arc::clone(&self.nodes)
    }

    pub fn insert(&self, path: &str, node: Node) {
        self.nodes.lock().unwrap().insert(path.to_string(), node);
    }

    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &path[..idx],
        }
    }
}

impl FilesystemHandler for MemFs {
    fn getattr(&self, path: &str, reply: StatReply) {
        match self.nodes.lock().unwrap().get(path) {
            Some(node) => reply.stat(FileStat {
                mode: node.mode,
                size: node.data.len() as u64,
                uid: node.uid,
                gid: node.gid,
                atime: node.atime,
                mtime: node.mtime,
                ctime: node.mtime,
            }),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(&self, path: &str, reply: DirReply) {
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(node) if node.is_dir() => {}
            Some(_) => {
                reply.error(libc::ENOTDIR);
                return;
            }
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        }
        let mut names: Vec<String> = nodes
            .keys()
            .filter(|p| p.as_str() != "/" && Self::parent_of(p) == path)
            .map(|p| p[p.rfind('/').unwrap() + 1..].to_string())
            .collect();
        names.sort();
        reply.entries(names);
    }

    fn open(&self, path: &str, _flags: i32, reply: OpenReply) {
        if self.nodes.lock().unwrap().contains_key(path) {
            reply.opened(self.next_fh.fetch_add(1, Ordering::Relaxed));
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn read(&self, path: &str, _fh: u64, size: u32, offset: u64, reply: ReadReply) {
        match self.nodes.lock().unwrap().get(path) {
            Some(node) => {
                let start = (offset as usize).min(node.data.len());
                let end = (start + size as usize).min(node.data.len());
                let bytes = node.data[start..end].to_vec();
                reply.data(bytes.len() as u32, bytes);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn write(&self, path: &str, _fh: u64, data: &[u8], offset: u64, reply: WriteReply) {
        match self.nodes.lock().unwrap().get_mut(path) {
            Some(node) => {
                let end = offset as usize + data.len();
                if node.data.len() < end {
                    node.data.resize(end, 0);
                }
                node.data[offset as usize..end].copy_from_slice(data);
                reply.written(data.len() as u32);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn create(&self, path: &str, mode: u32, reply: UnitReply) {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(path) {
            reply.error(libc::EEXIST);
            return;
        }
        nodes.insert(path.to_string(), Node::file(mode & 0o7777, b""));
        reply.ok();
    }

    fn unlink(&self, path: &str, reply: UnitReply) {
        match self.nodes.lock().unwrap().remove(path) {
            Some(_) => reply.ok(),
            None => reply.error(libc::ENOENT),
        }
    }

    fn mkdir(&self, path: &str, mode: u32, reply: UnitReply) {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(path) {
            reply.error(libc::EEXIST);
            return;
        }
        nodes.insert(path.to_string(), Node::dir(mode & 0o7777));
        reply.ok();
    }

    fn rmdir(&self, path: &str, reply: UnitReply) {
        let mut nodes = self.nodes.lock().unwrap();
        let occupied = nodes.keys().any(|p| Self::parent_of(p) == path);
        if occupied {
            reply.error(libc::ENOTEMPTY);
            return;
        }
        match nodes.remove(path) {
            Some(_) => reply.ok(),
            None => reply.error(libc::ENOENT),
        }
    }

    fn rename(&self, from: &str, to: &str, reply: UnitReply) {
        let mut nodes = self.nodes.lock().unwrap();
        let moved: Vec<String> = nodes
            .keys()
            .filter(|p| p.as_str() == from || p.starts_with(&format!("{from}/")))
            .cloned()
            .collect();
        if moved.is_empty() {
            reply.error(libc::ENOENT);
            return;
        }
        for old in moved {
            let node = nodes.remove(&old).unwrap();
            let new = format!("{to}{}", &old[from.len()..]);
            nodes.insert(new, node);
        }
        reply.ok();
    }

    fn chmod(&self, path: &str, mode: u32, reply: UnitReply) {
        match self.nodes.lock().unwrap().get_mut(path) {
            Some(node) => {
                node.mode = (node.mode & libc::S_IFMT) | (mode & 0o7777);
                reply.ok();
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn chown(&self, path: &str, uid: u32, gid: u32, reply: UnitReply) {
        match self.nodes.lock().unwrap().get_mut(path) {
            Some(node) => {
                if uid != u32::MAX {
                    node.uid = uid;
                }
                if gid != u32::MAX {
                    node.gid = gid;
                }
                reply.ok();
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn truncate(&self, path: &str, size: u64, reply: UnitReply) {
        match self.nodes.lock().unwrap().get_mut(path) {
            Some(node) => {
                node.data.resize(size as usize, 0);
                reply.ok();
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn utimens(&self, path: &str, atime: i64, mtime: i64, reply: UnitReply) {
        match self.nodes.lock().unwrap().get_mut(path) {
            Some(node) => {
                node.atime = atime;
                node.mtime = mtime;
                reply.ok();
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn release(&self, _path: &str, _fh: u64, reply: UnitReply) {
        reply.ok();
    }

    fn fsync(&self, _path: &str, _fh: u64, _datasync: bool, reply: UnitReply) {
        reply.ok();
    }

    fn flush(&self, _path: &str, _fh: u64, reply: UnitReply) {
        reply.ok();
    }

    fn access(&self, _path: &str, _mask: i32, reply: UnitReply) {
        reply.ok();
    }
}
