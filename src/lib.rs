//! Userspace filesystem bridge for Linux FUSE3.
//!
//! `fuse-bridge` binds the kernel's FUSE interface (through [`fuser`]) to a
//! user-supplied [`FilesystemHandler`] serving POSIX-style operations on a
//! virtual hierarchy:
//!
//! - **Handler contract**: path-based operations with asynchronous,
//!   single-use reply continuations
//! - **Dispatch**: a dedicated handler environment thread; the FUSE worker
//!   submits invocations cross-thread and blocks on a per-request ticket
//! - **Adapters**: one translator per FUSE operation, marshalling arguments
//!   and errnos between the kernel and the handler
//! - **Mount lifecycle**: session-per-thread mounts with clean teardown,
//!   tracked in a process-wide registry
//!
//! # Quick start
//!
//! ```rust,ignore
//! use fuse_bridge::{DirReply, FileStat, FilesystemHandler, FuseMount, StatReply};
//!
//! struct ReadmeFs;
//!
//! impl FilesystemHandler for ReadmeFs {
//!     fn getattr(&self, path: &str, reply: StatReply) {
//!         match path {
//!             "/" => reply.stat(FileStat { mode: libc::S_IFDIR | 0o755, ..Default::default() }),
//!             "/readme.txt" => reply.stat(FileStat { mode: libc::S_IFREG | 0o644, size: 6, ..Default::default() }),
//!             _ => reply.error(fuse_bridge::errno::ENOENT),
//!         }
//!     }
//!
//!     fn readdir(&self, _path: &str, reply: DirReply) {
//!         reply.entries(vec!["readme.txt".to_string()]);
//!     }
//! }
//!
//! let mount = FuseMount::new("/mnt/readme", ReadmeFs);
//! mount.mount()?;
//! ```
//!
//! Handlers may complete a reply after the operation returns; a reply
//! dropped without being used fails its request with `EIO`. A handler that
//! never completes a reply stalls that request until unmount, which fails
//! all outstanding requests before tearing down.

mod bridge;
mod dispatch;
pub mod errno;
mod handler;
mod mount;
mod registry;
mod reply;

pub use handler::FilesystemHandler;
pub use mount::FuseMount;
pub use reply::{DirReply, FileStat, OpenReply, ReadReply, StatReply, UnitReply, WriteReply};
