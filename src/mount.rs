//! Mount lifecycle and the public surface.
//!
//! One [`FuseMount`] owns one kernel mount: the handler (through the
//! dispatcher), the FUSE worker thread, and the session teardown handle.
//! The constructor only records configuration; `mount` is what touches the
//! kernel.

use anyhow::{bail, Context, Result};
use crossbeam_channel::bounded;
use fuser::{MountOption, Session, SessionUnmounter};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeFs;
use crate::dispatch::Dispatcher;
use crate::handler::FilesystemHandler;
use crate::registry;

/// Shared per-mount state the operation adapters resolve through the
/// registry: the dispatcher and the liveness of the kernel session.
pub(crate) struct MountCore {
    mount_point: PathBuf,
    dispatcher: Arc<Dispatcher>,
    session_live: AtomicBool,
}

impl MountCore {
    pub(crate) fn new(mount_point: PathBuf, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            mount_point,
            dispatcher,
            session_live: AtomicBool::new(false),
        }
    }

    pub(crate) fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Mount lifecycle: created → mounting → mounted → unmounting → destroyed,
/// with failures collapsing to destroyed. A destroyed instance cannot be
/// remounted.
enum Stage {
    Created { handler: Box<dyn FilesystemHandler> },
    Mounting,
    Mounted(Live),
    Unmounting,
    Destroyed,
}

struct Live {
    core: Arc<MountCore>,
    unmounter: SessionUnmounter,
    worker: JoinHandle<()>,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Created { .. } => "created",
            Stage::Mounting => "mounting",
            Stage::Mounted(_) => "mounted",
            Stage::Unmounting => "unmounting",
            Stage::Destroyed => "destroyed",
        }
    }
}

/// One FUSE mount binding a handler to a mount point.
///
/// ```rust,ignore
/// use fuse_bridge::{FileStat, FilesystemHandler, FuseMount, StatReply};
///
/// struct Hello;
/// impl FilesystemHandler for Hello {
///     fn getattr(&self, path: &str, reply: StatReply) { /* ... */ }
/// }
///
/// let mount = FuseMount::new("/mnt/hello", Hello);
/// mount.mount()?;
/// // ... serve ...
/// mount.unmount()?;
/// ```
pub struct FuseMount {
    mount_point: PathBuf,
    stage: Mutex<Stage>,
}

impl FuseMount {
    /// Record the mount point and handler. Nothing touches the kernel until
    /// [`mount`](Self::mount).
    pub fn new<H: FilesystemHandler>(mount_point: impl Into<PathBuf>, handler: H) -> Self {
        Self {
            mount_point: mount_point.into(),
            stage: Mutex::new(Stage::Created {
                handler: Box::new(handler),
            }),
        }
    }

    /// Mount point this instance was configured with.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Create the FUSE session on a dedicated worker thread and block until
    /// it is live and serving requests. The worker runs the single-threaded
    /// session loop until unmount.
    pub fn mount(&self) -> Result<()> {
        let mut stage = self.stage.lock().unwrap();
        let handler = match std::mem::replace(&mut *stage, Stage::Mounting) {
            Stage::Created { handler } => handler,
            other => {
                let state = other.name();
                *stage = other;
                bail!(
                    "cannot mount {}: instance is {state}",
                    self.mount_point.display()
                );
            }
        };

        if !self.mount_point.is_absolute() {
            *stage = Stage::Destroyed;
            bail!(
                "mount point {} is not an absolute path",
                self.mount_point.display()
            );
        }
        if let Err(e) = fs::create_dir_all(&self.mount_point) {
            *stage = Stage::Destroyed;
            return Err(e).with_context(|| {
                format!("failed to create mount point {}", self.mount_point.display())
            });
        }

        let dispatcher = Dispatcher::spawn(handler);
        let core = Arc::new(MountCore::new(
            self.mount_point.clone(),
            Arc::clone(&dispatcher),
        ));
        if registry::register(Arc::clone(&core)).is_err() {
            dispatcher.finish_shutdown();
            *stage = Stage::Destroyed;
            bail!(
                "mount point {} is already mounted (EBUSY)",
                self.mount_point.display()
            );
        }

        let (ready_tx, ready_rx) = bounded(1);
        let worker_core = Arc::clone(&core);
        let mount_point = self.mount_point.clone();
        let worker = thread::spawn(move || {
            let fs = BridgeFs::new(mount_point.clone());
            let options = [MountOption::FSName("fuse-bridge".to_string())];
            let mut session = match Session::new(fs, &mount_point, &options) {
                Ok(session) => session,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let unmounter = session.unmount_callable();
            worker_core.session_live.store(true, Ordering::SeqCst);
            let _ = ready_tx.send(Ok(unmounter));

            if let Err(e) = session.run() {
                error!(target: "fuse-bridge::mount", error = %e, "FUSE session loop failed");
            }
            worker_core.session_live.store(false, Ordering::SeqCst);
            debug!(target: "fuse-bridge::mount", "FUSE session exited");
        });

        match ready_rx.recv() {
            Ok(Ok(unmounter)) => {
                info!(target: "fuse-bridge::mount", mount_point = ?self.mount_point, "mounted");
                *stage = Stage::Mounted(Live {
                    core,
                    unmounter,
                    worker,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                registry::unregister(&self.mount_point);
                dispatcher.finish_shutdown();
                *stage = Stage::Destroyed;
                Err(e).with_context(|| {
                    format!("failed to create FUSE session at {}", self.mount_point.display())
                })
            }
            Err(_) => {
                let _ = worker.join();
                registry::unregister(&self.mount_point);
                dispatcher.finish_shutdown();
                *stage = Stage::Destroyed;
                bail!("FUSE worker exited before the session came up");
            }
        }
    }

    /// Tear the mount down: fail outstanding requests, ask the session loop
    /// to exit, join the worker, and destroy the dispatcher. Erroring on an
    /// instance that is not mounted reports its state.
    pub fn unmount(&self) -> Result<()> {
        let mut stage = self.stage.lock().unwrap();
        let live = match std::mem::replace(&mut *stage, Stage::Unmounting) {
            Stage::Mounted(live) => live,
            other => {
                let state = other.name();
                *stage = other;
                bail!(
                    "cannot unmount {}: instance is {state}, not mounted",
                    self.mount_point.display()
                );
            }
        };
        let Live {
            core,
            mut unmounter,
            worker,
        } = live;

        // Wake any adapter stalled on a handler that will never answer;
        // otherwise the session loop cannot return and the join below
        // would deadlock.
        core.dispatcher().begin_shutdown();

        if core.session_live.load(Ordering::SeqCst) {
            if let Err(e) = unmounter.unmount() {
                warn!(target: "fuse-bridge::mount", error = %e, "kernel unmount failed");
            }
        }
        let _ = worker.join();

        core.dispatcher().finish_shutdown();
        registry::unregister(&self.mount_point);
        *stage = Stage::Destroyed;
        info!(target: "fuse-bridge::mount", mount_point = ?self.mount_point, "unmounted");
        Ok(())
    }

    /// Whether the kernel session is live and serving requests.
    pub fn is_mounted(&self) -> bool {
        match &*self.stage.lock().unwrap() {
            Stage::Mounted(live) => live.core.session_live.load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// Whether a `fusermount3` (or `fusermount`) executable is on PATH,
    /// i.e. whether FUSE mounts can work at all on this host.
    pub fn is_configured() -> bool {
        ["fusermount3", "fusermount"].iter().any(|bin| {
            Command::new(bin)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false)
        })
    }

    /// Unmount `mount_point` with the external `fusermount` binary. For
    /// cleaning up mounts left behind by a crashed process; a live
    /// [`FuseMount`] should use [`unmount`](Self::unmount).
    pub fn force_unmount(mount_point: impl AsRef<Path>) -> Result<()> {
        let mount_point = mount_point.as_ref();
        for bin in ["fusermount3", "fusermount"] {
            let status = Command::new(bin)
                .arg("-u")
                .arg(mount_point)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Ok(status) = status {
                if status.success() {
                    return Ok(());
                }
            }
        }
        bail!("fusermount failed to unmount {}", mount_point.display())
    }
}

impl Drop for FuseMount {
    fn drop(&mut self) {
        let mounted = matches!(&*self.stage.lock().unwrap(), Stage::Mounted(_));
        if mounted {
            if let Err(e) = self.unmount() {
                warn!(target: "fuse-bridge::mount", error = %e, "unmount on drop failed");
            }
        }
    }
}
