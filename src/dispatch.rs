//! Cross-thread dispatcher for the handler environment.
//!
//! The handler environment is a single dedicated thread with a cooperative
//! job queue; user handlers run only there and admit no re-entry from other
//! threads. The FUSE worker thread cannot call the handler directly, so it
//! submits a closure here and blocks until the closure has *run* — not until
//! the handler's asynchronous work has completed. Completion is a separate
//! rendezvous carried by the request ticket (see [`crate::reply`]), which
//! lets a handler return immediately and finish the request later.

use crossbeam_channel::{bounded, unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error};

use crate::handler::FilesystemHandler;
use crate::reply::{self, Completion, OpResult, PendingMap, Ticket};

type EnvJob = Box<dyn FnOnce(&dyn FilesystemHandler) + Send>;

/// One mount's bridge between the FUSE worker thread and the handler
/// environment. Created during the mount transition, torn down when the
/// mount is destroyed.
pub(crate) struct Dispatcher {
    /// Submission queue. Taken (dropped) at shutdown, which ends the
    /// environment thread's receive loop.
    job_tx: Mutex<Option<Sender<EnvJob>>>,
    /// Outstanding tickets, so teardown can fail them all.
    pending: Arc<PendingMap>,
    next_ticket: AtomicU64,
    env_thread: Mutex<Option<JoinHandle<()>>>,
    env_thread_id: ThreadId,
    down: AtomicBool,
}

impl Dispatcher {
    /// Spawn the handler environment thread, which takes ownership of the
    /// handler for the life of the mount.
    pub(crate) fn spawn(handler: Box<dyn FilesystemHandler>) -> Arc<Self> {
        let (job_tx, job_rx) = unbounded::<EnvJob>();
        let (id_tx, id_rx) = bounded(1);

        let env_thread = thread::spawn(move || {
            let _ = id_tx.send(thread::current().id());
            drop(id_tx);

            for job in job_rx {
                // A panicking handler must not take the environment down
                // with it; the dropped reply already failed the ticket.
                if catch_unwind(AssertUnwindSafe(|| job(handler.as_ref()))).is_err() {
                    error!(target: "fuse-bridge::dispatch", "handler panicked; request failed with EIO");
                }
            }
            debug!(target: "fuse-bridge::dispatch", "handler environment exited");
        });

        let env_thread_id = id_rx
            .recv()
            .expect("handler environment thread failed to start");

        Arc::new(Self {
            job_tx: Mutex::new(Some(job_tx)),
            pending: Arc::new(PendingMap::new()),
            next_ticket: AtomicU64::new(1),
            env_thread: Mutex::new(Some(env_thread)),
            env_thread_id,
            down: AtomicBool::new(false),
        })
    }

    /// Allocate a ticket/completion pair tracked by this dispatcher.
    pub(crate) fn ticket(&self) -> (Ticket, Completion) {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        reply::ticket_pair(id, &self.pending)
    }

    /// Run `f` on the handler environment thread and block until it has run.
    ///
    /// Safe from any thread except the environment's own; submitting from
    /// there would deadlock against ourselves and is a programming error,
    /// so it aborts. Submissions are FIFO per calling thread. After
    /// shutdown has begun this fails immediately with `EIO`.
    pub(crate) fn call_in_env<F>(&self, f: F) -> Result<(), i32>
    where
        F: FnOnce(&dyn FilesystemHandler) + Send + 'static,
    {
        if thread::current().id() == self.env_thread_id {
            error!(target: "fuse-bridge::dispatch", "submission from the handler environment thread");
            std::process::abort();
        }
        if self.down.load(Ordering::Acquire) {
            return Err(libc::EIO);
        }

        let (ran_tx, ran_rx) = bounded::<()>(1);
        let job: EnvJob = Box::new(move |handler| {
            f(handler);
            let _ = ran_tx.send(());
        });

        let tx = match &*self.job_tx.lock().unwrap() {
            Some(tx) => tx.clone(),
            None => return Err(libc::EIO),
        };
        if tx.send(job).is_err() {
            return Err(libc::EIO);
        }

        // A closed channel here means the job (or the environment) died
        // before signalling; the ticket was failed by the reply's drop.
        ran_rx.recv().map_err(|_| libc::EIO)
    }

    /// Stop accepting submissions and fail every outstanding ticket with
    /// `EIO`, waking any FUSE worker stalled on a handler that will never
    /// answer. Must run before the FUSE session is asked to exit, or a
    /// stalled adapter would keep the session loop from returning.
    pub(crate) fn begin_shutdown(&self) {
        self.down.store(true, Ordering::Release);
        self.fail_pending();
    }

    /// Join the handler environment thread. Queued jobs drain first, so no
    /// handler operation runs after this returns.
    pub(crate) fn finish_shutdown(&self) {
        self.down.store(true, Ordering::Release);
        *self.job_tx.lock().unwrap() = None;
        if let Some(handle) = self.env_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.fail_pending();
    }

    /// Fail all outstanding tickets with `EIO`.
    fn fail_pending(&self) {
        // Collect keys first to avoid holding shard locks during send.
        let keys: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.try_send(OpResult::Err(libc::EIO));
            }
        }
    }
}
