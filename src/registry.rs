//! Process-wide table of active mounts.
//!
//! FUSE callbacks need a way back from a kernel request to the owning mount
//! instance; this table provides it, keyed by mount point. It is initialized
//! lazily at first mount, guarded by a single mutex, and empty again once
//! every mount has been torn down. The surface is deliberately minimal so a
//! per-session user-data pointer could replace it without touching the
//! operation adapters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::mount::MountCore;
use std::sync::Arc;

static MOUNTS: OnceLock<Mutex<HashMap<PathBuf, Arc<MountCore>>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<PathBuf, Arc<MountCore>>> {
    MOUNTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Insert a mount under its mount point. Fails with `EBUSY` if the mount
/// point is already registered.
pub(crate) fn register(core: Arc<MountCore>) -> Result<(), i32> {
    let mut mounts = table().lock().unwrap();
    if mounts.contains_key(core.mount_point()) {
        return Err(libc::EBUSY);
    }
    mounts.insert(core.mount_point().to_path_buf(), core);
    Ok(())
}

/// Find the active mount whose mount point prefixes `path`, preferring the
/// longest prefix when mounts nest.
pub(crate) fn lookup_for_path(path: &Path) -> Option<Arc<MountCore>> {
    let mounts = table().lock().unwrap();
    mounts
        .iter()
        .filter(|(mount_point, _)| path.starts_with(mount_point))
        .max_by_key(|(mount_point, _)| mount_point.as_os_str().len())
        .map(|(_, core)| Arc::clone(core))
}

/// Remove a mount point's entry. Idempotent.
pub(crate) fn unregister(mount_point: &Path) {
    table().lock().unwrap().remove(mount_point);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::handler::FilesystemHandler;

    struct NoopHandler;
    impl FilesystemHandler for NoopHandler {}

    fn core(mount_point: &str) -> Arc<MountCore> {
        Arc::new(MountCore::new(
            PathBuf::from(mount_point),
            Dispatcher::spawn(Box::new(NoopHandler)),
        ))
    }

    #[test]
    fn duplicate_mount_point_is_busy() {
        let a = core("/registry-test/dup");
        let b = core("/registry-test/dup");
        register(Arc::clone(&a)).unwrap();
        assert_eq!(register(b), Err(libc::EBUSY));
        unregister(Path::new("/registry-test/dup"));
    }

    #[test]
    fn lookup_prefers_longest_prefix() {
        let outer = core("/registry-test/nest");
        let inner = core("/registry-test/nest/inner");
        register(Arc::clone(&outer)).unwrap();
        register(Arc::clone(&inner)).unwrap();

        let hit = lookup_for_path(Path::new("/registry-test/nest/inner/file")).unwrap();
        assert_eq!(hit.mount_point(), Path::new("/registry-test/nest/inner"));

        let hit = lookup_for_path(Path::new("/registry-test/nest/other")).unwrap();
        assert_eq!(hit.mount_point(), Path::new("/registry-test/nest"));

        assert!(lookup_for_path(Path::new("/registry-test/elsewhere")).is_none());

        unregister(Path::new("/registry-test/nest"));
        unregister(Path::new("/registry-test/nest/inner"));
    }

    #[test]
    fn unregister_is_idempotent() {
        let a = core("/registry-test/once");
        register(a).unwrap();
        unregister(Path::new("/registry-test/once"));
        unregister(Path::new("/registry-test/once"));
        assert!(lookup_for_path(Path::new("/registry-test/once/x")).is_none());
    }
}
