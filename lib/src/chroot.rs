//! Running caller hooks inside a snapshot tree.
//!
//! Hooks get a read-write view of the snapshot root with the kernel API
//! filesystems available below it, so tools run against the tree (kernel
//! post-install scripts, configuration programs) behave as if booted.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::mount;

/// The API mounts a hook can rely on: (target, source, fstype).  A `None`
/// source means a fresh mount of the given filesystem type; otherwise the
/// host path is bind-mounted.
const API_MOUNTS: &[(&str, Option<&str>, &str)] = &[
    ("proc", None, "proc"),
    ("sys", None, "sysfs"),
    ("dev", Some("/dev"), ""),
];

fn mount_api_filesystems(root: &Utf8Path, mounted: &mut Vec<Utf8PathBuf>) -> Result<()> {
    for (target, source, fstype) in API_MOUNTS {
        let target_path = root.join(target);
        match source {
            Some(source) => mount::bind_mount(Utf8Path::new(source), &target_path)?,
            None => mount::mount(Utf8Path::new(fstype), &target_path, fstype, &[])?,
        }
        mounted.push(target_path);
    }
    Ok(())
}

/// Run `hook` with the snapshot's API filesystems mounted.  The mounts are
/// removed before returning, whatever the hook's outcome.
pub(crate) fn run_in_snapshot<T>(
    root: &Utf8Path,
    hook: impl FnOnce(&Utf8Path) -> Result<T>,
) -> Result<T> {
    let mut mounted = Vec::new();
    let result = mount_api_filesystems(root, &mut mounted).and_then(|()| hook(root));
    for target in mounted.iter().rev() {
        if let Err(e) = mount::unmount(target) {
            tracing::warn!("unmounting {target} failed: {e:#}");
        }
    }
    result
}
