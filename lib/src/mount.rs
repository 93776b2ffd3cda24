//! Helpers for inspecting and manipulating mountpoints.
//!
//! Probing goes through findmnt; the mounts themselves are plain syscalls
//! since the engine only ever needs bind and filesystem mounts with a
//! handful of options.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use elemental_utils::CommandRunExt;
use fn_error_context::context;
use serde::Deserialize;

/// What findmnt reports about a single mounted filesystem.
#[derive(Deserialize, Debug)]
pub(crate) struct MountInfo {
    pub(crate) source: String,
    pub(crate) fstype: String,
    pub(crate) options: String,
    pub(crate) uuid: Option<String>,
}

impl MountInfo {
    /// The snapshot this mount comes from, when its options reference a
    /// snapshot subvolume of the `@` tree.
    pub(crate) fn snapshot_id(&self) -> Option<u64> {
        snapshot_id_from_options(&self.options)
    }
}

#[derive(Deserialize, Debug)]
struct FindmntOutput {
    filesystems: Vec<MountInfo>,
}

/// Ask findmnt what is mounted at `path`.  Fails when nothing is.
#[context("Inspecting filesystem {path}")]
pub(crate) fn inspect_filesystem(path: &Utf8Path) -> Result<MountInfo> {
    let mut cmd = Command::new("findmnt");
    // The column list feeds the MountInfo fields; keep the two in step.
    cmd.args(["-J", "-v", "--output=SOURCE,FSTYPE,OPTIONS,UUID"]);
    cmd.arg(path.as_str());
    let parsed: FindmntOutput = cmd.run_and_parse_json()?;
    parsed
        .filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("nothing mounted at {path}"))
}

/// Mount a filesystem.  The target directory is created if missing.
#[context("Mounting {device} at {target}")]
pub(crate) fn mount(
    device: &Utf8Path,
    target: &Utf8Path,
    fstype: &str,
    options: &[String],
) -> Result<()> {
    std::fs::create_dir_all(target).with_context(|| format!("creating {target}"))?;
    let data = options.join(",");
    tracing::debug!("mount -t {fstype} -o {data:?} {device} {target}");
    rustix::mount::mount(
        device.as_std_path(),
        target.as_std_path(),
        fstype,
        rustix::mount::MountFlags::empty(),
        data.as_str(),
    )
    .map_err(Into::into)
}

/// Bind-mount `source` onto `target`, creating the target directory.
#[context("Bind mounting {source} at {target}")]
pub(crate) fn bind_mount(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(target).with_context(|| format!("creating {target}"))?;
    tracing::debug!("mount --bind {source} {target}");
    rustix::mount::mount_bind(source.as_std_path(), target.as_std_path()).map_err(Into::into)
}

#[context("Unmounting {target}")]
pub(crate) fn unmount(target: &Utf8Path) -> Result<()> {
    tracing::debug!("umount {target}");
    rustix::mount::unmount(target.as_std_path(), rustix::mount::UnmountFlags::empty())
        .map_err(Into::into)
}

/// Extract the snapshot ID when the mount options reference a snapshot
/// subvolume of the `@` tree.
pub(crate) fn snapshot_id_from_options(options: &str) -> Option<u64> {
    let re = regex::Regex::new(r"subvol=/?@/\.snapshots/(\d+)/snapshot").unwrap();
    re.captures(options)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
