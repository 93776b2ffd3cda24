//! Synchronized tree population.
//!
//! Both the image unpack into a fresh snapshot and the per-volume delta
//! merge ride on rsync with one fixed flag set.  The unpack is
//! "synchronized": stale destination files are deleted, except below the
//! protected paths (mount points and read-write volume roots), and the
//! excluded paths are never written at all.

use anyhow::{bail, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::imagesource::{ImageKind, ImageSource};
use crate::task::Task;

const RSYNC_FLAGS: &[&str] = &[
    "--info=progress2",
    "--human-readable",
    "--partial",
    "--archive",
    "--xattrs",
    "--acls",
    "--filter=-x security.selinux",
];

/// What a synchronized unpack must leave alone.
#[derive(Debug, Clone, Default)]
pub(crate) struct SyncSpec {
    /// Paths never written to the destination.
    pub(crate) excludes: Vec<Utf8PathBuf>,
    /// Paths that may be written but never deleted at the destination.
    pub(crate) protected: Vec<Utf8PathBuf>,
    /// Remove destination files absent from the source.  On for the main
    /// image, off for overlay trees layered on top of it.
    pub(crate) delete: bool,
}

impl SyncSpec {
    pub(crate) fn synchronized() -> Self {
        Self {
            delete: true,
            ..Default::default()
        }
    }
}

/// Assemble the rsync argument list for a synchronized unpack.
fn sync_args(spec: &SyncSpec) -> Vec<String> {
    let mut args: Vec<String> = RSYNC_FLAGS.iter().map(|s| s.to_string()).collect();
    if spec.delete {
        args.push("--delete".into());
    }
    for p in &spec.excludes {
        args.push(format!("--exclude={p}"));
    }
    for p in &spec.protected {
        args.push(format!("--filter=P {p}"));
    }
    args
}

/// Mirror `src` into `dst` honoring the spec.  Trailing-slash semantics:
/// the contents of `src` land directly below `dst`.
pub(crate) fn sync_tree(
    description: impl AsRef<str>,
    src: &Utf8Path,
    dst: &Utf8Path,
    spec: &SyncSpec,
    token: &CancellationToken,
) -> Result<()> {
    Task::new(description.as_ref(), "rsync")
        .args(sync_args(spec))
        .arg(format!("{src}/"))
        .arg(dst.as_str())
        .cancellable(token)
        .run()
}

/// Apply the user's changes (everything in `modified` that differs from
/// `old`) onto `new`.  Straight last-writer-wins delta: no conflict
/// detection, and deletions relative to `old` do not propagate.
pub(crate) fn apply_delta(
    old: &Utf8Path,
    modified: &Utf8Path,
    new: &Utf8Path,
    token: &CancellationToken,
) -> Result<()> {
    Task::new(format!("Merging changes into {new}"), "rsync")
        .args(RSYNC_FLAGS.iter().copied())
        .arg(format!("--compare-dest={old}"))
        .arg(format!("--exclude=/{}", crate::snapshotter::SNAPSHOTS_DIR))
        .arg(format!("{modified}/"))
        .arg(new.as_str())
        .cancellable(token)
        .run()
}

/// Something that can populate a snapshot from an image source.  OCI and
/// tar payloads are handled by external unpackers behind this same
/// interface; the engine ships the directory and empty variants it needs
/// itself.
pub(crate) trait ImageUnpacker: std::fmt::Debug {
    /// Unpack into `target`, honoring the sync spec.  Returns the content
    /// digest of the source, or an empty string if the source kind has
    /// none.
    fn unpack(&self, target: &Utf8Path, spec: &SyncSpec, token: &CancellationToken)
        -> Result<String>;
}

#[derive(Debug)]
struct DirUnpacker {
    src: Utf8PathBuf,
}

impl ImageUnpacker for DirUnpacker {
    fn unpack(
        &self,
        target: &Utf8Path,
        spec: &SyncSpec,
        token: &CancellationToken,
    ) -> Result<String> {
        if !self.src.as_std_path().is_dir() {
            bail!("image source directory {} does not exist", self.src);
        }
        sync_tree(
            format!("Unpacking {} into {target}", self.src),
            &self.src,
            target,
            spec,
            token,
        )?;
        Ok(String::new())
    }
}

#[derive(Debug)]
struct EmptyUnpacker;

impl ImageUnpacker for EmptyUnpacker {
    fn unpack(
        &self,
        _target: &Utf8Path,
        _spec: &SyncSpec,
        _token: &CancellationToken,
    ) -> Result<String> {
        Ok(String::new())
    }
}

/// Resolve the unpacker for an image source.
pub(crate) fn unpacker_for(source: &ImageSource) -> Result<Box<dyn ImageUnpacker>> {
    match source.kind {
        ImageKind::Dir => Ok(Box::new(DirUnpacker {
            src: source.value.clone().into(),
        })),
        ImageKind::Empty => Ok(Box::new(EmptyUnpacker)),
        ImageKind::Oci | ImageKind::Tar | ImageKind::Raw => {
            bail!("image source {source} requires an external unpacker")
        }
    }
}
