//! The deployment model.
//!
//! A [`Deployment`] is the declarative description of everything the engine
//! acts on: target disks and partitions, read-write volumes, the image
//! source and the boot configuration.  It is loaded from YAML (or built
//! from defaults), validated by [`Deployment::sanitize`] before any use,
//! and serialized into `/etc/elemental/deployment.yaml` inside every
//! committed snapshot so later upgrades can re-read it.

use std::fmt::Display;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::imagesource::ImageSource;

/// Location of the persisted deployment, relative to a system root.
pub const DEPLOYMENT_PATH: &str = "etc/elemental/deployment.yaml";
/// Location of the optional extension list, relative to a system root.
pub const EXTENSIONS_PATH: &str = "etc/elemental/extensions.yaml";

const DEPLOYMENT_HEADER: &str = "# self-generated content, do not edit\n";

pub(crate) const DEFAULT_SYSTEM_LABEL: &str = "SYSTEM";
pub(crate) const DEFAULT_EFI_LABEL: &str = "EFI";
pub(crate) const DEFAULT_RECOVERY_LABEL: &str = "RECOVERY";
pub(crate) const DEFAULT_EFI_MOUNTPOINT: &str = "/boot/efi";
/// Recovery partitions always mount here.
pub(crate) const RECOVERY_MOUNTPOINT: &str = "/run/elemental/recovery";
/// Smallest EFI partition we accept.
pub const EFI_MIN_SIZE_MIB: u64 = 256;
/// EFI partition size used when the deployment does not specify one.
pub const EFI_DEFAULT_SIZE_MIB: u64 = 1024;
/// Snapshots kept after pruning, unless the deployment overrides it.
pub const DEFAULT_MAX_SNAPSHOTS: u32 = 8;

/// Filesystems a partition can be formatted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Btrfs,
    Ext2,
    Ext4,
    Xfs,
    Vfat,
}

impl Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FsKind::Btrfs => "btrfs",
            FsKind::Ext2 => "ext2",
            FsKind::Ext4 => "ext4",
            FsKind::Xfs => "xfs",
            FsKind::Vfat => "vfat",
        };
        f.write_str(s)
    }
}

/// The role a partition plays in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartRole {
    Efi,
    System,
    Recovery,
    #[default]
    Data,
}

impl Display for PartRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PartRole::Efi => "efi",
            PartRole::System => "system",
            PartRole::Recovery => "recovery",
            PartRole::Data => "data",
        };
        f.write_str(s)
    }
}

/// Which snapshot backend drives the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotterKind {
    /// Full copy-on-write snapshots with three-way volume merges.
    #[default]
    Snapper,
    /// Plain directories, no history.  Debugging only; cannot roll back.
    Overwrite,
}

/// The bootloader flavor wired up on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bootloader {
    #[default]
    Grub,
    /// Skip boot entry management entirely.
    None,
}

/// Boot-time configuration recorded per deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootConfig {
    #[serde(default)]
    pub bootloader: Bootloader,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_cmdline: String,
}

/// A read-write subvolume anchored below a partition's filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RwVolume {
    /// Absolute path of the volume inside the system tree.
    pub path: Utf8PathBuf,
    /// Participates in three-way merges across upgrades.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub snapshotted: bool,
    /// Disable copy-on-write for the volume's data.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_copy_on_write: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_opts: Vec<String>,
}

impl RwVolume {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn snapshotted(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            snapshotted: true,
            ..Self::new(path)
        }
    }
}

/// A single partition of a target disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FsKind>,
    /// Size in MiB; 0 means "fill the remaining space" and is only allowed
    /// on the last partition of a disk.
    #[serde(default, rename = "sizeMiB", skip_serializing_if = "is_zero")]
    pub size_mib: u64,
    #[serde(default)]
    pub role: PartRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_sector: Option<u64>,
    #[serde(default, skip_serializing_if = "path_is_empty")]
    pub mount_point: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_opts: Vec<String>,
    /// Populated after partitioning; used for mount-by-UUID lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rw_volumes: Vec<RwVolume>,
    /// Hidden partitions are not surfaced in the generated fstab.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn path_is_empty(p: &Utf8PathBuf) -> bool {
    p.as_str().is_empty()
}

impl Partition {
    fn is_unset(&self) -> bool {
        self == &Partition::default()
    }
}

/// A target disk with its ordered partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Runtime-only: the block device the disk maps to.  Never serialized.
    #[serde(skip)]
    pub device: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<Partition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_sector: Option<u64>,
}

/// Options for [`Deployment::sanitize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SanitizeOpts {
    /// Accept disk devices that do not (yet) exist on the host.
    pub skip_device_check: bool,
}

/// The root description of an installed or to-be-installed system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
    #[serde(default, skip_serializing_if = "ImageSource::is_empty")]
    pub source: ImageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<ImageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_script: Option<Utf8PathBuf>,
    #[serde(default)]
    pub boot_config: BootConfig,
    #[serde(default)]
    pub snapshotter: SnapshotterKind,
    /// Snapshots kept when pruning after a commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_snapshots: Option<u32>,
    /// Require image signature verification in external unpackers.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub verify_signatures: bool,
}

impl Deployment {
    /// The standard single-disk layout: an EFI partition plus a btrfs
    /// system partition carrying the usual read-write volumes.
    pub fn with_defaults() -> Self {
        Self {
            disks: vec![Disk {
                device: Utf8PathBuf::new(),
                partitions: vec![
                    Partition {
                        label: DEFAULT_EFI_LABEL.into(),
                        filesystem: Some(FsKind::Vfat),
                        size_mib: EFI_DEFAULT_SIZE_MIB,
                        role: PartRole::Efi,
                        mount_point: DEFAULT_EFI_MOUNTPOINT.into(),
                        ..Default::default()
                    },
                    Partition {
                        label: DEFAULT_SYSTEM_LABEL.into(),
                        filesystem: Some(FsKind::Btrfs),
                        // Fill the rest of the disk.
                        size_mib: 0,
                        role: PartRole::System,
                        mount_point: "/".into(),
                        rw_volumes: vec![
                            RwVolume::snapshotted("/etc"),
                            RwVolume {
                                no_copy_on_write: true,
                                ..RwVolume::new("/var")
                            },
                            RwVolume::new("/home"),
                        ],
                        ..Default::default()
                    },
                ],
                start_sector: None,
            }],
            ..Default::default()
        }
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.disks.iter().flat_map(|d| d.partitions.iter())
    }

    fn partitions_mut(&mut self) -> impl Iterator<Item = &mut Partition> {
        self.disks.iter_mut().flat_map(|d| d.partitions.iter_mut())
    }

    fn find_role(&self, role: PartRole) -> impl Iterator<Item = &Partition> {
        self.partitions().filter(move |p| p.role == role)
    }

    pub fn system_partition(&self) -> Result<&Partition> {
        self.find_role(PartRole::System)
            .next()
            .ok_or_else(|| anyhow::anyhow!("deployment has no system partition"))
    }

    pub fn efi_partition(&self) -> Result<&Partition> {
        self.find_role(PartRole::Efi)
            .next()
            .ok_or_else(|| anyhow::anyhow!("deployment has no EFI partition"))
    }

    pub(crate) fn max_snapshots(&self) -> u32 {
        self.max_snapshots.unwrap_or(DEFAULT_MAX_SNAPSHOTS)
    }

    /// Validate the deployment, filling in defaults.  Runs an ordered chain
    /// of checks and fails with the first violation.  Idempotent.
    #[context("Validating deployment")]
    pub fn sanitize(&mut self, opts: &SanitizeOpts) -> Result<()> {
        self.check_system_partition()?;
        self.check_efi_partition()?;
        self.check_recovery_partition()?;
        self.check_partition_sizes()?;
        self.check_disk_devices(opts)?;
        self.default_filesystems();
        self.check_rw_volumes()?;
        Ok(())
    }

    fn check_system_partition(&mut self) -> Result<()> {
        let count = self.find_role(PartRole::System).count();
        if count != 1 {
            bail!("deployment requires exactly one system partition, found {count}");
        }
        let part = self
            .partitions_mut()
            .find(|p| p.role == PartRole::System)
            .unwrap();
        match part.filesystem {
            None => part.filesystem = Some(FsKind::Btrfs),
            Some(FsKind::Btrfs) => {}
            Some(o) => bail!("system partition must be btrfs, found {o}"),
        }
        if part.mount_point.as_str().is_empty() {
            part.mount_point = "/".into();
        } else if part.mount_point.as_str() != "/" {
            bail!(
                "system partition must mount at /, found {}",
                part.mount_point
            );
        }
        if part.label.is_empty() {
            part.label = DEFAULT_SYSTEM_LABEL.into();
        }
        Ok(())
    }

    fn check_efi_partition(&mut self) -> Result<()> {
        let count = self.find_role(PartRole::Efi).count();
        if count != 1 {
            bail!("deployment requires exactly one EFI partition, found {count}");
        }
        let part = self
            .partitions_mut()
            .find(|p| p.role == PartRole::Efi)
            .unwrap();
        match part.filesystem {
            None => part.filesystem = Some(FsKind::Vfat),
            Some(FsKind::Vfat) => {}
            Some(o) => bail!("EFI partition must be vfat, found {o}"),
        }
        if part.mount_point.as_str().is_empty() {
            part.mount_point = DEFAULT_EFI_MOUNTPOINT.into();
        }
        if part.size_mib == 0 {
            part.size_mib = EFI_DEFAULT_SIZE_MIB;
        } else if part.size_mib < EFI_MIN_SIZE_MIB {
            bail!(
                "EFI partition of {} MiB is below the {} MiB minimum",
                part.size_mib,
                EFI_MIN_SIZE_MIB
            );
        }
        if !part.rw_volumes.is_empty() {
            bail!("EFI partition cannot carry read-write volumes");
        }
        if part.label.is_empty() {
            part.label = DEFAULT_EFI_LABEL.into();
        }
        Ok(())
    }

    fn check_recovery_partition(&mut self) -> Result<()> {
        let count = self.find_role(PartRole::Recovery).count();
        if count > 1 {
            bail!("at most one recovery partition is supported, found {count}");
        }
        if let Some(part) = self
            .partitions_mut()
            .find(|p| p.role == PartRole::Recovery)
        {
            part.mount_point = RECOVERY_MOUNTPOINT.into();
            if part.filesystem.is_none() {
                part.filesystem = Some(FsKind::Ext4);
            }
            if part.label.is_empty() {
                part.label = DEFAULT_RECOVERY_LABEL.into();
            }
        }
        Ok(())
    }

    fn check_partition_sizes(&self) -> Result<()> {
        for disk in &self.disks {
            let Some((_last, rest)) = disk.partitions.split_last() else {
                continue;
            };
            if let Some(p) = rest.iter().find(|p| p.size_mib == 0) {
                bail!(
                    "partition {:?} has no size; only the last partition of a disk may fill remaining space",
                    p.label
                );
            }
        }
        Ok(())
    }

    fn check_disk_devices(&self, opts: &SanitizeOpts) -> Result<()> {
        if opts.skip_device_check {
            return Ok(());
        }
        for disk in &self.disks {
            if disk.device.as_str().is_empty() {
                continue;
            }
            if !crate::blockdev::device_exists(&disk.device) {
                bail!("disk device {} does not exist", disk.device);
            }
        }
        Ok(())
    }

    fn default_filesystems(&mut self) {
        for part in self.partitions_mut() {
            if part.filesystem.is_none() {
                part.filesystem = Some(FsKind::Btrfs);
            }
        }
    }

    fn check_rw_volumes(&self) -> Result<()> {
        let mut seen: Vec<&Utf8Path> = Vec::new();
        for part in self.partitions() {
            if part.rw_volumes.is_empty() {
                continue;
            }
            if part.filesystem != Some(FsKind::Btrfs) {
                bail!(
                    "read-write volumes require a btrfs partition, {:?} is {}",
                    part.label,
                    part.filesystem.map(|f| f.to_string()).unwrap_or_default()
                );
            }
            for vol in &part.rw_volumes {
                if !vol.path.is_absolute() {
                    bail!("read-write volume path {:?} is not absolute", vol.path);
                }
                for &prior in &seen {
                    if prior == vol.path.as_path() {
                        bail!("duplicate read-write volume path {}", vol.path);
                    }
                    if prior.starts_with(vol.path.as_path()) || vol.path.starts_with(prior) {
                        bail!(
                            "read-write volume paths may not nest: {} vs {}",
                            prior,
                            vol.path
                        );
                    }
                }
                seen.push(vol.path.as_path());
            }
        }
        Ok(())
    }

    /// Overwrite our fields with the non-zero fields of `src`.  Disks and
    /// partitions merge positionally: index i of `src` onto index i of
    /// ours, an unset entry keeps ours, excess entries are appended.
    pub fn merge(&mut self, src: Deployment) {
        merge_positional(&mut self.disks, src.disks, Disk::merge, |d| {
            d == &Disk::default()
        });
        if !src.source.is_empty() {
            self.source = src.source;
        }
        if src.overlay.is_some() {
            self.overlay = src.overlay;
        }
        if src.config_script.is_some() {
            self.config_script = src.config_script;
        }
        if src.boot_config.bootloader != Bootloader::default() {
            self.boot_config.bootloader = src.boot_config.bootloader;
        }
        if !src.boot_config.kernel_cmdline.is_empty() {
            self.boot_config.kernel_cmdline = src.boot_config.kernel_cmdline;
        }
        if src.snapshotter != SnapshotterKind::default() {
            self.snapshotter = src.snapshotter;
        }
        if src.max_snapshots.is_some() {
            self.max_snapshots = src.max_snapshots;
        }
        if src.verify_signatures {
            self.verify_signatures = true;
        }
    }

    /// Load the persisted deployment below `root`.  A missing file is not
    /// an error; it yields an empty deployment and a warning.
    #[context("Reading deployment")]
    pub fn parse(root: &Utf8Path) -> Result<Deployment> {
        let path = root.join(DEPLOYMENT_PATH);
        let buf = match std::fs::read_to_string(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("no deployment file at {path}");
                return Ok(Deployment::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {path}")),
        };
        serde_yaml::from_str(&buf).with_context(|| format!("parsing {path}"))
    }

    /// Persist the deployment below `root`, atomically replacing any
    /// previous file.  The result is read-only with a generated-content
    /// header.
    #[context("Writing deployment")]
    pub fn write(&self, root: &Utf8Path) -> Result<()> {
        use std::io::Write as _;
        let path = root.join(DEPLOYMENT_PATH);
        let parent = path.parent().unwrap();
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
        let mut f = tempfile::NamedTempFile::new_in(parent)?;
        f.write_all(DEPLOYMENT_HEADER.as_bytes())?;
        serde_yaml::to_writer(&mut f, self)?;
        f.as_file()
            .set_permissions(std::os::unix::fs::PermissionsExt::from_mode(0o444))?;
        // Replace whatever was there before, read-only or not.
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {path}")),
        }
        f.persist(&path)
            .with_context(|| format!("persisting {path}"))?;
        Ok(())
    }
}

impl Disk {
    fn merge(&mut self, src: Disk) {
        if !src.device.as_str().is_empty() {
            self.device = src.device;
        }
        if src.start_sector.is_some() {
            self.start_sector = src.start_sector;
        }
        merge_positional(
            &mut self.partitions,
            src.partitions,
            Partition::merge,
            Partition::is_unset,
        );
    }
}

impl Partition {
    fn merge(&mut self, src: Partition) {
        if !src.label.is_empty() {
            self.label = src.label;
        }
        if src.filesystem.is_some() {
            self.filesystem = src.filesystem;
        }
        if src.size_mib != 0 {
            self.size_mib = src.size_mib;
        }
        if src.role != PartRole::default() {
            self.role = src.role;
        }
        if src.start_sector.is_some() {
            self.start_sector = src.start_sector;
        }
        if !src.mount_point.as_str().is_empty() {
            self.mount_point = src.mount_point;
        }
        if !src.mount_opts.is_empty() {
            self.mount_opts = src.mount_opts;
        }
        if src.uuid.is_some() {
            self.uuid = src.uuid;
        }
        if !src.rw_volumes.is_empty() {
            self.rw_volumes = src.rw_volumes;
        }
        if src.hidden {
            self.hidden = true;
        }
    }
}

fn merge_positional<T>(
    dst: &mut Vec<T>,
    src: Vec<T>,
    merge: impl Fn(&mut T, T),
    is_unset: impl Fn(&T) -> bool,
) {
    let mut src = src.into_iter();
    for dst_item in dst.iter_mut() {
        let Some(src_item) = src.next() else {
            return;
        };
        if !is_unset(&src_item) {
            merge(dst_item, src_item);
        }
    }
    dst.extend(src);
}

/// A named system extension: a display name, an image carrying the
/// extension content and the kernel modules it provides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub name: String,
    pub image: ImageSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
}

/// Load `/etc/elemental/extensions.yaml` below `root`; missing file means
/// no extensions.
#[context("Reading extensions")]
pub fn parse_extensions(root: &Utf8Path) -> Result<Vec<Extension>> {
    let path = root.join(EXTENSIONS_PATH);
    let buf = match std::fs::read_to_string(&path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {path}")),
    };
    serde_yaml::from_str(&buf).with_context(|| format!("parsing {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitized_defaults() -> Deployment {
        let mut d = Deployment::with_defaults();
        d.sanitize(&SanitizeOpts::default()).unwrap();
        d
    }

    #[test]
    fn test_defaults_sanitize() {
        let d = sanitized_defaults();
        assert_eq!(d.system_partition().unwrap().label, "SYSTEM");
        assert_eq!(d.efi_partition().unwrap().mount_point, "/boot/efi");
    }

    #[test]
    fn test_sanitize_idempotent() {
        let once = sanitized_defaults();
        let mut twice = once.clone();
        twice.sanitize(&SanitizeOpts::default()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_exactly_one_system_and_efi() {
        let mut d = Deployment::with_defaults();
        d.disks[0].partitions.push(Partition {
            role: PartRole::System,
            ..Default::default()
        });
        let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
        assert!(format!("{e:#}").contains("exactly one system partition"));

        let mut d = Deployment::with_defaults();
        d.disks[0].partitions.remove(0);
        let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
        assert!(format!("{e:#}").contains("EFI"));
    }

    #[test]
    fn test_efi_minimum_size() {
        let mut d = Deployment::with_defaults();
        d.disks[0].partitions[0].size_mib = 16;
        let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
        assert!(format!("{e:#}").contains("minimum"));
    }

    #[test]
    fn test_efi_rejects_rw_volumes() {
        let mut d = Deployment::with_defaults();
        d.disks[0].partitions[0].rw_volumes.push(RwVolume::new("/x"));
        assert!(d.sanitize(&SanitizeOpts::default()).is_err());
    }

    #[test]
    fn test_recovery_forced_mountpoint() {
        let mut d = Deployment::with_defaults();
        d.disks[0].partitions.push(Partition {
            role: PartRole::Recovery,
            mount_point: "/somewhere".into(),
            size_mib: 512,
            ..Default::default()
        });
        // Recovery comes before the filler-size system partition.
        let parts = &mut d.disks[0].partitions;
        let recovery = parts.pop().unwrap();
        parts.insert(1, recovery);
        d.sanitize(&SanitizeOpts::default()).unwrap();
        let rec = d
            .partitions()
            .find(|p| p.role == PartRole::Recovery)
            .unwrap();
        assert_eq!(rec.mount_point, RECOVERY_MOUNTPOINT);
        assert_eq!(rec.filesystem, Some(FsKind::Ext4));
    }

    #[test]
    fn test_fill_size_only_on_last_partition() {
        let mut d = Deployment::with_defaults();
        // System (size 0) first, EFI second.
        d.disks[0].partitions.swap(0, 1);
        let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
        assert!(format!("{e:#}").contains("last partition"));
    }

    #[test]
    fn test_missing_device_rejected_unless_skipped() {
        let mut d = Deployment::with_defaults();
        d.disks[0].device = "/dev/does-not-exist-xyzzy".into();
        assert!(d.sanitize(&SanitizeOpts::default()).is_err());
        d.sanitize(&SanitizeOpts {
            skip_device_check: true,
        })
        .unwrap();
    }

    #[test]
    fn test_default_filesystem_is_btrfs() {
        let mut d = Deployment::with_defaults();
        d.disks[0].partitions.push(Partition {
            role: PartRole::Data,
            size_mib: 512,
            ..Default::default()
        });
        let parts = &mut d.disks[0].partitions;
        let data = parts.pop().unwrap();
        parts.insert(1, data);
        d.sanitize(&SanitizeOpts::default()).unwrap();
        let data = d.partitions().find(|p| p.role == PartRole::Data).unwrap();
        assert_eq!(data.filesystem, Some(FsKind::Btrfs));
    }

    #[test]
    fn test_rw_volume_path_rules() {
        let mut d = Deployment::with_defaults();
        d.disks[0].partitions[1]
            .rw_volumes
            .push(RwVolume::new("relative"));
        assert!(d.sanitize(&SanitizeOpts::default()).is_err());

        let mut d = Deployment::with_defaults();
        d.disks[0].partitions[1].rw_volumes.push(RwVolume::new("/etc"));
        let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
        assert!(format!("{e:#}").contains("duplicate"));

        let mut d = Deployment::with_defaults();
        d.disks[0].partitions[1]
            .rw_volumes
            .push(RwVolume::new("/etc/ssh"));
        let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
        assert!(format!("{e:#}").contains("nest"));
    }

    #[test]
    fn test_rw_volumes_require_btrfs() {
        let mut d = Deployment::with_defaults();
        d.disks[0].partitions.push(Partition {
            role: PartRole::Data,
            filesystem: Some(FsKind::Xfs),
            size_mib: 512,
            rw_volumes: vec![RwVolume::snapshotted("/data")],
            ..Default::default()
        });
        let parts = &mut d.disks[0].partitions;
        let data = parts.pop().unwrap();
        parts.insert(1, data);
        let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
        assert!(format!("{e:#}").contains("btrfs"));
    }

    #[test]
    fn test_snapshotted_volumes_allowed_on_data_btrfs() {
        let mut d = Deployment::with_defaults();
        d.disks[0].partitions.push(Partition {
            role: PartRole::Data,
            filesystem: Some(FsKind::Btrfs),
            size_mib: 512,
            rw_volumes: vec![RwVolume::snapshotted("/data")],
            ..Default::default()
        });
        let parts = &mut d.disks[0].partitions;
        let data = parts.pop().unwrap();
        parts.insert(1, data);
        d.sanitize(&SanitizeOpts::default()).unwrap();
    }

    #[test]
    fn test_yaml_round_trip_drops_device() {
        let mut d = sanitized_defaults();
        d.disks[0].device = "/dev/vda".into();
        d.source = ImageSource::oci("registry.example.com/os:1.0");
        let y = serde_yaml::to_string(&d).unwrap();
        assert!(!y.contains("/dev/vda"));
        let parsed: Deployment = serde_yaml::from_str(&y).unwrap();
        let mut expected = d.clone();
        expected.disks[0].device = Utf8PathBuf::new();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_role_and_fs_serialize_lowercase() {
        let y = serde_yaml::to_string(&sanitized_defaults()).unwrap();
        assert!(y.contains("role: efi"), "{y}");
        assert!(y.contains("role: system"), "{y}");
        assert!(y.contains("filesystem: vfat"), "{y}");
        assert!(y.contains("filesystem: btrfs"), "{y}");
        assert!(serde_yaml::from_str::<FsKind>("reiserfs").is_err());
        assert!(serde_yaml::from_str::<PartRole>("boot").is_err());
    }

    #[test]
    fn test_merge_positional() {
        let mut dst = sanitized_defaults();
        let mut src = Deployment::default();
        // Unset first entry keeps dst's EFI; second entry overrides the
        // system label; a third partition is appended.
        src.disks.push(Disk {
            partitions: vec![
                Partition::default(),
                Partition {
                    label: "ROOT".into(),
                    ..Default::default()
                },
                Partition {
                    role: PartRole::Data,
                    label: "DATA".into(),
                    size_mib: 256,
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        src.boot_config.kernel_cmdline = "quiet".into();
        dst.merge(src);
        assert_eq!(dst.disks[0].partitions[0].label, "EFI");
        assert_eq!(dst.disks[0].partitions[1].label, "ROOT");
        assert_eq!(dst.disks[0].partitions[1].role, PartRole::System);
        assert_eq!(dst.disks[0].partitions[2].label, "DATA");
        assert_eq!(dst.boot_config.kernel_cmdline, "quiet");
    }

    #[test]
    fn test_merge_replaces_volumes_wholesale() {
        let mut dst = sanitized_defaults();
        let mut src = Deployment::default();
        src.disks.push(Disk {
            partitions: vec![
                Partition::default(),
                Partition {
                    rw_volumes: vec![RwVolume::snapshotted("/srv")],
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        dst.merge(src);
        let vols = &dst.disks[0].partitions[1].rw_volumes;
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].path, "/srv");
    }

    #[test]
    fn test_parse_missing_file_is_empty() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let d = Deployment::parse(root).unwrap();
        assert_eq!(d, Deployment::default());
    }

    #[test]
    fn test_write_then_parse() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let d = sanitized_defaults();
        d.write(root).unwrap();
        let path = root.join(DEPLOYMENT_PATH);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with(DEPLOYMENT_HEADER));
        let mode = std::os::unix::fs::PermissionsExt::mode(
            &std::fs::metadata(&path).unwrap().permissions(),
        );
        assert_eq!(mode & 0o777, 0o444);
        assert_eq!(Deployment::parse(root).unwrap(), d);
        // Overwriting the read-only file must succeed.
        d.write(root).unwrap();
    }

    #[test]
    fn test_parse_extensions() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        assert!(parse_extensions(root).unwrap().is_empty());
        let dir = root.join("etc/elemental");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("extensions.yaml"),
            indoc::indoc! {"
                - name: nvidia
                  image:
                    uri: oci://registry.example.com/nvidia:550
                  modules: [nvidia, nvidia_drm]
            "},
        )
        .unwrap();
        let exts = parse_extensions(root).unwrap();
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0].modules, vec!["nvidia", "nvidia_drm"]);
    }
}
