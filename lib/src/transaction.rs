//! The transaction engine.
//!
//! A transaction owns exactly one new snapshot plus every mount and
//! temporary directory needed to populate it.  The caller drives the
//! fixed sequence `init` → `start` → `sync_image_content` → `merge` →
//! `update_fstab` → `lock` → (boot entry install) → `commit`; any error
//! funnels into `rollback`, which unwinds the cleanup stack and deletes
//! the in-progress snapshot.  Either way the transaction reaches exactly
//! one terminal state.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::blockdev;
use crate::chroot;
use crate::cleanup::{join_errors, CleanupStack};
use crate::deployment::{Deployment, PartRole, Partition, RwVolume};
use crate::fstab;
use crate::mount;
use crate::snapshotter::{
    config_name, snapshot_rel_path, userdata, Snapshotter, Userdata, SNAPSHOTS_DIR, TOP_SUBVOL,
};
use crate::sync::{self, SyncSpec};
use crate::task::check_cancelled;

/// Snapshot metadata marking an unfinished update.
const UPDATE_IN_PROGRESS: &str = "update-in-progress";
/// Metadata tag on the pristine per-volume snapshot of a generation.
const STOCK: &str = "stock";
/// Metadata tag on the per-volume capture taken right after a commit.
const POST_TRANSACTION: &str = "post-transaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Started,
    Committed,
    Failed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionStatus::Started => "started",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The three-way merge triple for one snapshotted volume.
#[derive(Debug, Clone, Default)]
pub struct Merge {
    /// Stock snapshot of the volume in the previous system.
    pub old: Utf8PathBuf,
    /// The volume in the incoming system, carrying the fresh stock
    /// contents; recorded after image sync.  The stock snapshot itself
    /// stays pristine so the next upgrade diffs against an unmodified
    /// base.
    pub new: Option<Utf8PathBuf>,
    /// Capture of the live volume taken just before the upgrade.
    pub modified: Utf8PathBuf,
}

/// One in-flight update: a new snapshot and its merge bookkeeping.
#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    /// Absolute path of the snapshot's root directory.
    pub path: Utf8PathBuf,
    pub merges: BTreeMap<Utf8PathBuf, Merge>,
    status: TransactionStatus,
}

impl Transaction {
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    fn ensure_started(&self) -> Result<()> {
        if self.status != TransactionStatus::Started {
            bail!(
                "transaction {} is {}, expected started",
                self.id,
                self.status
            );
        }
        Ok(())
    }
}

/// The engine driving one update.  Created by [`UpgradeHelper::init`],
/// which probes the host; consumed by `commit` or `rollback`.
#[derive(Debug)]
pub struct UpgradeHelper {
    deployment: Deployment,
    snapshotter: Snapshotter,
    token: CancellationToken,
    /// Where the system partition's top-level subvolume is mounted.
    top_dir: Utf8PathBuf,
    /// Default snapshot before this transaction, if any.
    default_id: Option<u64>,
    /// Snapshot the running system is booted from, if it is this disk.
    active_id: Option<u64>,
    cleanup: CleanupStack,
    /// Keeps the temporary mountpoint directory alive.
    _workdir: Option<tempfile::TempDir>,
}

impl UpgradeHelper {
    /// Probe the host and prepare for a transaction.  Mounts the system
    /// partition's top-level subvolume, performs first-time root volume
    /// setup on a fresh filesystem and records the default and active
    /// snapshot IDs.  Idempotent: re-running against an initialized
    /// system only probes.
    #[context("Initializing upgrade")]
    pub fn init(deployment: Deployment, token: CancellationToken) -> Result<Self> {
        check_cancelled(&token, "initialization")?;
        let snapshotter = Snapshotter::new(deployment.snapshotter);
        let system = deployment.system_partition()?;
        // Prefer a lookup scoped to the disk named by the deployment; an
        // upgrade run has no disk device and searches the whole host.
        let system_disk = deployment
            .disks
            .iter()
            .find(|d| d.partitions.iter().any(|p| p.role == PartRole::System))
            .filter(|d| !d.device.as_str().is_empty());
        let probe = match system_disk {
            Some(disk) => blockdev::find_partition_on_disk(&disk.device, system)?,
            None => blockdev::find_partition_device(system)?,
        };
        let device: Utf8PathBuf = probe.path.into();

        // Whether we are booted from a snapshot on this very partition,
        // matched by device node or by the persisted partition UUID.
        let active_id = mount::inspect_filesystem(Utf8Path::new("/"))
            .ok()
            .filter(|info| {
                let same_device = info.source.starts_with(device.as_str());
                let same_uuid = info.uuid.is_some() && info.uuid == system.uuid;
                info.fstype == "btrfs" && (same_device || same_uuid)
            })
            .and_then(|info| info.snapshot_id());

        let workdir = tempfile::Builder::new()
            .prefix("elemental-top.")
            .tempdir()
            .context("creating work directory")?;
        let top_dir = Utf8Path::from_path(workdir.path())
            .ok_or_else(|| anyhow::anyhow!("non UTF-8 temporary path"))?
            .to_owned();
        let mut cleanup = CleanupStack::new();
        mount::mount(&device, &top_dir, "btrfs", &["subvolid=5".to_string()])?;
        {
            let top_dir = top_dir.clone();
            cleanup.push_always(format!("unmount {top_dir}"), move || {
                mount::unmount(&top_dir)
            });
        }

        let snapshots = top_dir.join(TOP_SUBVOL).join(SNAPSHOTS_DIR);
        if !snapshots.as_std_path().exists() {
            tracing::info!("fresh filesystem on {device}, setting up root volumes");
            snapshotter.init_root_volumes(&top_dir)?;
        }
        let default_id = snapshotter
            .get_default(&top_dir)
            .context("probing default snapshot")?;

        let mut helper = Self {
            deployment,
            snapshotter,
            token,
            top_dir,
            default_id,
            active_id,
            cleanup,
            _workdir: Some(workdir),
        };

        if let Some(default) = default_id {
            // Operating against an offline disk: root snapshot creation
            // must land in the shared snapshot store, which the booted
            // case gets from its own fstab.
            if active_id.is_none() {
                let store = helper.top_dir.join(TOP_SUBVOL).join(SNAPSHOTS_DIR);
                let target = helper.old_root().join(SNAPSHOTS_DIR);
                mount::bind_mount(&store, &target)?;
                helper
                    .cleanup
                    .push_always(format!("unmount {target}"), move || mount::unmount(&target));
            }
            let existing = helper
                .snapshotter
                .list_snapshots(&helper.old_root(), "root")?;
            tracing::debug!(
                "found {} snapshots, default {default}, active {:?}",
                existing.len(),
                helper.active_id
            );
        }
        Ok(helper)
    }

    /// Root of the previous system's tree, used for operations against
    /// its snapshot configurations.
    fn old_root(&self) -> Utf8PathBuf {
        match (self.active_id, self.default_id) {
            (Some(_), _) => Utf8PathBuf::from("/"),
            (None, Some(default)) => self.top_dir.join(snapshot_rel_path(default)),
            (None, None) => self.top_dir.clone(),
        }
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// IDs of the snapshots present on disk, straight from the snapshot
    /// store layout.
    pub fn snapshot_ids(&self) -> Result<Vec<u64>> {
        let dir = self.top_dir.join(TOP_SUBVOL).join(SNAPSHOTS_DIR);
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {dir}"))? {
            if let Some(id) = entry?.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn snapshotted_volumes(&self) -> Vec<(Partition, RwVolume)> {
        self.deployment
            .partitions()
            .flat_map(|p| {
                p.rw_volumes
                    .iter()
                    .filter(|v| v.snapshotted)
                    .map(move |v| (p.clone(), v.clone()))
            })
            .collect()
    }

    /// Open a transaction: create the new snapshot and prepare its mount
    /// tree.  Any preparation failure is rolled back before returning.
    #[context("Starting transaction")]
    pub fn start(&mut self) -> Result<Transaction> {
        check_cancelled(&self.token, "transaction start")?;
        let in_progress = userdata(&[(UPDATE_IN_PROGRESS, "yes")]);
        let id = match self.default_id {
            None => self
                .snapshotter
                .first_root_snapshot(&self.top_dir, &in_progress)?,
            Some(base) => self.snapshotter.create_snapshot(
                &self.old_root(),
                "root",
                Some(base),
                true,
                "update",
                &in_progress,
            )?,
        };
        let mut transaction = Transaction {
            id,
            path: self.top_dir.join(snapshot_rel_path(id)),
            merges: BTreeMap::new(),
            status: TransactionStatus::Started,
        };
        tracing::info!("started transaction {id} at {}", transaction.path);
        if let Err(e) = self.prepare_tree(&mut transaction) {
            return Err(self.rollback(&mut transaction, e));
        }
        Ok(transaction)
    }

    /// Mount auxiliary partitions and materialize the read-write volumes
    /// below the new snapshot.
    fn prepare_tree(&mut self, transaction: &mut Transaction) -> Result<()> {
        let deployment = self.deployment.clone();
        for part in deployment.partitions() {
            check_cancelled(&self.token, "snapshot preparation")?;
            let is_system = part.role == PartRole::System;
            if !is_system && !part.mount_point.as_str().is_empty() {
                let device: Utf8PathBuf = blockdev::find_partition_device(part)?.path.into();
                let rel = part.mount_point.as_str().trim_start_matches('/');
                let target = transaction.path.join(rel);
                let fstype = part
                    .filesystem
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "auto".into());
                mount::mount(&device, &target, &fstype, &part.mount_opts)?;
                self.cleanup
                    .push_always(format!("unmount {target}"), move || {
                        mount::unmount(&target)
                    });
            }
            for vol in &part.rw_volumes {
                self.prepare_rw_volume(transaction, part, vol)
                    .with_context(|| format!("preparing volume {}", vol.path))?;
            }
        }
        Ok(())
    }

    fn prepare_rw_volume(
        &mut self,
        transaction: &mut Transaction,
        part: &Partition,
        vol: &RwVolume,
    ) -> Result<()> {
        let is_system = part.role == PartRole::System;
        let rel = vol.path.as_str().trim_start_matches('/');
        let target = transaction.path.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
        }

        // Volumes on other partitions live in that partition's own `@`
        // tree; the system partition's volumes sit directly below the
        // snapshot.
        let vol_top = if is_system {
            None
        } else {
            Some(self.mount_partition_workdir(part)?)
        };

        if vol.snapshotted && self.snapshotter.supports_volume_snapshots() {
            if target.as_std_path().exists() {
                std::fs::remove_dir_all(&target).with_context(|| format!("clearing {target}"))?;
            }
            let destination = match &vol_top {
                None => target.clone(),
                Some(top) => {
                    let numbered = top
                        .join(TOP_SUBVOL)
                        .join(SNAPSHOTS_DIR)
                        .join(transaction.id.to_string());
                    let nested = numbered.join("snapshot");
                    std::fs::create_dir_all(&nested)
                        .with_context(|| format!("creating {nested}"))?;
                    let destination = nested.join(rel);
                    // Rollback only deletes the system snapshot; the
                    // partition-side copy needs its own unwind entry.
                    {
                        let destination = destination.clone();
                        self.cleanup.push_on_error(
                            format!("remove {numbered}"),
                            move || {
                                if destination.as_std_path().exists() {
                                    crate::task::Task::new(
                                        format!("Deleting subvolume {destination}"),
                                        "btrfs",
                                    )
                                    .args(["subvolume", "delete", destination.as_str()])
                                    .run()?;
                                }
                                std::fs::remove_dir_all(&numbered).map_err(Into::into)
                            },
                        );
                    }
                    destination
                }
            };
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if self.default_id.is_some() {
                let (old, modified) = self.capture_volume_history(vol)?;
                self.snapshotter.snapshot_volume(&old, &destination)?;
                transaction.merges.insert(
                    vol.path.clone(),
                    Merge {
                        old,
                        new: None,
                        modified,
                    },
                );
            } else {
                self.snapshotter
                    .create_volume(&destination, vol.no_copy_on_write)?;
            }
            if destination != target {
                mount::bind_mount(&destination, &target)?;
                self.cleanup
                    .push_always(format!("unmount {target}"), move || {
                        mount::unmount(&target)
                    });
            }
        } else {
            // Plain volumes bind straight out of the `@` tree.
            let top = vol_top.unwrap_or_else(|| self.top_dir.clone());
            let source = top.join(TOP_SUBVOL).join(rel);
            if !source.as_std_path().exists() {
                self.snapshotter
                    .create_volume(&source, vol.no_copy_on_write)?;
            }
            mount::bind_mount(&source, &target)?;
            self.cleanup
                .push_always(format!("unmount {target}"), move || mount::unmount(&target));
        }
        Ok(())
    }

    /// Locate the unique stock snapshot of a volume in the previous
    /// system and capture its current live contents.
    fn capture_volume_history(&self, vol: &RwVolume) -> Result<(Utf8PathBuf, Utf8PathBuf)> {
        let old_root = self.old_root();
        let cfg = config_name(&vol.path);
        let rel = vol.path.as_str().trim_start_matches('/');
        let snapshots = self.snapshotter.list_snapshots(&old_root, &cfg)?;
        let stock: Vec<_> = snapshots
            .iter()
            .filter(|s| s.userdata.get(STOCK).map(String::as_str) == Some("true"))
            .collect();
        let [stock] = stock.as_slice() else {
            bail!(
                "expected exactly one stock snapshot for {}, found {}",
                vol.path,
                stock.len()
            );
        };
        let pre_id = self.snapshotter.create_snapshot(
            &old_root,
            &cfg,
            None,
            false,
            "pre-transaction",
            &Userdata::new(),
        )?;
        let base = old_root.join(rel).join(SNAPSHOTS_DIR);
        let old = base.join(stock.id.to_string()).join("snapshot");
        let modified = base.join(pre_id.to_string()).join("snapshot");
        Ok((old, modified))
    }

    /// Mount a non-system partition at a scratch directory for volume
    /// surgery; reused across volumes of the same partition.
    fn mount_partition_workdir(&mut self, part: &Partition) -> Result<Utf8PathBuf> {
        let device: Utf8PathBuf = blockdev::find_partition_device(part)?.path.into();
        let dir = self
            .top_dir
            .join(".parts")
            .join(device.as_str().trim_start_matches('/').replace('/', "_"));
        if mount::inspect_filesystem(&dir).is_ok() {
            return Ok(dir);
        }
        mount::mount(&device, &dir, "btrfs", &["subvolid=5".to_string()])?;
        {
            let dir = dir.clone();
            self.cleanup
                .push_always(format!("unmount {dir}"), move || mount::unmount(&dir));
        }
        let store = dir.join(TOP_SUBVOL).join(SNAPSHOTS_DIR);
        if !store.as_std_path().exists() {
            self.snapshotter.init_root_volumes(&dir)?;
        }
        Ok(dir)
    }

    /// Populate the snapshot from the deployment's image source and set up
    /// its snapshot configurations.
    #[context("Syncing image content")]
    pub fn sync_image_content(&mut self, transaction: &mut Transaction) -> Result<()> {
        transaction.ensure_started()?;
        check_cancelled(&self.token, "image sync")?;
        let first_install = self.default_id.is_none();
        let spec = build_sync_spec(&self.deployment, first_install);
        let unpacker = sync::unpacker_for(&self.deployment.source)?;
        let digest = unpacker.unpack(&transaction.path, &spec, &self.token)?;
        if !digest.is_empty() {
            self.deployment.source.digest = Some(digest);
        }
        if let Some(overlay) = self.deployment.overlay.clone() {
            let overlay_spec = SyncSpec {
                delete: false,
                ..spec
            };
            let unpacker = sync::unpacker_for(&overlay)?;
            unpacker.unpack(&transaction.path, &overlay_spec, &self.token)?;
        }
        self.configure_snapshot_manager(transaction)
    }

    /// Inside the new snapshot: register a configuration per snapshotted
    /// volume and take its stock snapshot.
    fn configure_snapshot_manager(&mut self, transaction: &mut Transaction) -> Result<()> {
        if !self.snapshotter.supports_volume_snapshots() {
            return Ok(());
        }
        let volumes = self.snapshotted_volumes();
        let max = self.deployment.max_snapshots();
        let snapshotter = &self.snapshotter;
        let merges = &mut transaction.merges;
        chroot::run_in_snapshot(&transaction.path, |root| {
            for (_part, vol) in &volumes {
                snapshotter.create_config(root, &vol.path)?;
                let cfg = config_name(&vol.path);
                let stock_id = snapshotter.create_snapshot(
                    root,
                    &cfg,
                    None,
                    false,
                    "stock",
                    &userdata(&[(STOCK, "true")]),
                )?;
                tracing::debug!("stock snapshot {stock_id} captured for {}", vol.path);
                if let Some(merge) = merges.get_mut(&vol.path) {
                    let rel = vol.path.as_str().trim_start_matches('/');
                    merge.new = Some(root.join(rel));
                }
            }
            snapshotter.configure_root(root, max)
        })
    }

    /// Three-way reconciliation of every snapshotted volume that carries a
    /// merge record: the delta between the previous stock state and the
    /// live capture is applied onto the fresh stock contents.
    /// Last-writer-wins; conflicts are not detected.
    #[context("Merging volume history")]
    pub fn merge(&self, transaction: &mut Transaction) -> Result<()> {
        transaction.ensure_started()?;
        for (path, merge) in &transaction.merges {
            check_cancelled(&self.token, "volume merge")?;
            let Some(new) = &merge.new else {
                tracing::warn!("volume {path} has no stock snapshot to merge onto, skipping");
                continue;
            };
            sync::apply_delta(&merge.old, &merge.modified, new, &self.token)
                .with_context(|| format!("merging {path}"))?;
        }
        Ok(())
    }

    /// Write or rewrite the snapshot's fstab for the new snapshot ID.
    #[context("Updating fstab")]
    pub fn update_fstab(&mut self, transaction: &mut Transaction) -> Result<()> {
        transaction.ensure_started()?;
        self.resolve_partition_uuids()?;
        fstab::write_fstab(&self.deployment, transaction.id, &transaction.path)
    }

    fn resolve_partition_uuids(&mut self) -> Result<()> {
        for disk in &mut self.deployment.disks {
            let scoped = !disk.device.as_str().is_empty();
            for part in &mut disk.partitions {
                if part.uuid.is_some() {
                    continue;
                }
                let probe = if scoped {
                    blockdev::find_partition_on_disk(&disk.device, part)?
                } else {
                    blockdev::find_partition_device(part)?
                };
                part.uuid = probe.uuid;
            }
        }
        Ok(())
    }

    /// Seal the snapshot read-only.
    #[context("Locking snapshot")]
    pub fn lock(&self, transaction: &mut Transaction) -> Result<()> {
        transaction.ensure_started()?;
        self.snapshotter
            .set_permissions(&self.top_dir, transaction.id, false)
    }

    /// Run a caller hook against the sealed snapshot's tree, between
    /// `lock` and `commit`.  The hook sees a read-write view of the
    /// snapshot root with the API filesystems mounted.
    pub fn run_in_snapshot<T>(
        &self,
        transaction: &Transaction,
        hook: impl FnOnce(&Utf8Path) -> Result<T>,
    ) -> Result<T> {
        transaction.ensure_started()?;
        chroot::run_in_snapshot(&transaction.path, hook)
    }

    /// Promote the snapshot to the next-boot default.  After the switch,
    /// pruning and cleanup failures are reported as warnings; the commit
    /// itself stands.
    #[context("Committing transaction")]
    pub fn commit(&mut self, transaction: &mut Transaction) -> Result<()> {
        match transaction.status {
            TransactionStatus::Started => {}
            TransactionStatus::Committed => {
                tracing::warn!("transaction {} is already committed", transaction.id);
                return Ok(());
            }
            TransactionStatus::Failed => {
                bail!("cannot commit failed transaction {}", transaction.id)
            }
        }
        check_cancelled(&self.token, "commit")?;

        // Capture what in-snapshot hooks changed; these captures seed the
        // live-state lookups of the next upgrade.
        if self.snapshotter.supports_volume_snapshots() {
            for (_part, vol) in self.snapshotted_volumes() {
                let cfg = config_name(&vol.path);
                self.snapshotter.create_snapshot(
                    &transaction.path,
                    &cfg,
                    None,
                    false,
                    "post-transaction",
                    &userdata(&[(POST_TRANSACTION, "true")]),
                )?;
            }
        }
        self.deployment.write(&transaction.path)?;
        self.snapshotter.set_default(
            &self.top_dir,
            transaction.id,
            &userdata(&[(UPDATE_IN_PROGRESS, "")]),
        )?;
        transaction.status = TransactionStatus::Committed;

        // The on-disk default has changed; nothing below may undo it.
        if self.token.is_cancelled() {
            tracing::warn!("cancelled after the default switched; completing commit");
        }
        if let Err(e) = self
            .snapshotter
            .cleanup(&transaction.path, self.deployment.max_snapshots())
        {
            tracing::warn!("pruning old snapshots failed: {e:#}");
        }
        // Drain warns on individual failures itself.
        let _ = self.cleanup.drain(true);
        tracing::info!("committed snapshot {}", transaction.id);
        Ok(())
    }

    /// Unwind a failed transaction: drain the cleanup stack, delete the
    /// in-progress snapshot and mark the transaction failed.  Returns the
    /// joined error with `cause` as its root.
    pub fn rollback(&mut self, transaction: &mut Transaction, cause: anyhow::Error) -> anyhow::Error {
        match transaction.status {
            TransactionStatus::Committed => {
                tracing::warn!(
                    "refusing to roll back committed transaction {}",
                    transaction.id
                );
                return cause;
            }
            TransactionStatus::Failed => return cause,
            TransactionStatus::Started => {}
        }
        tracing::warn!(
            "rolling back transaction {} ({}): {cause:#}",
            transaction.id,
            transaction.path
        );
        let mut residual = self.cleanup.drain(false);
        if let Err(e) = self.snapshotter.rollback(&transaction.path) {
            residual.push(e.context("deleting in-progress snapshot"));
        }
        transaction.status = TransactionStatus::Failed;
        join_errors(cause, residual)
    }
}

/// What a synchronized unpack skips and protects for this deployment.
/// On the first install everything is populated once; on upgrades the
/// non-system mount points and the non-snapshotted volumes are owned by
/// their existing filesystems and excluded.
fn build_sync_spec(deployment: &Deployment, first_install: bool) -> SyncSpec {
    let mut spec = SyncSpec::synchronized();
    spec.excludes.push(format!("/{SNAPSHOTS_DIR}").into());
    for part in deployment.partitions() {
        let is_system = part.role == PartRole::System;
        if !is_system && !part.mount_point.as_str().is_empty() {
            spec.protected.push(part.mount_point.clone());
            if !first_install {
                spec.excludes.push(part.mount_point.clone());
            }
        }
        for vol in &part.rw_volumes {
            spec.protected.push(vol.path.clone());
            if !vol.snapshotted && !first_install {
                spec.excludes.push(vol.path.clone());
            }
        }
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{SanitizeOpts, SnapshotterKind};

    fn test_deployment() -> Deployment {
        let mut d = Deployment::with_defaults();
        d.sanitize(&SanitizeOpts::default()).unwrap();
        d
    }

    fn test_helper(top: &Utf8Path) -> UpgradeHelper {
        UpgradeHelper {
            deployment: test_deployment(),
            snapshotter: Snapshotter::new(SnapshotterKind::Overwrite),
            token: CancellationToken::new(),
            top_dir: top.to_owned(),
            default_id: None,
            active_id: None,
            cleanup: CleanupStack::new(),
            _workdir: None,
        }
    }

    fn test_transaction(id: u64, top: &Utf8Path) -> Transaction {
        Transaction {
            id,
            path: top.join(snapshot_rel_path(id)),
            merges: BTreeMap::new(),
            status: TransactionStatus::Started,
        }
    }

    #[test]
    fn test_sync_spec_first_install() {
        let spec = build_sync_spec(&test_deployment(), true);
        assert_eq!(spec.excludes, vec![Utf8PathBuf::from("/.snapshots")]);
        assert!(spec.protected.contains(&Utf8PathBuf::from("/boot/efi")));
        assert!(spec.protected.contains(&Utf8PathBuf::from("/etc")));
        assert!(spec.protected.contains(&Utf8PathBuf::from("/var")));
        assert!(spec.delete);
    }

    #[test]
    fn test_sync_spec_upgrade_excludes_foreign_state() {
        let spec = build_sync_spec(&test_deployment(), false);
        assert!(spec.excludes.contains(&Utf8PathBuf::from("/.snapshots")));
        assert!(spec.excludes.contains(&Utf8PathBuf::from("/boot/efi")));
        // Non-snapshotted volumes keep their live contents.
        assert!(spec.excludes.contains(&Utf8PathBuf::from("/var")));
        assert!(spec.excludes.contains(&Utf8PathBuf::from("/home")));
        // The snapshotted volume is refreshed from the image.
        assert!(!spec.excludes.contains(&Utf8PathBuf::from("/etc")));
    }

    #[test]
    fn test_snapshot_ids_scans_store() {
        let td = tempfile::tempdir().unwrap();
        let top = Utf8Path::from_path(td.path()).unwrap();
        for id in ["1", "4", "5"] {
            std::fs::create_dir_all(top.join("@/.snapshots").join(id)).unwrap();
        }
        std::fs::write(top.join("@/.snapshots/default"), "5").unwrap();
        let helper = test_helper(top);
        assert_eq!(helper.snapshot_ids().unwrap(), vec![1, 4, 5]);
    }

    #[test]
    fn test_operations_require_started() {
        let td = tempfile::tempdir().unwrap();
        let top = Utf8Path::from_path(td.path()).unwrap();
        let mut helper = test_helper(top);
        let mut t = test_transaction(1, top);
        t.status = TransactionStatus::Failed;
        assert!(helper.merge(&mut t).is_err());
        assert!(helper.lock(&mut t).is_err());
        assert!(helper.update_fstab(&mut t).is_err());
        assert!(helper.commit(&mut t).is_err());
    }

    #[test]
    fn test_merge_skips_volumes_without_stock() {
        let td = tempfile::tempdir().unwrap();
        let top = Utf8Path::from_path(td.path()).unwrap();
        let helper = test_helper(top);
        let mut t = test_transaction(2, top);
        t.merges.insert(
            "/etc".into(),
            Merge {
                old: top.join("old"),
                new: None,
                modified: top.join("modified"),
            },
        );
        // No usable triple, so nothing runs and nothing fails.
        helper.merge(&mut t).unwrap();
    }

    #[test]
    fn test_commit_twice_is_warning_noop() {
        let td = tempfile::tempdir().unwrap();
        let top = Utf8Path::from_path(td.path()).unwrap();
        let mut helper = test_helper(top);
        let mut t = test_transaction(1, top);
        t.status = TransactionStatus::Committed;
        helper.commit(&mut t).unwrap();
        assert_eq!(t.status(), TransactionStatus::Committed);
    }

    #[test]
    fn test_rollback_of_committed_refused() {
        let td = tempfile::tempdir().unwrap();
        let top = Utf8Path::from_path(td.path()).unwrap();
        let mut helper = test_helper(top);
        let mut t = test_transaction(7, top);
        t.status = TransactionStatus::Committed;
        let e = helper.rollback(&mut t, anyhow::anyhow!("original"));
        assert_eq!(format!("{e}"), "original");
        assert_eq!(t.status(), TransactionStatus::Committed);
    }

    #[test]
    fn test_rollback_runs_cleanups_and_reports_cause_first() {
        let td = tempfile::tempdir().unwrap();
        let top = Utf8Path::from_path(td.path()).unwrap();
        let mut helper = test_helper(top);
        std::fs::create_dir_all(top.join("@/.snapshots/3/snapshot")).unwrap();
        helper
            .cleanup
            .push_always("failing cleanup", || anyhow::bail!("cleanup boom"));
        let mut t = test_transaction(3, top);
        let e = helper.rollback(&mut t, anyhow::anyhow!("sync failed"));
        assert_eq!(t.status(), TransactionStatus::Failed);
        let rendered = format!("{e:#}");
        assert!(rendered.contains("sync failed"), "{rendered}");
        assert!(rendered.contains("cleanup boom"), "{rendered}");
        assert_eq!(format!("{}", e.root_cause()), "sync failed");
        // The overwrite backend cannot delete snapshots on rollback.
        assert!(rendered.contains("cannot roll back"), "{rendered}");
        // Rolling back again is a no-op returning the cause unchanged.
        let e = helper.rollback(&mut t, anyhow::anyhow!("again"));
        assert_eq!(format!("{e}"), "again");
    }

    #[test]
    fn test_cancelled_start_fails_before_snapshot_creation() {
        let td = tempfile::tempdir().unwrap();
        let top = Utf8Path::from_path(td.path()).unwrap();
        let mut helper = test_helper(top);
        helper.token.cancel();
        let e = helper.start().unwrap_err();
        assert!(crate::task::is_cancellation(&e), "{e:#}");
    }
}
