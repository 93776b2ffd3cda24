//! Snapshot backends.
//!
//! Snapshots are named by small integer IDs and live on disk under the
//! conventional `@/.snapshots/<id>/snapshot` layout relative to the top
//! subvolume of the system partition.  The default backend wraps snapper
//! and btrfs; the `overwrite` backend is a snapshot-free pass-through kept
//! for debugging scratch installs.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use elemental_utils::CommandRunExt;
use fn_error_context::context;
use serde::Deserialize;

use crate::deployment::SnapshotterKind;
use crate::task::Task;

/// Name of the top subvolume on the system partition.
pub(crate) const TOP_SUBVOL: &str = "@";
/// Name of the snapshot metadata subvolume.
pub(crate) const SNAPSHOTS_DIR: &str = ".snapshots";

/// Key/value metadata attached to snapshots.
pub(crate) type Userdata = BTreeMap<String, String>;

pub(crate) fn userdata(pairs: &[(&str, &str)]) -> Userdata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `@/.snapshots/<id>/snapshot`, relative to the top-level mount.
pub(crate) fn snapshot_rel_path(id: u64) -> Utf8PathBuf {
    format!("{TOP_SUBVOL}/{SNAPSHOTS_DIR}/{id}/snapshot").into()
}

/// Snapper configuration name for a volume path: `/` maps to `root`,
/// anything else swaps slashes for underscores.
pub(crate) fn config_name(path: &Utf8Path) -> String {
    let trimmed = path.as_str().trim_matches('/');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.replace('/', "_")
    }
}

/// One snapshot as reported by the backend.
#[derive(Debug, Clone, Default)]
pub(crate) struct SnapshotInfo {
    pub(crate) id: u64,
    pub(crate) default: bool,
    pub(crate) active: bool,
    pub(crate) userdata: Userdata,
}

/// A snapshot backend.  Variants share one interface; construction picks
/// the variant from the deployment.
#[derive(Debug)]
pub enum Snapshotter {
    Snapper(Snapper),
    Overwrite(Overwrite),
}

impl Snapshotter {
    pub fn new(kind: SnapshotterKind) -> Self {
        match kind {
            SnapshotterKind::Snapper => Self::Snapper(Snapper),
            SnapshotterKind::Overwrite => Self::Overwrite(Overwrite),
        }
    }

    /// One-time setup of the `@` hierarchy on a freshly formatted
    /// partition.  Idempotent.
    pub(crate) fn init_root_volumes(&self, top: &Utf8Path) -> Result<()> {
        match self {
            Self::Snapper(s) => s.init_root_volumes(top),
            Self::Overwrite(o) => o.init_root_volumes(top),
        }
    }

    /// Create snapshot 1 on a pristine filesystem.
    pub(crate) fn first_root_snapshot(&self, top: &Utf8Path, userdata: &Userdata) -> Result<u64> {
        match self {
            Self::Snapper(s) => s.first_root_snapshot(top, userdata),
            Self::Overwrite(o) => o.first_root_snapshot(top, userdata),
        }
    }

    /// List snapshots of a configuration.  Snapshot 0 is reserved by the
    /// backend and never surfaced.
    pub(crate) fn list_snapshots(&self, root: &Utf8Path, config: &str) -> Result<Vec<SnapshotInfo>> {
        match self {
            Self::Snapper(s) => s.list_snapshots(root, config),
            Self::Overwrite(o) => o.list_snapshots(root, config),
        }
    }

    pub(crate) fn create_snapshot(
        &self,
        root: &Utf8Path,
        config: &str,
        base: Option<u64>,
        writable: bool,
        description: &str,
        userdata: &Userdata,
    ) -> Result<u64> {
        match self {
            Self::Snapper(s) => s.create_snapshot(root, config, base, writable, description, userdata),
            Self::Overwrite(o) => o.create_snapshot(root, config, base, writable, description, userdata),
        }
    }

    /// Register a snapshot configuration for a volume inside `root`.
    pub(crate) fn create_config(&self, root: &Utf8Path, volume: &Utf8Path) -> Result<()> {
        match self {
            Self::Snapper(s) => s.create_config(root, volume),
            Self::Overwrite(_) => Ok(()),
        }
    }

    /// Configure cleanup limits inside a snapshot root.
    pub(crate) fn configure_root(&self, snapshot_root: &Utf8Path, max: u32) -> Result<()> {
        match self {
            Self::Snapper(s) => s.configure_root(snapshot_root, max),
            Self::Overwrite(_) => Ok(()),
        }
    }

    pub(crate) fn set_permissions(&self, top: &Utf8Path, id: u64, writable: bool) -> Result<()> {
        match self {
            Self::Snapper(s) => s.set_permissions(top, id, writable),
            Self::Overwrite(o) => o.set_permissions(top, id, writable),
        }
    }

    pub(crate) fn set_default(&self, top: &Utf8Path, id: u64, userdata: &Userdata) -> Result<()> {
        match self {
            Self::Snapper(s) => s.set_default(top, id, userdata),
            Self::Overwrite(o) => o.set_default(top, id, userdata),
        }
    }

    pub(crate) fn get_default(&self, top: &Utf8Path) -> Result<Option<u64>> {
        match self {
            Self::Snapper(s) => s.get_default(top),
            Self::Overwrite(o) => o.get_default(top),
        }
    }

    /// Prune old snapshots down to the configured cap.  Best effort.
    pub(crate) fn cleanup(&self, root: &Utf8Path, max: u32) -> Result<()> {
        match self {
            Self::Snapper(s) => s.cleanup(root, max),
            Self::Overwrite(o) => o.cleanup(root, max),
        }
    }

    pub(crate) fn delete_by_path(&self, path: &Utf8Path) -> Result<()> {
        match self {
            Self::Snapper(s) => s.delete_by_path(path),
            Self::Overwrite(o) => o.delete_by_path(path),
        }
    }

    /// Whether per-volume history (stock / pre-transaction / merge
    /// snapshots) is available.
    pub(crate) fn supports_volume_snapshots(&self) -> bool {
        matches!(self, Self::Snapper(_))
    }

    /// Create a fresh writable volume at `path`.
    pub(crate) fn create_volume(&self, path: &Utf8Path, no_cow: bool) -> Result<()> {
        match self {
            Self::Snapper(_) => {
                Task::new(format!("Creating subvolume {path}"), "btrfs")
                    .args(["subvolume", "create", path.as_str()])
                    .run()?;
                if no_cow {
                    Task::new(format!("Disabling copy-on-write for {path}"), "chattr")
                        .args(["+C", path.as_str()])
                        .run()?;
                }
                Ok(())
            }
            Self::Overwrite(_) => {
                std::fs::create_dir_all(path).with_context(|| format!("creating {path}"))
            }
        }
    }

    /// Create a writable copy-on-write clone of `src` at `dst`.
    pub(crate) fn snapshot_volume(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        match self {
            Self::Snapper(_) => Task::new(format!("Snapshotting {src} into {dst}"), "btrfs")
                .args(["subvolume", "snapshot", src.as_str(), dst.as_str()])
                .run(),
            Self::Overwrite(_) => {
                std::fs::create_dir_all(dst)?;
                Task::new(format!("Copying {src} into {dst}"), "rsync")
                    .arg("--archive")
                    .arg(format!("{src}/"))
                    .arg(dst.as_str())
                    .run()
            }
        }
    }

    /// Remove an in-progress snapshot while unwinding a transaction.
    pub(crate) fn rollback(&self, path: &Utf8Path) -> Result<()> {
        match self {
            Self::Snapper(s) => s.delete_by_path(path),
            // Without snapshots there is nothing to return to.
            Self::Overwrite(_) => bail!("the overwrite snapshotter cannot roll back"),
        }
    }
}

/// snapper + btrfs backed implementation.
#[derive(Debug)]
pub struct Snapper;

#[derive(Debug, Deserialize)]
struct SnapperRow {
    number: u64,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    userdata: Option<Userdata>,
}

fn snapper_cmd(root: &Utf8Path, config: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("snapper");
    cmd.args(["--no-dbus", "--root", root.as_str(), "-c", config]);
    cmd
}

fn render_userdata(userdata: &Userdata) -> String {
    userdata
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `btrfs subvolume get-default` output into a snapshot ID.
fn parse_get_default(out: &str) -> Option<u64> {
    let re = regex::Regex::new(r"path @/\.snapshots/(\d+)/snapshot\s*$").unwrap();
    re.captures(out.trim())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Rebase one relative path of `btrfs subvolume list -o` output (relative
/// to the top-level subvolume) onto the absolute mount of that top level.
fn rebase_nested(target: &Utf8Path, rel: &str) -> Option<Utf8PathBuf> {
    let (base, _) = target.as_str().rsplit_once("/@/")?;
    Some(Utf8PathBuf::from(base).join(rel))
}

fn parse_subvolume_list(out: &str) -> Vec<&str> {
    out.lines()
        .filter_map(|l| l.split(" path ").nth(1))
        .map(str::trim)
        .collect()
}

impl Snapper {
    fn init_root_volumes(&self, top: &Utf8Path) -> Result<()> {
        for sub in [
            top.join(TOP_SUBVOL),
            top.join(TOP_SUBVOL).join(SNAPSHOTS_DIR),
        ] {
            if sub.as_std_path().exists() {
                continue;
            }
            Task::new(format!("Creating subvolume {sub}"), "btrfs")
                .args(["subvolume", "create", sub.as_str()])
                .run()?;
        }
        Ok(())
    }

    #[context("Creating first root snapshot")]
    fn first_root_snapshot(&self, top: &Utf8Path, userdata: &Userdata) -> Result<u64> {
        let dir = top.join(TOP_SUBVOL).join(SNAPSHOTS_DIR).join("1");
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {dir}"))?;
        let snapshot = dir.join("snapshot");
        Task::new(format!("Creating subvolume {snapshot}"), "btrfs")
            .args(["subvolume", "create", snapshot.as_str()])
            .run()?;
        // Minimal snapper metadata so later listings see this snapshot.
        let date = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        let userdata_xml = userdata
            .iter()
            .map(|(k, v)| format!("  <userdata>\n    <key>{k}</key>\n    <value>{v}</value>\n  </userdata>\n"))
            .collect::<String>();
        let info = format!(
            "<?xml version=\"1.0\"?>\n<snapshot>\n  <type>single</type>\n  <num>1</num>\n  <date>{date}</date>\n  <description>first root filesystem</description>\n{userdata_xml}</snapshot>\n"
        );
        std::fs::write(dir.join("info.xml"), info).context("writing info.xml")?;
        Ok(1)
    }

    fn list_snapshots(&self, root: &Utf8Path, config: &str) -> Result<Vec<SnapshotInfo>> {
        let mut cmd = snapper_cmd(root, config);
        cmd.args(["--jsonout", "list", "--disable-used-space"]);
        let mut by_config: BTreeMap<String, Vec<SnapperRow>> = cmd
            .run_and_parse_json()
            .with_context(|| format!("listing {config} snapshots under {root}"))?;
        let rows = by_config.remove(config).unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|r| r.number != 0)
            .map(|r| SnapshotInfo {
                id: r.number,
                default: r.default,
                active: r.active,
                userdata: r.userdata.unwrap_or_default(),
            })
            .collect())
    }

    fn create_snapshot(
        &self,
        root: &Utf8Path,
        config: &str,
        base: Option<u64>,
        writable: bool,
        description: &str,
        userdata: &Userdata,
    ) -> Result<u64> {
        let mut task = Task::new(
            format!("Creating {config} snapshot in {root}"),
            "snapper",
        )
        .args(["--no-dbus", "--root", root.as_str(), "-c", config])
        .args(["create", "--print-number", "--description", description]);
        if let Some(base) = base {
            task = task.arg("--from").arg(base.to_string());
        }
        if writable {
            task = task.arg("--read-write");
        }
        if !userdata.is_empty() {
            task = task.arg("--userdata").arg(render_userdata(userdata));
        }
        let out = task.read()?;
        out.trim()
            .parse()
            .map_err(|_| anyhow!("unexpected snapper create output {out:?}"))
    }

    fn create_config(&self, root: &Utf8Path, volume: &Utf8Path) -> Result<()> {
        let name = config_name(volume);
        Task::new(format!("Creating snapshot config {name}"), "snapper")
            .args(["--no-dbus", "--root", root.as_str(), "-c", name.as_str()])
            .args(["create-config", "--fstype", "btrfs", volume.as_str()])
            .run()
    }

    fn configure_root(&self, snapshot_root: &Utf8Path, max: u32) -> Result<()> {
        let configs_dir = snapshot_root.join("etc/snapper/configs");
        if !configs_dir.join("root").as_std_path().exists() {
            self.create_config(snapshot_root, Utf8Path::new("/"))?;
        }
        let limits = [
            "NUMBER_CLEANUP=yes".to_string(),
            format!("NUMBER_LIMIT=2-{max}"),
            format!("NUMBER_LIMIT_IMPORTANT=4-{max}"),
            "TIMELINE_CREATE=no".to_string(),
        ];
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&configs_dir)
            .with_context(|| format!("reading {configs_dir}"))?
        {
            let name = entry?.file_name();
            let Some(name) = name.to_str().map(ToOwned::to_owned) else {
                continue;
            };
            Task::new(format!("Configuring snapshot limits for {name}"), "snapper")
                .args(["--no-dbus", "--root", snapshot_root.as_str(), "-c", name.as_str()])
                .arg("set-config")
                .args(&limits)
                .run()?;
            names.push(name);
        }
        // Keep the sysconfig list in sync so snapper's own tooling sees
        // every configuration.
        names.sort();
        let sysconfig = snapshot_root.join("etc/sysconfig/snapper");
        if let Some(parent) = sysconfig.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &sysconfig,
            format!("SNAPPER_CONFIGS=\"{}\"\n", names.join(" ")),
        )
        .with_context(|| format!("writing {sysconfig}"))?;
        Ok(())
    }

    fn set_permissions(&self, top: &Utf8Path, id: u64, writable: bool) -> Result<()> {
        let path = top.join(snapshot_rel_path(id));
        let ro = if writable { "false" } else { "true" };
        Task::new(format!("Marking snapshot {id} ro={ro}"), "btrfs")
            .args(["property", "set", path.as_str(), "ro", ro])
            .run()
    }

    fn set_default(&self, top: &Utf8Path, id: u64, userdata: &Userdata) -> Result<()> {
        let path = top.join(snapshot_rel_path(id));
        Task::new(format!("Setting default snapshot to {id}"), "btrfs")
            .args(["subvolume", "set-default", path.as_str()])
            .run()?;
        if !userdata.is_empty() {
            Task::new(format!("Updating userdata of snapshot {id}"), "snapper")
                .args(["--no-dbus", "--root", path.as_str(), "-c", "root"])
                .args(["modify", "--userdata"])
                .arg(render_userdata(userdata))
                .arg(id.to_string())
                .run()?;
        }
        Ok(())
    }

    fn get_default(&self, top: &Utf8Path) -> Result<Option<u64>> {
        let out = Task::new("Reading default subvolume", "btrfs")
            .args(["subvolume", "get-default", top.as_str()])
            .quiet()
            .read()?;
        Ok(parse_get_default(&out))
    }

    fn cleanup(&self, root: &Utf8Path, _max: u32) -> Result<()> {
        // Limits are part of the per-config setup; this only triggers the
        // number-based policy.
        Task::new("Pruning old snapshots", "snapper")
            .args(["--no-dbus", "--root", root.as_str()])
            .args(["cleanup", "number"])
            .run()
    }

    #[context("Deleting subvolume {path}")]
    fn delete_by_path(&self, path: &Utf8Path) -> Result<()> {
        if !path.as_std_path().exists() {
            return Ok(());
        }
        // Nested subvolumes (the read-write volumes) must go first.
        let out = Task::new(format!("Listing subvolumes below {path}"), "btrfs")
            .args(["subvolume", "list", "-o", path.as_str()])
            .quiet()
            .read()?;
        let mut nested: Vec<Utf8PathBuf> = parse_subvolume_list(&out)
            .into_iter()
            .filter_map(|rel| rebase_nested(path, rel))
            .collect();
        nested.push(path.to_owned());
        // Deepest first, the snapshot itself last.
        nested.sort_by_key(|p| std::cmp::Reverse(p.as_str().len()));
        for sub in &nested {
            Task::new(format!("Deleting subvolume {sub}"), "btrfs")
                .args(["subvolume", "delete", sub.as_str()])
                .run()?;
        }
        // The numbered parent directory holds only metadata.
        if let Some(parent) = path.parent() {
            if parent.file_name().map_or(false, |n| n.parse::<u64>().is_ok()) {
                std::fs::remove_dir_all(parent).with_context(|| format!("removing {parent}"))?;
            }
        }
        Ok(())
    }
}

/// Plain-directory pass-through backend.  No copy-on-write, no history;
/// useful to debug the transaction flow on scratch machines.
#[derive(Debug)]
pub struct Overwrite;

#[derive(Debug, Default, serde::Serialize, Deserialize)]
struct OverwriteInfo {
    #[serde(default)]
    userdata: Userdata,
}

impl Overwrite {
    fn snapshots_dir(top: &Utf8Path) -> Utf8PathBuf {
        top.join(TOP_SUBVOL).join(SNAPSHOTS_DIR)
    }

    /// Accepts either a top-level mount or a snapshot root such as
    /// `<top>/@/.snapshots/5/snapshot` and resolves the snapshot store.
    fn resolve_snapshots_dir(root: &Utf8Path) -> Utf8PathBuf {
        if root.file_name() == Some("snapshot") {
            if let Some(dir) = root.parent().and_then(Utf8Path::parent) {
                if dir.file_name() == Some(SNAPSHOTS_DIR) {
                    return dir.to_owned();
                }
            }
        }
        Self::snapshots_dir(root)
    }

    fn init_root_volumes(&self, top: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(Self::snapshots_dir(top)).map_err(Into::into)
    }

    fn write_info(dir: &Utf8Path, userdata: &Userdata) -> Result<()> {
        let info = OverwriteInfo {
            userdata: userdata.clone(),
        };
        std::fs::write(dir.join("info.json"), serde_json::to_vec_pretty(&info)?)
            .map_err(Into::into)
    }

    fn first_root_snapshot(&self, top: &Utf8Path, userdata: &Userdata) -> Result<u64> {
        let dir = Self::snapshots_dir(top).join("1");
        std::fs::create_dir_all(dir.join("snapshot"))?;
        Self::write_info(&dir, userdata)?;
        self.set_default(top, 1, &Userdata::new())?;
        Ok(1)
    }

    fn list_snapshots(&self, root: &Utf8Path, _config: &str) -> Result<Vec<SnapshotInfo>> {
        // The overwrite backend has no per-volume configurations.
        let dir = Self::resolve_snapshots_dir(root);
        let default = Self::read_default(&dir)?;
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).with_context(|| format!("reading {dir}")),
        };
        for entry in entries {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) else {
                continue;
            };
            if id == 0 {
                continue;
            }
            let info: OverwriteInfo = std::fs::read(dir.join(id.to_string()).join("info.json"))
                .ok()
                .and_then(|buf| serde_json::from_slice(&buf).ok())
                .unwrap_or_default();
            out.push(SnapshotInfo {
                id,
                default: default == Some(id),
                active: false,
                userdata: info.userdata,
            });
        }
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    fn create_snapshot(
        &self,
        root: &Utf8Path,
        _config: &str,
        base: Option<u64>,
        _writable: bool,
        _description: &str,
        userdata: &Userdata,
    ) -> Result<u64> {
        let dir = Self::resolve_snapshots_dir(root);
        let next = self
            .list_snapshots(root, "root")?
            .last()
            .map(|s| s.id + 1)
            .unwrap_or(1);
        let target = dir.join(next.to_string());
        std::fs::create_dir_all(target.join("snapshot"))?;
        if let Some(base) = base {
            let src = dir.join(base.to_string()).join("snapshot");
            Task::new(format!("Copying snapshot {base} to {next}"), "rsync")
                .arg("--archive")
                .arg(format!("{src}/"))
                .arg(target.join("snapshot").as_str())
                .run()?;
        }
        Self::write_info(&target, userdata)?;
        Ok(next)
    }

    fn set_permissions(&self, _top: &Utf8Path, id: u64, writable: bool) -> Result<()> {
        tracing::debug!("overwrite backend ignores permissions for {id} (writable={writable})");
        Ok(())
    }

    fn set_default(&self, top: &Utf8Path, id: u64, _userdata: &Userdata) -> Result<()> {
        std::fs::write(Self::snapshots_dir(top).join("default"), id.to_string())
            .map_err(Into::into)
    }

    fn get_default(&self, top: &Utf8Path) -> Result<Option<u64>> {
        Self::read_default(&Self::snapshots_dir(top))
    }

    fn read_default(dir: &Utf8Path) -> Result<Option<u64>> {
        match std::fs::read_to_string(dir.join("default")) {
            Ok(s) => Ok(s.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn cleanup(&self, root: &Utf8Path, max: u32) -> Result<()> {
        let keep = self.get_default(root)?;
        let snapshots = self.list_snapshots(root, "root")?;
        let excess = snapshots.len().saturating_sub(max as usize);
        for s in snapshots.iter().take(excess) {
            if keep == Some(s.id) {
                continue;
            }
            std::fs::remove_dir_all(Self::snapshots_dir(root).join(s.id.to_string()))?;
        }
        Ok(())
    }

    fn delete_by_path(&self, path: &Utf8Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {path}")),
        }
    }
}
