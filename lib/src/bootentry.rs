//! Boot entry management.
//!
//! Installs the EFI binaries, copies the kernel and initrd of an OS tree
//! into the EFI partition and maintains one loader entry per snapshot plus
//! the `active` entry the firmware boots by default.  The entries live as
//! grub environment files under `loader/entries/`; the top-level `grubenv`
//! tracks the entry list (`active` always first) and the kernel command
//! line.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::blockdev;
use crate::deployment::Deployment;
use crate::mount;
use crate::task::Task;

const LOADER_ENTRIES_DIR: &str = "loader/entries";
const GRUBENV: &str = "grubenv";
const ENTRIES_VAR: &str = "entries";
const CMDLINE_VAR: &str = "cmdline";
/// The entry the firmware boots by default; always present, always first.
const ACTIVE: &str = "active";

/// Kernel image names, in no particular order; the largest name wins when
/// a modules directory offers several.
const KERNEL_NAMES: &[&str] = &["vmlinuz", "Image", "zImage", "uImage", "image"];

fn efi_boot_name() -> Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("bootx64.efi"),
        "aarch64" => Ok("bootaa64.efi"),
        "riscv64" => Ok("bootriscv64.efi"),
        o => bail!("unsupported architecture {o} for EFI boot"),
    }
}

/// Exclusive mount of the EFI partition; unmounted on drop.
#[derive(Debug)]
struct EspMount {
    dir: Utf8PathBuf,
    _workdir: tempfile::TempDir,
}

impl Drop for EspMount {
    fn drop(&mut self) {
        if let Err(e) = mount::unmount(&self.dir) {
            tracing::warn!("unmounting EFI partition at {} failed: {e:#}", self.dir);
        }
    }
}

#[context("Mounting EFI partition")]
fn mount_esp(deployment: &Deployment) -> Result<EspMount> {
    let part = deployment
        .efi_partition()
        .map_err(|_| anyhow!("unsupported: deployment carries no EFI partition"))?;
    let device: Utf8PathBuf = blockdev::find_partition_device(part)?.path.into();
    let workdir = tempfile::Builder::new()
        .prefix("elemental-esp.")
        .tempdir()
        .context("creating ESP mountpoint")?;
    let dir = Utf8Path::from_path(workdir.path())
        .ok_or_else(|| anyhow!("non UTF-8 temporary path"))?
        .to_owned();
    mount::mount(&device, &dir, "vfat", &part.mount_opts)?;
    Ok(EspMount {
        dir,
        _workdir: workdir,
    })
}

/// Parse `grub2-editenv ... list` output.
fn parse_env(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn read_env(file: &Utf8Path) -> Result<BTreeMap<String, String>> {
    if !file.as_std_path().exists() {
        return Ok(BTreeMap::new());
    }
    let out = Task::new(format!("Reading {file}"), "grub2-editenv")
        .args([file.as_str(), "list"])
        .quiet()
        .read()?;
    Ok(parse_env(&out))
}

fn write_env(file: &Utf8Path, vars: &[(&str, &str)]) -> Result<()> {
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
    }
    let mut task = Task::new(format!("Updating {file}"), "grub2-editenv")
        .quiet()
        .args([file.as_str(), "set"]);
    for (k, v) in vars {
        task = task.arg(format!("{k}={v}"));
    }
    task.run()
}

/// The new entries list after installing a snapshot: `active` first, the
/// new snapshot next, then whatever was there before.
fn updated_entries_list(current: &str, snapshot_id: u64) -> String {
    let id = snapshot_id.to_string();
    let mut entries = vec![ACTIVE.to_string(), id.clone()];
    entries.extend(
        current
            .split_ascii_whitespace()
            .filter(|e| *e != ACTIVE && *e != id)
            .map(ToOwned::to_owned),
    );
    entries.join(" ")
}

/// Split the current entries into survivors and removals, keeping `active`
/// plus any entry whose numeric id is in the keep set.
fn pruned_entries_list(current: &str, keep: &[u64]) -> (String, Vec<String>) {
    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for entry in current.split_ascii_whitespace() {
        let keep_it = entry == ACTIVE
            || entry
                .parse::<u64>()
                .map_or(false, |id| keep.contains(&id));
        if keep_it {
            kept.push(entry.to_string());
        } else {
            removed.push(entry.to_string());
        }
    }
    if kept.first().map(String::as_str) != Some(ACTIVE) {
        kept.retain(|e| e != ACTIVE);
        kept.insert(0, ACTIVE.to_string());
    }
    (kept.join(" "), removed)
}

/// A kernel image found in the OS tree.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Kernel {
    /// Absolute path of the kernel image.
    path: Utf8PathBuf,
    /// File name, e.g. `vmlinuz-6.4.0-default`.
    name: String,
    /// Version, the basename of the modules directory.
    version: String,
}

fn is_kernel_name(name: &str) -> bool {
    KERNEL_NAMES.iter().any(|k| name.starts_with(k))
}

/// Scan `/usr/lib/modules` for kernels; the largest name wins.
#[context("Locating kernel")]
fn find_kernel(root: &Utf8Path) -> Result<Kernel> {
    let modules = root.join("usr/lib/modules");
    let mut best: Option<Kernel> = None;
    let entries = std::fs::read_dir(&modules)
        .with_context(|| format!("reading {modules}"))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(version) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            continue;
        };
        let dir = modules.join(&version);
        for file in std::fs::read_dir(&dir)? {
            let file = file?;
            let Some(name) = file.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            if !is_kernel_name(&name) || !file.file_type()?.is_file() {
                continue;
            }
            let candidate = Kernel {
                path: dir.join(&name),
                name,
                version: version.clone(),
            };
            if best.as_ref().map_or(true, |b| candidate.name > b.name) {
                best = Some(candidate);
            }
        }
    }
    best.ok_or_else(|| anyhow!("no kernel found under {modules}"))
}

fn parse_os_release_id(content: &str) -> Option<String> {
    content.lines().find_map(|l| {
        let (k, v) = l.split_once('=')?;
        (k.trim() == "ID").then(|| v.trim().trim_matches('"').to_string())
    })
}

#[context("Reading OS id")]
fn os_id(root: &Utf8Path) -> Result<String> {
    let path = root.join("etc/os-release");
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    parse_os_release_id(&content).ok_or_else(|| anyhow!("no ID in {path}"))
}

fn copy_file(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    std::fs::copy(src, dst).with_context(|| format!("copying {src} to {dst}"))?;
    Ok(())
}

/// Copy shim, grub and MokManager into the ESP's removable-media path and
/// mirror the bootloader assets.
#[context("Installing EFI binaries")]
fn install_efi_binaries(root: &Utf8Path, esp: &Utf8Path) -> Result<()> {
    let arch = std::env::consts::ARCH;
    let source = root.join("usr/share/efi").join(arch);
    let boot_dir = esp.join("EFI/BOOT");
    std::fs::create_dir_all(&boot_dir).with_context(|| format!("creating {boot_dir}"))?;
    copy_file(&source.join("shim.efi"), &boot_dir.join(efi_boot_name()?))?;
    copy_file(&source.join("grub.efi"), &boot_dir.join("grub.efi"))?;
    copy_file(&source.join("MokManager.efi"), &boot_dir.join("MokManager.efi"))?;

    let assets = root.join("usr/share/grub2").join(format!("{arch}-efi"));
    if assets.as_std_path().is_dir() {
        let target = esp.join("grub2").join(format!("{arch}-efi"));
        std::fs::create_dir_all(&target)?;
        Task::new(format!("Syncing bootloader assets into {target}"), "rsync")
            .arg("--archive")
            .arg(format!("{assets}/"))
            .arg(target.as_str())
            .run()?;
    }
    Ok(())
}

/// Copy the kernel, its integrity sibling and the initrd into the
/// per-version directory, returning the ESP-relative kernel and initrd
/// paths.
#[context("Installing kernel")]
fn install_kernel(root: &Utf8Path, esp: &Utf8Path, os: &str) -> Result<(String, String)> {
    let kernel = find_kernel(root)?;
    let target_dir = esp.join(os).join(&kernel.version);
    std::fs::create_dir_all(&target_dir).with_context(|| format!("creating {target_dir}"))?;
    copy_file(&kernel.path, &target_dir.join(&kernel.name))?;
    let hmac = kernel
        .path
        .parent()
        .unwrap()
        .join(format!(".{}.hmac", kernel.name));
    if hmac.as_std_path().exists() {
        copy_file(&hmac, &target_dir.join(hmac.file_name().unwrap()))?;
    }
    let initrd = kernel.path.parent().unwrap().join("initrd");
    if !initrd.as_std_path().exists() {
        bail!("no initrd next to {}", kernel.path);
    }
    copy_file(&initrd, &target_dir.join("initrd"))?;
    Ok((
        format!("/{os}/{}/{}", kernel.version, kernel.name),
        format!("/{os}/{}/initrd", kernel.version),
    ))
}

fn write_entry(
    esp: &Utf8Path,
    key: &str,
    display_name: &str,
    linux: &str,
    initrd: &str,
    cmdline: &str,
) -> Result<()> {
    let file = esp.join(LOADER_ENTRIES_DIR).join(key);
    write_env(
        &file,
        &[
            ("display_name", display_name),
            ("linux", linux),
            ("initrd", initrd),
            (CMDLINE_VAR, cmdline),
        ],
    )
}

/// Wire a committed snapshot into the bootloader: EFI binaries, kernel
/// payload, the `active` and per-snapshot loader entries and the entries
/// list.
#[context("Installing boot entry for snapshot {snapshot_id}")]
pub fn install(
    root: &Utf8Path,
    snapshot_id: u64,
    kernel_cmdline: &str,
    deployment: &Deployment,
) -> Result<()> {
    let esp = mount_esp(deployment)?;
    install_efi_binaries(root, &esp.dir)?;
    let os = os_id(root)?;
    let (linux, initrd) = install_kernel(root, &esp.dir, &os)?;
    let display_name = format!("{os} (snapshot {snapshot_id})");
    let id = snapshot_id.to_string();
    for key in [ACTIVE, id.as_str()] {
        write_entry(&esp.dir, key, &display_name, &linux, &initrd, kernel_cmdline)?;
    }
    let grubenv = esp.dir.join(GRUBENV);
    let current = read_env(&grubenv)?;
    let entries = updated_entries_list(
        current.get(ENTRIES_VAR).map(String::as_str).unwrap_or(""),
        snapshot_id,
    );
    write_env(
        &grubenv,
        &[(ENTRIES_VAR, &entries), (CMDLINE_VAR, kernel_cmdline)],
    )?;
    tracing::info!("boot entries now: {entries}");
    Ok(())
}

/// Live-media variant: a single `active` entry below `target` plus a
/// randomized boot id, no EFI partition handling.
#[context("Installing live boot entry")]
pub fn install_live(root: &Utf8Path, target: &Utf8Path, kernel_cmdline: &str) -> Result<()> {
    let os = os_id(root)?;
    let (linux, initrd) = install_kernel(root, target, &os)?;
    write_entry(target, ACTIVE, &format!("{os} (live)"), &linux, &initrd, kernel_cmdline)?;
    let boot_id = uuid::Uuid::new_v4().simple().to_string();
    let id_file = target.join("loader/live-id");
    std::fs::write(&id_file, &boot_id).with_context(|| format!("writing {id_file}"))?;
    write_env(
        &target.join(GRUBENV),
        &[(ENTRIES_VAR, ACTIVE), (CMDLINE_VAR, kernel_cmdline)],
    )?;
    Ok(())
}

/// Drop boot entries for pruned snapshots and the kernel payload no
/// surviving entry references.
#[context("Pruning boot entries")]
pub fn prune(root: &Utf8Path, keep_snapshot_ids: &[u64], deployment: &Deployment) -> Result<()> {
    let esp = mount_esp(deployment)?;
    let grubenv = esp.dir.join(GRUBENV);
    let env = read_env(&grubenv)?;
    let current = env.get(ENTRIES_VAR).map(String::as_str).unwrap_or(ACTIVE);
    let (entries, removed) = pruned_entries_list(current, keep_snapshot_ids);

    // Which kernel payloads the surviving entries still use; collect the
    // OS directories from every entry before any file goes away.  The OS
    // tree only matters as a fallback when no entry is readable.
    let mut os_dirs = BTreeSet::new();
    let mut referenced = BTreeSet::new();
    for entry in current.split_ascii_whitespace() {
        let file = esp.dir.join(LOADER_ENTRIES_DIR).join(entry);
        let Some(linux) = read_env(&file)?.remove("linux") else {
            continue;
        };
        let mut parts = linux.trim_start_matches('/').split('/');
        let (Some(os), Some(version)) = (parts.next(), parts.next()) else {
            continue;
        };
        os_dirs.insert(os.to_string());
        if entries.split_ascii_whitespace().any(|e| e == entry) {
            referenced.insert((os.to_string(), version.to_string()));
        }
    }

    if os_dirs.is_empty() {
        if let Ok(os) = os_id(root) {
            os_dirs.insert(os);
        }
    }

    for entry in &removed {
        let file = esp.dir.join(LOADER_ENTRIES_DIR).join(entry);
        match std::fs::remove_file(&file) {
            Ok(()) => tracing::debug!("removed boot entry {entry}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {file}")),
        }
    }
    write_env(&grubenv, &[(ENTRIES_VAR, &entries)])?;

    for os in os_dirs {
        let dir = esp.dir.join(&os);
        let reader = match std::fs::read_dir(&dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("reading {dir}")),
        };
        for version in reader {
            let version = version?;
            let Some(name) = version.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            if referenced.contains(&(os.clone(), name.clone())) {
                continue;
            }
            let victim = dir.join(&name);
            tracing::debug!("removing unreferenced kernel payload {victim}");
            std::fs::remove_dir_all(&victim).with_context(|| format!("removing {victim}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updated_entries_list() {
        assert_eq!(updated_entries_list("", 1), "active 1");
        assert_eq!(updated_entries_list("active 4 3", 5), "active 5 4 3");
        // Reinstalling the same snapshot does not duplicate it.
        assert_eq!(updated_entries_list("active 5 4", 5), "active 5 4");
    }

    #[test]
    fn test_pruned_entries_list() {
        let (kept, removed) = pruned_entries_list("active 5 4 3", &[5]);
        assert_eq!(kept, "active 5");
        assert_eq!(removed, vec!["4", "3"]);

        let (kept, removed) = pruned_entries_list("active 5", &[5]);
        assert_eq!(kept, "active 5");
        assert!(removed.is_empty());

        // `active` survives even when absent from the keep set.
        let (kept, _) = pruned_entries_list("5 active", &[]);
        assert_eq!(kept, "active");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_efi_boot_name() {
        assert_eq!(efi_boot_name().unwrap(), "bootx64.efi");
    }

    #[test]
    fn test_parse_env() {
        let env = parse_env("entries=active 5 4\ncmdline=console=ttyS0 quiet\n");
        assert_eq!(env.get("entries").unwrap(), "active 5 4");
        assert_eq!(env.get("cmdline").unwrap(), "console=ttyS0 quiet");
    }

    #[test]
    fn test_parse_os_release_id() {
        let content = "NAME=\"openSUSE Tumbleweed\"\nID=\"opensuse-tumbleweed\"\n";
        assert_eq!(
            parse_os_release_id(content).as_deref(),
            Some("opensuse-tumbleweed")
        );
        assert_eq!(parse_os_release_id("NAME=x\n"), None);
    }

    #[test]
    fn test_find_kernel_prefers_largest_name() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let old = root.join("usr/lib/modules/6.4.0-150600.21-default");
        let new = root.join("usr/lib/modules/6.4.0-150600.23-default");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::create_dir_all(&new).unwrap();
        std::fs::write(old.join("vmlinuz-6.4.0-150600.21-default"), b"o").unwrap();
        std::fs::write(new.join("vmlinuz-6.4.0-150600.23-default"), b"n").unwrap();
        std::fs::write(new.join("modules.dep"), b"").unwrap();
        let k = find_kernel(root).unwrap();
        assert_eq!(k.version, "6.4.0-150600.23-default");
        assert_eq!(k.name, "vmlinuz-6.4.0-150600.23-default");
    }

    #[test]
    fn test_find_kernel_missing_is_fatal() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir_all(root.join("usr/lib/modules/6.4.0")).unwrap();
        assert!(find_kernel(root).is_err());
    }
}
