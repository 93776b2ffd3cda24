//! Generation and rewriting of the snapshot's `/etc/fstab`.

use std::fmt::Display;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::deployment::{Deployment, FsKind, PartRole, Partition};

/// One six-field fstab line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FstabEntry {
    pub(crate) source: String,
    pub(crate) target: String,
    pub(crate) fstype: String,
    pub(crate) options: Vec<String>,
    pub(crate) dump: u8,
    pub(crate) fsck: u8,
}

impl Display for FstabEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let options = if self.options.is_empty() {
            "defaults".to_string()
        } else {
            self.options.join(",")
        };
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.source, self.target, self.fstype, options, self.dump, self.fsck
        )
    }
}

fn partition_source(part: &Partition) -> String {
    match part.uuid.as_deref() {
        Some(uuid) => format!("UUID={uuid}"),
        None => format!("LABEL={}", part.label),
    }
}

/// Plan the full fstab for a fresh snapshot.  Pure so it can be tested
/// without a formatted disk; the partition UUIDs must already be resolved
/// on the deployment.
pub(crate) fn plan_entries(deployment: &Deployment, transaction_id: u64) -> Vec<FstabEntry> {
    let mut entries = Vec::new();
    let mut system_source = None;
    // The root filesystem leads, fsck order 1; everything else follows in
    // deployment order with fsck order 2.
    for part in deployment.partitions() {
        if part.role != PartRole::System || part.hidden {
            continue;
        }
        let mut options = vec!["ro".to_string()];
        options.extend(part.mount_opts.iter().cloned());
        system_source = Some(partition_source(part));
        entries.push(FstabEntry {
            source: partition_source(part),
            target: "/".into(),
            fstype: "btrfs".into(),
            options,
            dump: 0,
            fsck: 1,
        });
    }
    for part in deployment.partitions() {
        if part.role == PartRole::System || part.hidden || part.mount_point.as_str().is_empty() {
            continue;
        }
        let fstype = part
            .filesystem
            .map(|f| f.to_string())
            .unwrap_or_else(|| "auto".to_string());
        entries.push(FstabEntry {
            source: partition_source(part),
            target: part.mount_point.to_string(),
            fstype,
            options: part.mount_opts.clone(),
            dump: 0,
            fsck: 2,
        });
    }
    for part in deployment.partitions() {
        if part.filesystem != Some(FsKind::Btrfs) {
            continue;
        }
        let source = partition_source(part);
        for vol in &part.rw_volumes {
            let rel = vol.path.as_str().trim_start_matches('/');
            let subvol = if vol.snapshotted {
                format!("subvol=@/.snapshots/{transaction_id}/snapshot/{rel}")
            } else {
                format!("subvol=@/{rel}")
            };
            let mut options = vol.mount_opts.clone();
            options.push(subvol);
            entries.push(FstabEntry {
                source: source.clone(),
                target: vol.path.to_string(),
                fstype: "btrfs".into(),
                options,
                dump: 0,
                fsck: 0,
            });
        }
    }
    if let Some(source) = system_source {
        entries.push(FstabEntry {
            source,
            target: "/.snapshots".into(),
            fstype: "btrfs".into(),
            options: vec!["subvol=@/.snapshots".into()],
            dump: 0,
            fsck: 0,
        });
    }
    entries
}

pub(crate) fn render(entries: &[FstabEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&e.to_string());
        out.push('\n');
    }
    out
}

/// Rewrite snapshot subvolume references in an existing fstab so they
/// point at the new transaction's snapshot.
pub(crate) fn update_content(content: &str, transaction_id: u64) -> String {
    let re = regex::Regex::new(r"@/\.snapshots/\d+/snapshot").unwrap();
    re.replace_all(content, format!("@/.snapshots/{transaction_id}/snapshot"))
        .into_owned()
}

/// Write or rewrite `<root>/etc/fstab` for the transaction's snapshot.
#[context("Updating fstab")]
pub(crate) fn write_fstab(
    deployment: &Deployment,
    transaction_id: u64,
    snapshot_root: &Utf8Path,
) -> Result<()> {
    let path = snapshot_root.join("etc/fstab");
    let content = match std::fs::read_to_string(&path) {
        // Upgrade: carry the existing table forward under the new id.
        Ok(existing) => update_content(&existing, transaction_id),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            render(&plan_entries(deployment, transaction_id))
        }
        Err(e) => return Err(e).with_context(|| format!("reading {path}")),
    };
    let parent = path.parent().unwrap();
    std::fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
    std::fs::write(&path, content).with_context(|| format!("writing {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::SanitizeOpts;

    fn deployment_with_uuids() -> Deployment {
        let mut d = Deployment::with_defaults();
        d.sanitize(&SanitizeOpts::default()).unwrap();
        for (part, uuid) in d.disks[0]
            .partitions
            .iter_mut()
            .zip(["AAAA-BBBB", "1111-2222"])
        {
            part.uuid = Some(uuid.into());
        }
        d
    }

    #[test]
    fn test_plan_default_layout() {
        let d = deployment_with_uuids();
        let rendered = render(&plan_entries(&d, 1));
        similar_asserts::assert_eq!(
            rendered,
            indoc::indoc! {"
                UUID=1111-2222\t/\tbtrfs\tro\t0\t1
                UUID=AAAA-BBBB\t/boot/efi\tvfat\tdefaults\t0\t2
                UUID=1111-2222\t/etc\tbtrfs\tsubvol=@/.snapshots/1/snapshot/etc\t0\t0
                UUID=1111-2222\t/var\tbtrfs\tsubvol=@/var\t0\t0
                UUID=1111-2222\t/home\tbtrfs\tsubvol=@/home\t0\t0
                UUID=1111-2222\t/.snapshots\tbtrfs\tsubvol=@/.snapshots\t0\t0
            "}
        );
    }

    #[test]
    fn test_hidden_partitions_skipped() {
        let mut d = deployment_with_uuids();
        d.disks[0].partitions[0].hidden = true;
        let rendered = render(&plan_entries(&d, 1));
        assert!(!rendered.contains("/boot/efi"), "{rendered}");
    }

    #[test]
    fn test_data_partition_and_volume_options() {
        use crate::deployment::{FsKind, Partition};
        let mut d = deployment_with_uuids();
        d.disks[0].partitions[1].rw_volumes[0].mount_opts = vec!["noatime".into()];
        d.disks[0].partitions.push(Partition {
            role: PartRole::Data,
            filesystem: Some(FsKind::Xfs),
            label: "DATA".into(),
            size_mib: 512,
            mount_point: "/data".into(),
            mount_opts: vec!["nofail".into()],
            uuid: Some("DDDD-0000".into()),
            ..Default::default()
        });
        let rendered = render(&plan_entries(&d, 3));
        assert!(
            rendered.contains("UUID=DDDD-0000\t/data\txfs\tnofail\t0\t2"),
            "{rendered}"
        );
        assert!(
            rendered.contains("/etc\tbtrfs\tnoatime,subvol=@/.snapshots/3/snapshot/etc"),
            "{rendered}"
        );
        // A non-btrfs partition contributes no subvol lines.
        assert!(!rendered.contains("/data\tbtrfs"), "{rendered}");
    }

    #[test]
    fn test_update_content_rewrites_ids() {
        let old = "UUID=x\t/etc\tbtrfs\tsubvol=@/.snapshots/4/snapshot/etc\t0\t0\n\
                   UUID=x\t/var\tbtrfs\tsubvol=@/var\t0\t0\n";
        let new = update_content(old, 5);
        assert!(new.contains("subvol=@/.snapshots/5/snapshot/etc"), "{new}");
        assert!(new.contains("subvol=@/var"), "{new}");
        assert!(!new.contains("/4/"), "{new}");
    }

    #[test]
    fn test_write_creates_then_updates() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let d = deployment_with_uuids();
        write_fstab(&d, 1, root).unwrap();
        let first = std::fs::read_to_string(root.join("etc/fstab")).unwrap();
        assert!(first.contains("subvol=@/.snapshots/1/snapshot/etc"));
        write_fstab(&d, 2, root).unwrap();
        let second = std::fs::read_to_string(root.join("etc/fstab")).unwrap();
        assert!(second.contains("subvol=@/.snapshots/2/snapshot/etc"));
        assert!(!second.contains("/1/"));
    }
}
