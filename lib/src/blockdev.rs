//! Block device probing via lsblk.

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use elemental_utils::CommandRunExt;
use fn_error_context::context;
use serde::Deserialize;
use std::process::Command;

use crate::deployment::Partition;

const LSBLK_COLUMNS: &str = "PATH,LABEL,PARTLABEL,UUID,FSTYPE,SIZE,MOUNTPOINTS";

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// One row of lsblk output, including child partitions.
#[allow(dead_code)]
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Device {
    pub(crate) path: String,
    pub(crate) label: Option<String>,
    pub(crate) partlabel: Option<String>,
    pub(crate) uuid: Option<String>,
    pub(crate) fstype: Option<String>,
    pub(crate) size: Option<u64>,
    #[serde(default)]
    pub(crate) mountpoints: Vec<Option<String>>,
    pub(crate) children: Option<Vec<Device>>,
}

impl Device {
    pub(crate) fn is_mounted(&self) -> bool {
        self.mountpoints.iter().any(|m| m.is_some())
    }
}

/// Cheap existence probe for a device node.
pub(crate) fn device_exists(path: &Utf8Path) -> bool {
    path.as_std_path().exists()
}

fn list_impl(dev: Option<&Utf8Path>) -> Result<Vec<Device>> {
    let mut cmd = Command::new("lsblk");
    cmd.args(["-p", "-b", "-n", "-J", "-o", LSBLK_COLUMNS]);
    if let Some(dev) = dev {
        cmd.arg(dev.as_str());
    }
    let devs: DevicesOutput = cmd.run_and_parse_json().context("listing block devices")?;
    Ok(devs.blockdevices)
}

/// All block devices on the host.
pub(crate) fn list() -> Result<Vec<Device>> {
    list_impl(None)
}

/// The partitions of a given disk.
#[context("Listing partitions of {disk}")]
pub(crate) fn partitions_of(disk: &Utf8Path) -> Result<Vec<Device>> {
    let devices = list_impl(Some(disk))?;
    let dev = devices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no lsblk output for {disk}"))?;
    Ok(dev.children.unwrap_or_default())
}

/// Locate the host device backing a deployment partition.  Matches by
/// UUID first, then by a partition name equal to the role, then by
/// filesystem label; the first match wins, preferring mounted devices
/// when several qualify.
#[context("Locating device for partition {:?}", part.label)]
pub(crate) fn find_partition_device(part: &Partition) -> Result<Device> {
    let devices = list()?;
    select_device(&devices, part)
        .cloned()
        .ok_or_else(|| anyhow!("no device found for partition {:?}", part.label))
}

/// Like [`find_partition_device`], but scoped to one disk's partitions.
#[context("Locating partition {:?} on {disk}", part.label)]
pub(crate) fn find_partition_on_disk(disk: &Utf8Path, part: &Partition) -> Result<Device> {
    let devices = partitions_of(disk)?;
    select_device(&devices, part)
        .cloned()
        .ok_or_else(|| anyhow!("no partition on {disk} matches {:?}", part.label))
}

fn flatten(devices: &[Device]) -> Vec<&Device> {
    let mut out = Vec::new();
    for d in devices {
        out.push(d);
        if let Some(children) = &d.children {
            out.extend(flatten(children));
        }
    }
    out
}

fn select_device<'d>(devices: &'d [Device], part: &Partition) -> Option<&'d Device> {
    let all = flatten(devices);
    let pick = |matches: &dyn Fn(&Device) -> bool| -> Option<&'d Device> {
        let candidates: Vec<&'d Device> = all.iter().copied().filter(|d| matches(d)).collect();
        candidates
            .iter()
            .copied()
            .find(|d| d.is_mounted())
            .or_else(|| candidates.first().copied())
    };
    if let Some(uuid) = part.uuid.as_deref() {
        if let Some(d) = pick(&|d: &Device| d.uuid.as_deref() == Some(uuid)) {
            return Some(d);
        }
    }
    let role = part.role.to_string();
    if let Some(d) = pick(&|d: &Device| d.partlabel.as_deref() == Some(role.as_str())) {
        return Some(d);
    }
    if part.label.is_empty() {
        return None;
    }
    pick(&|d: &Device| d.label.as_deref() == Some(part.label.as_str()))
}

pub(crate) fn udev_settle() -> Result<()> {
    // There's a window after partition table changes where udevd hasn't yet
    // received updates from the kernel, settle returns immediately, and
    // lsblk won't pick up labels.  Sleep our way out of it.
    std::thread::sleep(std::time::Duration::from_millis(200));
    Command::new("udevadm").arg("settle").run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::PartRole;

    fn fixture() -> Vec<Device> {
        let raw = indoc::indoc! {r#"
        {
           "blockdevices": [
              {"path": "/dev/vda", "label": null, "partlabel": null, "uuid": null,
               "fstype": null, "size": 21474836480, "mountpoints": [null],
               "children": [
                  {"path": "/dev/vda1", "label": "EFI", "partlabel": "efi",
                   "uuid": "AAAA-BBBB", "fstype": "vfat", "size": 1073741824,
                   "mountpoints": [null]},
                  {"path": "/dev/vda2", "label": "SYSTEM", "partlabel": "system",
                   "uuid": "11111111-2222-3333-4444-555555555555", "fstype": "btrfs",
                   "size": 20400000000, "mountpoints": ["/"]}
               ]},
              {"path": "/dev/vdb", "label": "SYSTEM", "partlabel": null,
               "uuid": "99999999-aaaa-bbbb-cccc-dddddddddddd", "fstype": "btrfs",
               "size": 10737418240, "mountpoints": [null]}
           ]
        }
        "#};
        let parsed: DevicesOutput = serde_json::from_str(raw).unwrap();
        parsed.blockdevices
    }

    #[test]
    fn test_select_by_uuid() {
        let devices = fixture();
        let part = Partition {
            uuid: Some("AAAA-BBBB".into()),
            ..Default::default()
        };
        let d = select_device(&devices, &part).unwrap();
        assert_eq!(d.path, "/dev/vda1");
    }

    #[test]
    fn test_select_by_role_name() {
        let devices = fixture();
        let part = Partition {
            role: PartRole::System,
            ..Default::default()
        };
        let d = select_device(&devices, &part).unwrap();
        assert_eq!(d.path, "/dev/vda2");
    }

    #[test]
    fn test_select_by_label_prefers_mounted() {
        let devices = fixture();
        // Label SYSTEM matches both /dev/vda2 and /dev/vdb; /dev/vda2 is
        // mounted and wins.  Role Data never matches a partlabel here.
        let part = Partition {
            label: "SYSTEM".into(),
            ..Default::default()
        };
        let d = select_device(&devices, &part).unwrap();
        assert_eq!(d.path, "/dev/vda2");
    }

    #[test]
    fn test_no_match() {
        let devices = fixture();
        let part = Partition {
            label: "NOPE".into(),
            ..Default::default()
        };
        assert!(select_device(&devices, &part).is_none());
    }

    #[test]
    fn test_uuid_miss_falls_back() {
        let devices = fixture();
        let part = Partition {
            uuid: Some("not-there".into()),
            label: "EFI".into(),
            ..Default::default()
        };
        let d = select_device(&devices, &part).unwrap();
        assert_eq!(d.path, "/dev/vda1");
    }
}
