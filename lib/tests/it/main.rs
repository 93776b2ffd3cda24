//! Integration tests driving the public API the way the binary does.

use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use elemental_lib::deployment::{
    parse_extensions, Deployment, FsKind, PartRole, SanitizeOpts, EFI_DEFAULT_SIZE_MIB,
};
use elemental_lib::imagesource::{ImageKind, ImageSource};

fn tempdir_root(td: &tempfile::TempDir) -> &Utf8Path {
    Utf8Path::from_path(td.path()).expect("utf-8 tempdir")
}

#[test]
fn deployment_lifecycle_round_trip() {
    let td = tempfile::tempdir().unwrap();
    let root = tempdir_root(&td);

    let mut d = Deployment::with_defaults();
    d.disks[0].device = "/dev/vda".into();
    d.source = ImageSource::from_str("oci://registry.example.com/os:1.2").unwrap();
    d.sanitize(&SanitizeOpts {
        skip_device_check: true,
    })
    .unwrap();

    // Partition UUIDs arrive after partitioning and must survive the
    // round trip; the disk device must not.
    for (part, uuid) in d.disks[0].partitions.iter_mut().zip(["AAAA-1111", "BBBB-2222"]) {
        part.uuid = Some(uuid.into());
    }
    d.write(root).unwrap();
    // Writing again must atomically replace the read-only file.
    d.write(root).unwrap();

    let parsed = Deployment::parse(root).unwrap();
    assert_eq!(parsed.source, d.source);
    assert_eq!(parsed.disks[0].device, Utf8PathBuf::new());
    assert_eq!(
        parsed.disks[0].partitions[0].uuid.as_deref(),
        Some("AAAA-1111")
    );
    let system = parsed.system_partition().unwrap();
    assert_eq!(system.filesystem, Some(FsKind::Btrfs));
    assert_eq!(system.mount_point, "/");
    let efi = parsed.efi_partition().unwrap();
    assert_eq!(efi.size_mib, EFI_DEFAULT_SIZE_MIB);
}

#[test]
fn config_overrides_merge_like_the_install_verb() {
    let mut deployment = Deployment::with_defaults();
    let overrides: Deployment = serde_yaml::from_str(indoc::indoc! {"
        disks:
          - partitions:
              - sizeMiB: 2048
              - label: ROOT
        bootConfig:
          kernelCmdline: console=ttyS0 quiet
        snapshotter: overwrite
        maxSnapshots: 4
    "})
    .unwrap();
    deployment.merge(overrides);
    deployment.sanitize(&SanitizeOpts::default()).unwrap();

    let efi = deployment.efi_partition().unwrap();
    assert_eq!(efi.size_mib, 2048);
    assert_eq!(efi.label, "EFI");
    let system = deployment.system_partition().unwrap();
    assert_eq!(system.label, "ROOT");
    assert_eq!(deployment.boot_config.kernel_cmdline, "console=ttyS0 quiet");
    assert_eq!(deployment.max_snapshots, Some(4));
    // The read-write volumes of the defaults survive an override that
    // does not mention them.
    assert_eq!(system.rw_volumes.len(), 3);
}

#[test]
fn sanitize_is_idempotent_over_the_full_default_layout() {
    let mut once = Deployment::with_defaults();
    once.sanitize(&SanitizeOpts::default()).unwrap();
    let mut twice = once.clone();
    twice.sanitize(&SanitizeOpts::default()).unwrap();
    similar_asserts::assert_eq!(
        serde_yaml::to_string(&once).unwrap(),
        serde_yaml::to_string(&twice).unwrap()
    );
}

#[test]
fn image_source_uri_laws() {
    for (uri, kind) in [
        ("oci://registry.example.com/os:1.2", ImageKind::Oci),
        ("dir:///srv/os-tree", ImageKind::Dir),
        ("raw:///images/os.img", ImageKind::Raw),
        ("tar:///images/os.tar", ImageKind::Tar),
    ] {
        let src = ImageSource::from_str(uri).unwrap();
        assert_eq!(src.kind, kind, "{uri}");
        assert_eq!(src.to_string(), uri, "{uri}");
    }
    // Digest round-trips through the deployment document.
    let mut src = ImageSource::from_str("dir:///srv/os-tree").unwrap();
    src.digest = Some("sha256:feed".into());
    let y = serde_yaml::to_string(&src).unwrap();
    let back: ImageSource = serde_yaml::from_str(&y).unwrap();
    assert_eq!(back, src);
}

#[test]
fn extensions_surface() {
    let td = tempfile::tempdir().unwrap();
    let root = tempdir_root(&td);
    assert!(parse_extensions(root).unwrap().is_empty());

    let dir = root.join("etc/elemental");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("extensions.yaml"),
        indoc::indoc! {"
            - name: realtime
              image:
                uri: oci://registry.example.com/rt:6.4
              modules: [rt_prio]
            - name: firmware
              image:
                uri: dir:///srv/firmware
        "},
    )
    .unwrap();
    let exts = parse_extensions(root).unwrap();
    assert_eq!(exts.len(), 2);
    assert_eq!(exts[0].name, "realtime");
    assert_eq!(exts[0].modules, vec!["rt_prio"]);
    assert_eq!(exts[1].image.kind, ImageKind::Dir);
    assert!(exts[1].modules.is_empty());
}

#[test]
fn invalid_layouts_are_rejected_with_precise_errors() {
    // A second system partition.
    let mut d = Deployment::with_defaults();
    let mut extra = d.disks[0].partitions[1].clone();
    extra.rw_volumes.clear();
    d.disks[0].partitions.push(extra);
    let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
    assert!(format!("{e:#}").contains("exactly one system partition"));

    // A nested volume pair.
    let mut d = Deployment::with_defaults();
    d.disks[0].partitions[1]
        .rw_volumes
        .push(elemental_lib::deployment::RwVolume::new("/var/cache"));
    let e = d.sanitize(&SanitizeOpts::default()).unwrap_err();
    assert!(format!("{e:#}").contains("nest"));

    // An undersized EFI partition.
    let mut d = Deployment::with_defaults();
    d.disks[0].partitions[0].size_mib = 100;
    assert!(d.sanitize(&SanitizeOpts::default()).is_err());
}

#[test]
fn partition_roles_serialize_into_the_closed_set() {
    let mut d = Deployment::with_defaults();
    d.disks[0].partitions.push(
        elemental_lib::deployment::Partition {
            role: PartRole::Recovery,
            size_mib: 512,
            ..Default::default()
        },
    );
    let parts = &mut d.disks[0].partitions;
    let recovery = parts.pop().unwrap();
    parts.insert(1, recovery);
    d.sanitize(&SanitizeOpts::default()).unwrap();
    let y = serde_yaml::to_string(&d).unwrap();
    for needle in ["role: efi", "role: recovery", "role: system"] {
        assert!(y.contains(needle), "{y}");
    }
    assert!(serde_yaml::from_str::<Deployment>(&y).is_ok());
}
