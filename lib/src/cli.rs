//! Command line interface for installs, upgrades and status.

use std::ffi::OsString;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::bootentry;
use crate::deployment::{Bootloader, Deployment, SanitizeOpts};
use crate::imagesource::ImageSource;
use crate::snapshotter::Snapshotter;
use crate::task::Task;
use crate::transaction::UpgradeHelper;

/// Install the OS onto a prepared disk.
///
/// The target partitions must already be formatted; this populates the
/// first snapshot, merges nothing and wires up the bootloader.
#[derive(Debug, Parser)]
pub(crate) struct InstallOpts {
    /// Target disk device, e.g. /dev/vda.
    #[clap(long)]
    pub(crate) device: Utf8PathBuf,

    /// Deployment description (YAML) layered over the defaults.
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Image source URI (oci://, dir://, raw://, tar://).
    #[clap(long)]
    pub(crate) source: Option<String>,

    /// Kernel command line recorded in the boot entries.
    #[clap(long, default_value = "")]
    pub(crate) cmdline: String,
}

/// Upgrade the running system to a new image.
#[derive(Debug, Parser)]
pub(crate) struct UpgradeOpts {
    /// Image source URI; defaults to the deployed one.
    #[clap(long)]
    pub(crate) source: Option<String>,

    /// Kernel command line; defaults to the deployed one.
    #[clap(long)]
    pub(crate) cmdline: Option<String>,
}

/// Show the persisted deployment and the snapshot state.
#[derive(Debug, Parser)]
pub(crate) struct StatusOpts {
    /// Only print the deployment document.
    #[clap(long)]
    pub(crate) yaml: bool,
}

#[derive(Debug, Parser)]
#[clap(name = "elemental", version, about = "Transactional snapshot-based OS installer")]
pub(crate) enum Opt {
    Install(InstallOpts),
    Upgrade(UpgradeOpts),
    Status(StatusOpts),
}

/// Parse the command line and run the selected verb.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    match Opt::parse_from(args) {
        Opt::Install(opts) => install(opts),
        Opt::Upgrade(opts) => upgrade(opts),
        Opt::Status(opts) => status(opts),
    }
}

fn install(opts: InstallOpts) -> Result<()> {
    let mut deployment = Deployment::with_defaults();
    if let Some(config) = &opts.config {
        let buf = std::fs::read_to_string(config)
            .with_context(|| format!("reading {config}"))?;
        let overrides: Deployment =
            serde_yaml::from_str(&buf).with_context(|| format!("parsing {config}"))?;
        deployment.merge(overrides);
    }
    if let Some(disk) = deployment.disks.first_mut() {
        disk.device = opts.device.clone();
    }
    if let Some(source) = &opts.source {
        deployment.source = ImageSource::from_str(source)?;
    }
    if !opts.cmdline.is_empty() {
        deployment.boot_config.kernel_cmdline = opts.cmdline.clone();
    }
    deployment.sanitize(&SanitizeOpts::default())?;
    run_transaction(deployment)
}

fn upgrade(opts: UpgradeOpts) -> Result<()> {
    let mut deployment = Deployment::parse(Utf8Path::new("/"))?;
    if deployment.disks.is_empty() {
        bail!("no deployment found; is this an installed system?");
    }
    if let Some(source) = &opts.source {
        deployment.source = ImageSource::from_str(source)?;
    }
    if let Some(cmdline) = &opts.cmdline {
        deployment.boot_config.kernel_cmdline = cmdline.clone();
    }
    deployment.sanitize(&SanitizeOpts::default())?;
    run_transaction(deployment)
}

/// Drive the full sequence; every error before the commit funnels into a
/// rollback.
fn run_transaction(deployment: Deployment) -> Result<()> {
    let token = CancellationToken::new();
    let mut helper = UpgradeHelper::init(deployment, token)?;
    let mut transaction = helper.start()?;
    let prepared = (|| -> Result<()> {
        helper.sync_image_content(&mut transaction)?;
        helper.merge(&mut transaction)?;
        helper.update_fstab(&mut transaction)?;
        helper.lock(&mut transaction)?;
        let deployment = helper.deployment();
        if let Some(script) = deployment.config_script.clone() {
            helper.run_in_snapshot(&transaction, |root| {
                Task::new(format!("Running configuration script {script}"), script.as_str())
                    .arg(root.as_str())
                    .cwd(root)
                    .run()
            })?;
        }
        if helper.deployment().boot_config.bootloader != Bootloader::None {
            bootentry::install(
                &transaction.path,
                transaction.id,
                &helper.deployment().boot_config.kernel_cmdline,
                helper.deployment(),
            )?;
        }
        Ok(())
    })();
    match prepared {
        Ok(()) => {
            helper.commit(&mut transaction)?;
            // Trim boot entries to the snapshots that survived pruning.
            // The system already boots the new snapshot; failures here
            // only leave stale menu entries behind.
            if helper.deployment().boot_config.bootloader != Bootloader::None {
                let result = helper.snapshot_ids().and_then(|keep| {
                    bootentry::prune(&transaction.path, &keep, helper.deployment())
                });
                if let Err(e) = result {
                    tracing::warn!("pruning boot entries failed: {e:#}");
                }
            }
            Ok(())
        }
        Err(e) => Err(helper.rollback(&mut transaction, e)),
    }
}

fn status(opts: StatusOpts) -> Result<()> {
    let root = Utf8Path::new("/");
    let deployment = Deployment::parse(root)?;
    print!("{}", serde_yaml::to_string(&deployment)?);
    if opts.yaml {
        return Ok(());
    }
    let extensions = crate::deployment::parse_extensions(root)?;
    if !extensions.is_empty() {
        println!("extensions:");
        for ext in &extensions {
            println!("  - {} ({})", ext.name, ext.image);
        }
    }
    let snapshotter = Snapshotter::new(deployment.snapshotter);
    match snapshotter.list_snapshots(root, "root") {
        Ok(snapshots) => {
            println!("snapshots:");
            for s in snapshots {
                let mut flags = String::new();
                if s.default {
                    flags.push_str(" default");
                }
                if s.active {
                    flags.push_str(" active");
                }
                println!("  - {}{flags}", s.id);
            }
        }
        Err(e) => tracing::warn!("snapshot listing unavailable: {e:#}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_install() {
        let opt = Opt::parse_from([
            "elemental",
            "install",
            "--device",
            "/dev/vda",
            "--source",
            "dir:///srv/os",
            "--cmdline",
            "console=ttyS0",
        ]);
        let Opt::Install(opts) = opt else {
            panic!("expected install")
        };
        assert_eq!(opts.device, "/dev/vda");
        assert_eq!(opts.source.as_deref(), Some("dir:///srv/os"));
        assert_eq!(opts.cmdline, "console=ttyS0");
    }

    #[test]
    fn test_parse_upgrade_defaults() {
        let opt = Opt::parse_from(["elemental", "upgrade"]);
        let Opt::Upgrade(opts) = opt else {
            panic!("expected upgrade")
        };
        assert!(opts.source.is_none());
        assert!(opts.cmdline.is_none());
    }
}
