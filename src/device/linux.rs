use super::parsing::{parse_blkid_export, parse_df_used, parse_lsblk_partitions, render_sfdisk_script};
use super::{DeviceToolkit, FilesystemIdentity, PartitionEntry, PartitionExtent};
use crate::args;
use crate::bootloader::{self, BootStaging};
use crate::config::ShrinkConfig;
use crate::error::{ShrinkError, ShrinkResult};
use crate::execution::CommandExecutor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Device toolkit backed by util-linux, e2fsprogs, rsync and grub2.
pub struct LinuxToolkit {
    executor: CommandExecutor,
    filesystem_type: String,
    bios_boot_partition: bool,
    boot_template: PathBuf,
    staging_root: PathBuf,
    settle_delay: Duration,
}

impl LinuxToolkit {
    pub fn new(executor: CommandExecutor, config: &ShrinkConfig) -> Self {
        Self {
            executor,
            filesystem_type: config.filesystem_type.clone(),
            bios_boot_partition: config.bios_boot_partition,
            boot_template: config.boot_template_dir(),
            staging_root: config.work_path.join("staging"),
            settle_delay: config.settle_delay(),
        }
    }

    /// Create the mount directories and the copy of the host's `/boot` used
    /// as the template for reinstalled loaders.
    pub async fn prepare_work_area(&self, mount_dirs: &[PathBuf]) -> ShrinkResult<()> {
        for dir in mount_dirs {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::create_dir_all(&self.staging_root).await?;

        if !tokio::fs::try_exists(&self.boot_template).await? {
            self.executor
                .run("cp", &args!["-a", "/boot", self.boot_template.display()])
                .await?;
            info!("boot template copied to {}", self.boot_template.display());
        }
        Ok(())
    }

    fn staging_for(&self, device: &str) -> PathBuf {
        let name = device.rsplit('/').next().unwrap_or(device);
        self.staging_root.join(name)
    }
}

#[async_trait]
impl DeviceToolkit for LinuxToolkit {
    async fn list_partitions(&self, device: &str) -> ShrinkResult<Vec<PartitionEntry>> {
        let output = self
            .executor
            .run(
                "lsblk",
                &args!["-J", "-b", "-o", "NAME,SIZE,TYPE,PARTTYPE", device],
            )
            .await?;
        parse_lsblk_partitions(&output.stdout)
    }

    async fn read_filesystem_id(&self, device: &str) -> ShrinkResult<FilesystemIdentity> {
        // blkid exits with 2 when the device carries no recognisable signature
        let output = self
            .executor
            .execute("blkid", &args!["-o", "export", device], None)
            .await?;
        Ok(parse_blkid_export(&output.stdout))
    }

    async fn mount(&self, device: &str, path: &Path) -> ShrinkResult<()> {
        self.executor
            .run("mount", &args![device, path.display()])
            .await
            .map(drop)
    }

    async fn unmount(&self, path: &Path) -> ShrinkResult<()> {
        self.executor
            .run("umount", &args![path.display()])
            .await
            .map(drop)
    }

    async fn measure_used_mb(&self, mount_path: &Path) -> ShrinkResult<u64> {
        let output = self
            .executor
            .run("df", &args!["-m", "--output=used", mount_path.display()])
            .await?;
        parse_df_used(&output.stdout)
    }

    async fn create_partition_table(
        &self,
        device: &str,
        extents: &[PartitionExtent],
    ) -> ShrinkResult<Vec<String>> {
        let script = render_sfdisk_script(device, extents, self.bios_boot_partition);
        self.executor
            .run_with_input("sfdisk", &args![device], &script)
            .await?;
        self.executor.run("udevadm", &args!["settle"]).await?;
        tokio::time::sleep(self.settle_delay).await;

        let partitions: Vec<String> = self
            .list_partitions(device)
            .await?
            .into_iter()
            .map(|p| p.device)
            .collect();

        if partitions.len() != extents.len() {
            return Err(ShrinkError::Parse(format!(
                "{} shows {} partitions after partitioning, expected {}",
                device,
                partitions.len(),
                extents.len()
            )));
        }
        Ok(partitions)
    }

    async fn create_filesystem(&self, device: &str) -> ShrinkResult<()> {
        let program = format!("mkfs.{}", self.filesystem_type);
        self.executor
            .run(&program, &args!["-F", device])
            .await
            .map(drop)
    }

    async fn set_filesystem_identity(
        &self,
        device: &str,
        uuid: &str,
        label: Option<&str>,
    ) -> ShrinkResult<()> {
        let mut args = args!["-U", uuid];
        if let Some(label) = label {
            args.extend(args!["-L", label]);
        }
        args.push(device.to_string());
        self.executor.run("tune2fs", &args).await.map(drop)
    }

    async fn block_copy(&self, source: &str, target: &str) -> ShrinkResult<()> {
        self.executor
            .run(
                "dd",
                &args![
                    format!("if={source}"),
                    format!("of={target}"),
                    "bs=4M",
                    "conv=fsync",
                    "status=none"
                ],
            )
            .await
            .map(drop)
    }

    async fn sync_tree(&self, source: &Path, target: &Path) -> ShrinkResult<()> {
        self.executor
            .run(
                "rsync",
                &args![
                    "-aHAX",
                    "--numeric-ids",
                    format!("{}/", source.display()),
                    format!("{}/", target.display())
                ],
            )
            .await
            .map(drop)
    }

    async fn reinstall_boot_loader(
        &self,
        device: &str,
        mount_path: &Path,
        uuid: &str,
    ) -> ShrinkResult<()> {
        let layout = BootStaging {
            template: self.boot_template.clone(),
            staging: self.staging_for(device),
        };
        bootloader::reinstall(&self.executor, &layout, device, mount_path, uuid).await
    }

    async fn has_boot_directory(&self, mount_path: &Path) -> bool {
        tokio::fs::metadata(mount_path.join("boot"))
            .await
            .is_ok_and(|m| m.is_dir())
    }
}

/// Tools the toolkit and the cloud adapter shell out to.
pub fn required_tools(filesystem_type: &str) -> Vec<String> {
    let mut tools: Vec<String> = [
        "lsblk", "blkid", "mount", "umount", "df", "sfdisk", "udevadm", "tune2fs", "dd", "rsync",
        "cp", "rm", "grub2-install", "aws",
    ]
    .iter()
    .map(|t| t.to_string())
    .collect();
    tools.push(format!("mkfs.{filesystem_type}"));
    tools
}

/// Names of `tools` that cannot be found on `PATH`.
pub fn missing_tools(tools: &[String]) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| {
            let found = which::which(tool).is_ok();
            if !found {
                warn!("{} not found on PATH", tool);
            }
            !found
        })
        .cloned()
        .collect()
}
