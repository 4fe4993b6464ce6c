//! Block devices on the worker host.

pub mod linux;
pub mod parsing;

use crate::error::ShrinkResult;
use async_trait::async_trait;
use std::path::Path;

pub use linux::LinuxToolkit;

const MIB: u64 = 1024 * 1024;

/// Room a fresh GPT needs besides its partitions: the 1 MiB alignment gap,
/// the BIOS boot partition and the backup header at the end of the disk.
pub const PARTITION_TABLE_OVERHEAD_MB: u64 = 3;

/// One partition of an attached volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub device: String,
    pub size_mb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemIdentity {
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub fs_type: Option<String>,
}

impl FilesystemIdentity {
    /// Partitions without a mountable filesystem are copied block for block.
    pub fn is_raw(&self) -> bool {
        match self.fs_type.as_deref() {
            None | Some("") | Some("swap") => true,
            Some(_) => false,
        }
    }
}

/// Size of one partition in a new partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionExtent {
    Sized(u64),
    /// Takes whatever is left on the device
    Rest,
}

#[async_trait]
pub trait DeviceToolkit: Send + Sync {
    /// Data partitions of `device` in table order, BIOS boot partitions excluded.
    async fn list_partitions(&self, device: &str) -> ShrinkResult<Vec<PartitionEntry>>;

    async fn read_filesystem_id(&self, device: &str) -> ShrinkResult<FilesystemIdentity>;

    async fn mount(&self, device: &str, path: &Path) -> ShrinkResult<()>;

    async fn unmount(&self, path: &Path) -> ShrinkResult<()>;

    async fn measure_used_mb(&self, mount_path: &Path) -> ShrinkResult<u64>;

    /// Write a fresh GPT with one partition per extent and return the new
    /// partition devices in the same order.
    async fn create_partition_table(
        &self,
        device: &str,
        extents: &[PartitionExtent],
    ) -> ShrinkResult<Vec<String>>;

    async fn create_filesystem(&self, device: &str) -> ShrinkResult<()>;

    async fn set_filesystem_identity(
        &self,
        device: &str,
        uuid: &str,
        label: Option<&str>,
    ) -> ShrinkResult<()>;

    async fn block_copy(&self, source: &str, target: &str) -> ShrinkResult<()>;

    /// Copy a mounted tree preserving ownership, permissions and links.
    async fn sync_tree(&self, source: &Path, target: &Path) -> ShrinkResult<()>;

    async fn reinstall_boot_loader(
        &self,
        device: &str,
        mount_path: &Path,
        uuid: &str,
    ) -> ShrinkResult<()>;

    async fn has_boot_directory(&self, mount_path: &Path) -> bool;
}

/// Partition device path, with the `p` separator for disks ending in a digit.
pub fn partition_path(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

pub fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}
