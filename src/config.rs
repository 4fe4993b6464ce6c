//! Run configuration.
//!
//! Every field has a default, so an absent or partial TOML file is valid:
//!
//! ```toml
//! capacity = 4
//! skip_threshold = 0.75
//!
//! [boot_device]
//! policy = "device_letter"
//! letter = "a"
//!
//! [volume_poll]
//! interval_ms = 1000
//! max_attempts = 60
//! ```

use crate::error::{ShrinkError, ShrinkResult};
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipComparison {
    /// Skip only when the usage ratio is strictly above the threshold
    #[default]
    Greater,
    /// Skip when the usage ratio reaches the threshold
    GreaterOrEqual,
}

/// How the boot/system volume of an instance is recognised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BootDevicePolicy {
    /// The volume was attached to its owner under this drive letter (`/dev/sda`, `/dev/xvda`)
    DeviceLetter { letter: String },
    /// Any partition carrying a `boot` directory gets its loader reinstalled
    BootDirectory,
    Never,
}

impl Default for BootDevicePolicy {
    fn default() -> Self {
        BootDevicePolicy::DeviceLetter {
            letter: "a".to_string(),
        }
    }
}

impl BootDevicePolicy {
    /// Whether partitions of a volume attached at `device` are candidates for
    /// boot loader reinstallation. Volumes without an owner device only
    /// qualify under [`BootDevicePolicy::BootDirectory`].
    pub fn applies_to(&self, device: Option<&str>) -> bool {
        match self {
            BootDevicePolicy::DeviceLetter { letter } => {
                device.is_some_and(|d| drive_letter(d).is_some_and(|l| letter.starts_with(l)))
            }
            BootDevicePolicy::BootDirectory => true,
            BootDevicePolicy::Never => false,
        }
    }

    /// Whether the owner device names the system disk. Used by `--omit b`,
    /// which has to decide before anything is mounted.
    pub fn names_system_device(&self, device: &str) -> bool {
        let letter = match self {
            BootDevicePolicy::DeviceLetter { letter } => letter.as_str(),
            _ => "a",
        };
        drive_letter(device).is_some_and(|l| letter.starts_with(l))
    }
}

/// Drive letter of an attachment device: `/dev/sda1` -> `a`, `/dev/xvdf` -> `f`.
pub fn drive_letter(device: &str) -> Option<char> {
    device
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .chars()
        .last()
        .filter(|c| c.is_ascii_lowercase())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShrinkConfig {
    pub work_path: PathBuf,
    pub capacity: usize,
    pub min_volume_size_gb: u64,
    pub expansion_factor: f64,
    pub skip_threshold: f64,
    pub skip_comparison: SkipComparison,
    pub device_prefix: String,
    pub first_slot_letter: String,
    pub boot_device: BootDevicePolicy,
    pub iops_volume_types: Vec<String>,
    pub size_ceiling_gb: BTreeMap<String, u64>,
    pub scan_floor_gb: BTreeMap<String, u64>,
    pub snapshot_volume_type: String,
    pub image_instance_type: String,
    pub worker_instance_type: String,
    pub worker_image_name: String,
    pub worker_command: String,
    pub filesystem_type: String,
    pub bios_boot_partition: bool,
    pub volume_poll: RetryPolicy,
    pub instance_poll: RetryPolicy,
    pub settle_delay_ms: u64,
    pub benign_stderr: Vec<String>,
}

impl Default for ShrinkConfig {
    fn default() -> Self {
        let throughput_limits: BTreeMap<String, u64> =
            [("sc1".to_string(), 500), ("st1".to_string(), 500)].into();

        Self {
            work_path: PathBuf::from("/tmp/shrink"),
            capacity: 6,
            min_volume_size_gb: 5,
            expansion_factor: 1.2,
            skip_threshold: 0.7,
            skip_comparison: SkipComparison::default(),
            device_prefix: "/dev/sd".to_string(),
            first_slot_letter: "f".to_string(),
            boot_device: BootDevicePolicy::default(),
            iops_volume_types: vec!["io1".to_string(), "io2".to_string()],
            size_ceiling_gb: throughput_limits.clone(),
            scan_floor_gb: throughput_limits,
            snapshot_volume_type: "gp2".to_string(),
            image_instance_type: "t3.micro".to_string(),
            worker_instance_type: "c5.large".to_string(),
            worker_image_name: "VolumeShrink".to_string(),
            worker_command: "cd /home/ec2-user/volshrink && ./volshrink".to_string(),
            filesystem_type: "ext4".to_string(),
            bios_boot_partition: true,
            volume_poll: RetryPolicy::new(1000, 30),
            instance_poll: RetryPolicy::new(2000, 30),
            settle_delay_ms: 3000,
            benign_stderr: vec![
                "mke2fs 1.42.9 (28-Dec-2013)".to_string(),
                "Installing for i386-pc platform.\nInstallation finished. No error reported."
                    .to_string(),
            ],
        }
    }
}

impl ShrinkConfig {
    /// Load from `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ShrinkResult<()> {
        if self.capacity == 0 {
            return Err(ShrinkError::Config("capacity must be at least 1".into()));
        }
        if !(self.expansion_factor >= 1.0) {
            return Err(ShrinkError::Config(
                "expansion_factor must be at least 1.0".into(),
            ));
        }
        if !(self.skip_threshold > 0.0 && self.skip_threshold <= 1.0) {
            return Err(ShrinkError::Config(
                "skip_threshold must be within (0, 1]".into(),
            ));
        }

        // identities are rewritten with tune2fs
        if !self.filesystem_type.starts_with("ext") {
            return Err(ShrinkError::Config(format!(
                "filesystem_type '{}' is not an ext filesystem",
                self.filesystem_type
            )));
        }

        let first = self.first_slot_byte()?;
        let last = first as usize + self.capacity * 2 - 1;
        if last > b'z' as usize {
            return Err(ShrinkError::Config(format!(
                "capacity {} does not fit into device letters starting at '{}'",
                self.capacity, self.first_slot_letter
            )));
        }
        Ok(())
    }

    pub fn first_slot_byte(&self) -> ShrinkResult<u8> {
        match self.first_slot_letter.as_bytes() {
            [b] if b.is_ascii_lowercase() => Ok(*b),
            _ => Err(ShrinkError::Config(format!(
                "first_slot_letter must be a single lowercase letter, got '{}'",
                self.first_slot_letter
            ))),
        }
    }

    /// Usage ratios at or below the threshold are worth shrinking.
    pub fn should_skip(&self, usage_ratio: f64) -> bool {
        match self.skip_comparison {
            SkipComparison::Greater => usage_ratio > self.skip_threshold,
            SkipComparison::GreaterOrEqual => usage_ratio >= self.skip_threshold,
        }
    }

    pub fn carries_iops(&self, volume_type: &str) -> bool {
        self.iops_volume_types.iter().any(|t| t == volume_type)
    }

    pub fn size_ceiling(&self, volume_type: &str) -> Option<u64> {
        self.size_ceiling_gb.get(volume_type).copied()
    }

    pub fn scan_floor(&self, volume_type: &str) -> Option<u64> {
        self.scan_floor_gb.get(volume_type).copied()
    }

    pub fn mount_root(&self) -> &Path {
        &self.work_path
    }

    /// Copy of the worker's own `/boot`, used as the template for reinstalled loaders.
    pub fn boot_template_dir(&self) -> PathBuf {
        self.work_path.join("boot")
    }

    pub fn default_log_file(&self) -> PathBuf {
        self.work_path.join("volshrink.log")
    }

    pub fn settle_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.settle_delay_ms)
    }
}
