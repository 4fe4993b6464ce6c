//! Parsing of `lsblk`, `df` and `blkid` output, and `sfdisk` script rendering.

use super::{FilesystemIdentity, PartitionEntry, PartitionExtent, bytes_to_mb, partition_path};
use crate::error::{ShrinkError, ShrinkResult};
use serde::Deserialize;
use std::fmt::Write;

pub const BIOS_BOOT_GUID: &str = "21686148-6449-6E6F-744E-656564454649";
const BIOS_BOOT_NUMBER: u32 = 128;

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    size: LsblkSize,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    parttype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Newer lsblk prints `-b` sizes as numbers, older releases as strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LsblkSize {
    Bytes(u64),
    Text(String),
}

impl LsblkSize {
    fn bytes(&self) -> ShrinkResult<u64> {
        match self {
            LsblkSize::Bytes(b) => Ok(*b),
            LsblkSize::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| ShrinkError::Parse(format!("lsblk size '{}'", s))),
        }
    }
}

/// Partitions from `lsblk -J -b -o NAME,SIZE,TYPE,PARTTYPE <disk>`.
pub fn parse_lsblk_partitions(json: &str) -> ShrinkResult<Vec<PartitionEntry>> {
    let output: LsblkOutput = serde_json::from_str(json)?;
    let mut partitions = Vec::new();

    for disk in &output.blockdevices {
        for child in &disk.children {
            if child.kind != "part" {
                continue;
            }
            if child
                .parttype
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case(BIOS_BOOT_GUID))
            {
                continue;
            }
            partitions.push(PartitionEntry {
                device: format!("/dev/{}", child.name),
                size_mb: bytes_to_mb(child.size.bytes()?),
            });
        }
    }

    Ok(partitions)
}

/// Used megabytes from `df -m --output=used <path>`.
pub fn parse_df_used(output: &str) -> ShrinkResult<u64> {
    let value = output
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| ShrinkError::Parse("empty df output".to_string()))?;

    value
        .parse()
        .map_err(|_| ShrinkError::Parse(format!("df used column '{}'", value)))
}

/// Identity from `blkid -o export <device>`.
pub fn parse_blkid_export(output: &str) -> FilesystemIdentity {
    let mut identity = FilesystemIdentity::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        match key.trim() {
            "UUID" => identity.uuid = value,
            "LABEL" => identity.label = value,
            "TYPE" => identity.fs_type = value,
            _ => {}
        }
    }
    identity
}

/// GPT script for `sfdisk`, partitions numbered from 1 in extent order.
///
/// With `bios_boot` a BIOS boot partition (number 128) takes sectors
/// 2048..4095 so `grub2-install` has somewhere to embed its core image.
pub fn render_sfdisk_script(disk: &str, extents: &[PartitionExtent], bios_boot: bool) -> String {
    let mut script = String::from("label: gpt\n");

    if bios_boot {
        let _ = writeln!(
            script,
            "{} : start=2048, size=2048, type={}",
            partition_path(disk, BIOS_BOOT_NUMBER),
            BIOS_BOOT_GUID
        );
    }

    for (idx, extent) in extents.iter().enumerate() {
        let device = partition_path(disk, idx as u32 + 1);
        let _ = match extent {
            PartitionExtent::Sized(mb) => writeln!(script, "{} : size={}MiB, type=L", device, mb),
            PartitionExtent::Rest => writeln!(script, "{} : type=L", device),
        };
    }

    script
}
