//! Attachment devices and mount points on the worker host.
//!
//! Batch position `i` owns two device letters: `first + i` for the origin
//! and `first + capacity + i` for the replacement.

use crate::config::ShrinkConfig;
use crate::error::{ShrinkError, ShrinkResult};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
    pub origin_device: String,
    pub replacement_device: String,
    pub origin_mount: PathBuf,
    pub replacement_mount: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SlotAllocator {
    device_prefix: String,
    first_letter: u8,
    capacity: usize,
    mount_root: PathBuf,
}

impl SlotAllocator {
    pub fn from_config(config: &ShrinkConfig) -> ShrinkResult<Self> {
        Ok(Self {
            device_prefix: config.device_prefix.clone(),
            first_letter: config.first_slot_byte()?,
            capacity: config.capacity,
            mount_root: config.mount_root().to_path_buf(),
        })
    }

    pub fn slot(&self, index: usize) -> ShrinkResult<Slot> {
        if index >= self.capacity {
            return Err(ShrinkError::Config(format!(
                "slot {} requested with capacity {}",
                index, self.capacity
            )));
        }

        let origin = self.letter(index);
        let replacement = self.letter(index + self.capacity);
        Ok(Slot {
            index,
            origin_device: format!("{}{}", self.device_prefix, origin),
            replacement_device: format!("{}{}", self.device_prefix, replacement),
            origin_mount: self.mount_root.join(origin.to_string()),
            replacement_mount: self.mount_root.join(replacement.to_string()),
        })
    }

    /// Every mount directory any slot can use.
    pub fn mount_dirs(&self) -> Vec<PathBuf> {
        (0..self.capacity * 2)
            .map(|offset| self.mount_root.join(self.letter(offset).to_string()))
            .collect()
    }

    fn letter(&self, offset: usize) -> char {
        char::from(self.first_letter + offset as u8)
    }
}
