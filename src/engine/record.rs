//! Per-volume lifecycle state.

use crate::cloud::{InstanceState, VolumeHandle};
use crate::device::PartitionExtent;
use crate::error::{OpOutcome, ShrinkError, ShrinkResult};
use tracing::warn;

/// Where the origin volume came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Detached from an instance; goes back to `device` on `instance_id`.
    Attached {
        instance_id: String,
        device: String,
        pre_shrink_state: InstanceState,
    },
    /// Temporary volume restored from a snapshot
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Origin,
    Replacement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub source_device: String,
    pub replacement_device: Option<String>,
    pub filesystem_id: Option<String>,
    pub label: Option<String>,
    pub size_estimate_mb: u64,
    pub raw: bool,
}

/// Partitions of a volume in table order. Index `i` names the same logical
/// partition on the origin and on the replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable(Vec<Partition>);

impl PartitionTable {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self(partitions)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Partition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_estimate_mb(&self) -> u64 {
        self.0.iter().map(|p| p.size_estimate_mb).sum()
    }

    /// Extents for the replacement table; the last partition takes the rest
    /// of the device.
    pub fn extents(&self) -> Vec<PartitionExtent> {
        let last = self.0.len().saturating_sub(1);
        self.0
            .iter()
            .enumerate()
            .map(|(idx, p)| {
                if idx == last {
                    PartitionExtent::Rest
                } else {
                    PartitionExtent::Sized(p.size_estimate_mb)
                }
            })
            .collect()
    }

    pub fn bind_replacements(&mut self, devices: Vec<String>) -> ShrinkResult<()> {
        if devices.len() != self.0.len() {
            return Err(ShrinkError::Parse(format!(
                "{} replacement partitions for {} source partitions",
                devices.len(),
                self.0.len()
            )));
        }
        for (partition, device) in self.0.iter_mut().zip(devices) {
            partition.replacement_device = Some(device);
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a PartitionTable {
    type Item = &'a Partition;
    type IntoIter = std::slice::Iter<'a, Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone)]
pub struct VolumeRecord {
    pub origin: VolumeHandle,
    pub replacement: Option<VolumeHandle>,
    pub ownership: Ownership,
    pub partitions: PartitionTable,
    result: Option<Winner>,
    pub finalized: bool,
    /// The replacement won but its owner failed to start on it, so the origin
    /// was put back.
    pub rolled_back: bool,
    /// How the last probe, provision or migration step ended.
    pub outcome: OpOutcome,
}

impl VolumeRecord {
    pub fn attached(
        origin: VolumeHandle,
        instance_id: impl Into<String>,
        device: impl Into<String>,
        pre_shrink_state: InstanceState,
    ) -> Self {
        Self::new(
            origin,
            Ownership::Attached {
                instance_id: instance_id.into(),
                device: device.into(),
                pre_shrink_state,
            },
        )
    }

    pub fn detached(origin: VolumeHandle) -> Self {
        Self::new(origin, Ownership::Detached)
    }

    fn new(origin: VolumeHandle, ownership: Ownership) -> Self {
        Self {
            origin,
            replacement: None,
            ownership,
            partitions: PartitionTable::default(),
            result: None,
            finalized: false,
            rolled_back: false,
            outcome: OpOutcome::Ok,
        }
    }

    /// Set the winning volume. Returns false when it was already decided.
    pub fn decide(&mut self, winner: Winner) -> bool {
        match self.result {
            None => {
                self.result = Some(winner);
                true
            }
            Some(current) => {
                if current != winner {
                    warn!(
                        "{} already decided for {:?}, ignoring {:?}",
                        self.origin.id, current, winner
                    );
                }
                false
            }
        }
    }

    pub fn result(&self) -> Option<Winner> {
        self.result
    }

    /// Undecided records count as failed.
    pub fn winner(&self) -> Winner {
        match (self.result, &self.replacement) {
            (Some(Winner::Replacement), Some(_)) => Winner::Replacement,
            _ => Winner::Origin,
        }
    }

    pub fn winning_volume(&self) -> &VolumeHandle {
        match (self.winner(), &self.replacement) {
            (Winner::Replacement, Some(replacement)) => replacement,
            _ => &self.origin,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        match &self.ownership {
            Ownership::Attached { instance_id, .. } => Some(instance_id),
            Ownership::Detached => None,
        }
    }

    pub fn device(&self) -> Option<&str> {
        match &self.ownership {
            Ownership::Attached { device, .. } => Some(device),
            Ownership::Detached => None,
        }
    }

    pub fn pre_shrink_state(&self) -> Option<&InstanceState> {
        match &self.ownership {
            Ownership::Attached {
                pre_shrink_state, ..
            } => Some(pre_shrink_state),
            Ownership::Detached => None,
        }
    }

    /// Whether the replacement is what the owner ends up using.
    pub fn is_shrunk(&self) -> bool {
        self.winner() == Winner::Replacement && !self.rolled_back
    }

    pub fn reduced_gb(&self) -> u64 {
        match (&self.replacement, self.is_shrunk()) {
            (Some(replacement), true) => self.origin.size_gb.saturating_sub(replacement.size_gb),
            _ => 0,
        }
    }

    /// `vol-1[Reduced 40GB] on running i-1/dev/sdb`
    pub fn summary_line(&self) -> String {
        let result = if self.is_shrunk() {
            format!("Reduced {}GB", self.reduced_gb())
        } else {
            "NoShrink".to_string()
        };

        match &self.ownership {
            Ownership::Attached {
                instance_id,
                device,
                pre_shrink_state,
            } => format!(
                "{}[{}] on {} {}{}",
                self.origin.id, result, pre_shrink_state, instance_id, device
            ),
            Ownership::Detached => format!(
                "{}[{}] on snapshot {}",
                self.origin.id,
                result,
                self.origin.snapshot_id.as_deref().unwrap_or("-")
            ),
        }
    }
}

#[cfg(test)]
pub(crate) fn volume(id: &str, size_gb: u64) -> VolumeHandle {
    VolumeHandle {
        id: id.to_string(),
        size_gb,
        volume_type: "gp2".to_string(),
        iops: None,
        availability_zone: "az-1".to_string(),
        snapshot_id: None,
    }
}
