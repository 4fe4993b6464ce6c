//! Cloud control plane: volumes, snapshots, images and instances.

pub mod aws;
pub mod metadata;
pub mod ops;

use crate::error::ShrinkResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use metadata::WorkerHost;
pub use ops::CloudOps;

/// Handle to a block-storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub id: String,
    pub size_gb: u64,
    pub volume_type: String,
    pub iops: Option<u32>,
    pub availability_zone: String,
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeAttachment {
    pub instance_id: String,
    pub device: String,
    pub state: AttachmentState,
}

/// A volume as returned by listings, with its current attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub handle: VolumeHandle,
    pub state: VolumeState,
    pub attachment: Option<VolumeAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
    Unknown,
}

impl VolumeState {
    pub fn from_api(state: &str) -> Self {
        match state {
            "creating" => VolumeState::Creating,
            "available" => VolumeState::Available,
            "in-use" => VolumeState::InUse,
            "deleting" => VolumeState::Deleting,
            "deleted" => VolumeState::Deleted,
            "error" => VolumeState::Error,
            _ => VolumeState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
    Unknown,
}

impl AttachmentState {
    pub fn from_api(state: &str) -> Self {
        match state {
            "attaching" => AttachmentState::Attaching,
            "attached" => AttachmentState::Attached,
            "detaching" => AttachmentState::Detaching,
            "detached" => AttachmentState::Detached,
            _ => AttachmentState::Unknown,
        }
    }
}

/// Volume state plus the state of its first attachment, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStatus {
    pub state: VolumeState,
    pub attachment: Option<AttachmentState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    Other(String),
}

impl InstanceState {
    pub fn from_api(state: &str) -> Self {
        match state {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "terminated" => InstanceState::Terminated,
            other => InstanceState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
            InstanceState::Other(s) => s,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: String,
    pub availability_zone: String,
    pub state: InstanceState,
}

/// Result of the instance status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceHealth {
    Ok,
    Impaired,
    Initializing,
    InsufficientData,
    NotApplicable,
    Unknown,
}

impl InstanceHealth {
    pub fn from_api(status: &str) -> Self {
        match status {
            "ok" => InstanceHealth::Ok,
            "impaired" => InstanceHealth::Impaired,
            "initializing" => InstanceHealth::Initializing,
            "insufficient-data" => InstanceHealth::InsufficientData,
            "not-applicable" => InstanceHealth::NotApplicable,
            _ => InstanceHealth::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub health: InstanceHealth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub id: String,
    pub volume_size_gb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub name: Option<String>,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Listing filter in the `Name=Value1,Value2` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Parse command line filters, merging repeated names.
    ///
    /// Arguments that are not exactly one `Name=Values` pair are ignored.
    pub fn parse_all<S: AsRef<str>>(args: &[S]) -> Vec<Filter> {
        let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for arg in args {
            let parts: Vec<&str> = arg.as_ref().split('=').collect();
            let [name, values] = parts.as_slice() else {
                tracing::warn!("ignoring malformed filter '{}'", arg.as_ref());
                continue;
            };
            if name.is_empty() {
                continue;
            }
            merged.entry(name.to_string()).or_default().extend(
                values
                    .split(',')
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_string()),
            );
        }

        merged
            .into_iter()
            .map(|(name, values)| Filter {
                name,
                values: values.into_iter().collect(),
            })
            .collect()
    }

    pub fn to_arg(&self) -> String {
        format!("Name={},Values={}", self.name, self.values.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub volume_type: String,
    pub size_gb: Option<u64>,
    pub iops: Option<u32>,
    pub availability_zone: String,
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub user_data: Option<String>,
    pub iam_instance_profile_arn: Option<String>,
    pub terminate_on_shutdown: bool,
}

/// Raw control-plane calls. None of these wait for the requested state
/// change; see [`CloudOps`] for the polling wrappers.
#[async_trait]
pub trait CloudVolumeService: Send + Sync {
    async fn create_volume(&self, request: &CreateVolumeRequest) -> ShrinkResult<VolumeHandle>;

    async fn delete_volume(&self, volume_id: &str) -> ShrinkResult<()>;

    async fn attach_volume(
        &self,
        volume_id: &str,
        device: &str,
        instance_id: &str,
    ) -> ShrinkResult<()>;

    async fn detach_volume(&self, volume_id: &str) -> ShrinkResult<()>;

    async fn tag_resource(&self, resource_id: &str, tags: &[Tag]) -> ShrinkResult<()>;

    async fn describe_volume_state(&self, volume_id: &str) -> ShrinkResult<VolumeStatus>;

    async fn create_instance(&self, request: &LaunchRequest) -> ShrinkResult<InstanceHandle>;

    async fn start_instance(&self, instance_id: &str) -> ShrinkResult<()>;

    async fn stop_instance(&self, instance_id: &str) -> ShrinkResult<()>;

    async fn terminate_instance(&self, instance_id: &str) -> ShrinkResult<()>;

    async fn describe_instance_status(&self, instance_id: &str) -> ShrinkResult<InstanceStatus>;

    async fn list_volumes(&self, filters: &[Filter]) -> ShrinkResult<Vec<VolumeInfo>>;

    async fn list_instances(&self, filters: &[Filter]) -> ShrinkResult<Vec<InstanceHandle>>;

    async fn list_snapshots(&self, filters: &[Filter]) -> ShrinkResult<Vec<SnapshotInfo>>;

    async fn list_images(&self, filters: &[Filter]) -> ShrinkResult<Vec<ImageInfo>>;

    async fn create_image(&self, instance_id: &str, name: &str, description: &str)
    -> ShrinkResult<String>;
}
