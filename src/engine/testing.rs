//! In-memory cloud and device toolkit for engine tests.
//!
//! State changes take effect immediately. The device fake finds out which
//! volume sits behind a worker device by asking the cloud fake, so partition
//! contents follow volumes through attach and detach.

use super::ShrinkContext;
use crate::bootloader;
use crate::cloud::{
    AttachmentState, CloudVolumeService, CreateVolumeRequest, Filter, ImageInfo, InstanceHandle,
    InstanceHealth, InstanceState, InstanceStatus, LaunchRequest, SnapshotInfo, Tag,
    VolumeAttachment, VolumeHandle, VolumeInfo, VolumeState, VolumeStatus, WorkerHost,
};
use crate::config::ShrinkConfig;
use crate::device::{
    DeviceToolkit, FilesystemIdentity, PARTITION_TABLE_OVERHEAD_MB, PartitionEntry, PartitionExtent,
};
use crate::error::{ShrinkError, ShrinkResult};
use crate::retry::RetryPolicy;
use crate::retry::testing::ManualClock;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const WORKER_ID: &str = "i-worker";
pub const WORKER_AZ: &str = "az-1";

pub fn worker() -> WorkerHost {
    WorkerHost {
        instance_id: WORKER_ID.to_string(),
        availability_zone: WORKER_AZ.to_string(),
        region: "region-1".to_string(),
        iam_instance_profile_arn: Some("arn:aws:iam::1:instance-profile/shrink".to_string()),
    }
}

pub fn handle(id: &str, size_gb: u64) -> VolumeHandle {
    VolumeHandle {
        id: id.to_string(),
        size_gb,
        volume_type: "gp2".to_string(),
        iops: None,
        availability_zone: WORKER_AZ.to_string(),
        snapshot_id: None,
    }
}

/// Short polls and no settle delay.
pub fn test_config() -> ShrinkConfig {
    ShrinkConfig {
        volume_poll: RetryPolicy::new(1000, 3),
        instance_poll: RetryPolicy::new(2000, 3),
        settle_delay_ms: 0,
        ..ShrinkConfig::default()
    }
}

fn tool_error(command: impl Into<String>, stderr: impl Into<String>) -> ShrinkError {
    ShrinkError::Tooling {
        command: command.into(),
        status: "exit status: 1".to_string(),
        stderr: stderr.into(),
    }
}

#[derive(Debug, Clone)]
pub struct FakeVolume {
    pub handle: VolumeHandle,
    pub state: VolumeState,
    /// (instance, device)
    pub attachment: Option<(String, String)>,
    pub tags: Vec<Tag>,
}

impl FakeVolume {
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.iter().any(|t| t.key == key && t.value == value)
    }
}

#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub state: InstanceState,
    pub availability_zone: String,
    pub tags: Vec<Tag>,
}

#[derive(Default)]
struct CloudState {
    volumes: BTreeMap<String, FakeVolume>,
    instances: BTreeMap<String, FakeInstance>,
    snapshots: Vec<SnapshotInfo>,
    images: Vec<ImageInfo>,
    launched: Vec<LaunchRequest>,
    next_id: u32,
    calls: Vec<String>,
    stuck_creating: bool,
    impaired_on_replacement: bool,
    fail_attach: BTreeSet<(String, String)>,
    fail_start: BTreeSet<String>,
}

impl CloudState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn volume_mut(&mut self, id: &str) -> ShrinkResult<&mut FakeVolume> {
        self.volumes
            .get_mut(id)
            .ok_or_else(|| ShrinkError::cloud("volume", format!("{id} does not exist")))
    }

    fn instance_mut(&mut self, id: &str) -> ShrinkResult<&mut FakeInstance> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| ShrinkError::cloud("instance", format!("{id} does not exist")))
    }
}

fn passes(filters: &[Filter], name: &str, value: &str) -> bool {
    filters
        .iter()
        .filter(|f| f.name == name)
        .all(|f| f.values.iter().any(|v| v == value))
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<T>(&self, f: impl FnOnce(&mut CloudState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn log(&self, call: String) {
        self.with(|s| s.calls.push(call));
    }

    /// Add a detached, available volume.
    pub fn add_volume(&self, handle: VolumeHandle) {
        self.with(|s| {
            s.volumes.insert(
                handle.id.clone(),
                FakeVolume {
                    handle,
                    state: VolumeState::Available,
                    attachment: None,
                    tags: Vec::new(),
                },
            )
        });
    }

    pub fn add_instance(&self, id: &str, state: InstanceState) {
        self.add_instance_in(id, state, WORKER_AZ);
    }

    pub fn add_instance_in(&self, id: &str, state: InstanceState, availability_zone: &str) {
        self.with(|s| {
            s.instances.insert(
                id.to_string(),
                FakeInstance {
                    state,
                    availability_zone: availability_zone.to_string(),
                    tags: Vec::new(),
                },
            )
        });
    }

    /// Change an instance's state without going through the service calls.
    pub fn set_instance_state(&self, id: &str, state: InstanceState) {
        self.with(|s| {
            if let Some(instance) = s.instances.get_mut(id) {
                instance.state = state;
            }
        });
    }

    pub fn attach_existing(&self, volume_id: &str, instance_id: &str, device: &str) {
        self.with(|s| {
            if let Some(volume) = s.volumes.get_mut(volume_id) {
                volume.attachment = Some((instance_id.to_string(), device.to_string()));
                volume.state = VolumeState::InUse;
            }
        });
    }

    pub fn add_snapshot(&self, id: &str, size_gb: u64) {
        self.with(|s| {
            s.snapshots.push(SnapshotInfo {
                id: id.to_string(),
                volume_size_gb: size_gb,
            })
        });
    }

    pub fn add_image(&self, id: &str, name: &str) {
        self.with(|s| {
            s.images.push(ImageInfo {
                id: id.to_string(),
                name: Some(name.to_string()),
                state: "available".to_string(),
            })
        });
    }

    /// Newly created volumes stay in `creating` forever.
    pub fn set_stuck_creating(&self, stuck: bool) {
        self.with(|s| s.stuck_creating = stuck);
    }

    /// Instances fail their status checks while a `ShrinkFrom` volume is attached.
    pub fn set_impaired_on_replacement(&self, impaired: bool) {
        self.with(|s| s.impaired_on_replacement = impaired);
    }

    /// Attaching this volume to this instance fails.
    pub fn fail_attach(&self, volume_id: &str, instance_id: &str) {
        self.with(|s| {
            s.fail_attach
                .insert((volume_id.to_string(), instance_id.to_string()))
        });
    }

    /// Every start request for this instance fails.
    pub fn fail_start(&self, instance_id: &str) {
        self.with(|s| s.fail_start.insert(instance_id.to_string()));
    }

    pub fn volume(&self, id: &str) -> Option<FakeVolume> {
        self.with(|s| s.volumes.get(id).cloned())
    }

    pub fn volume_at(&self, instance_id: &str, device: &str) -> Option<String> {
        self.with(|s| {
            s.volumes
                .values()
                .find(|v| {
                    v.attachment
                        .as_ref()
                        .is_some_and(|(i, d)| i == instance_id && d == device)
                })
                .map(|v| v.handle.id.clone())
        })
    }

    pub fn instance(&self, id: &str) -> Option<FakeInstance> {
        self.with(|s| s.instances.get(id).cloned())
    }

    pub fn instance_state(&self, id: &str) -> Option<InstanceState> {
        self.instance(id).map(|i| i.state)
    }

    pub fn volume_ids(&self) -> Vec<String> {
        self.with(|s| s.volumes.keys().cloned().collect())
    }

    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.with(|s| s.launched.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| c.starts_with(prefix)).count())
    }
}

#[async_trait]
impl CloudVolumeService for FakeCloud {
    async fn create_volume(&self, request: &CreateVolumeRequest) -> ShrinkResult<VolumeHandle> {
        self.log(format!("create_volume {:?}", request.size_gb));
        Ok(self.with(|s| {
            let id = format!("vol-new-{}", s.next_id());
            let size_gb = request.size_gb.unwrap_or_else(|| {
                s.snapshots
                    .iter()
                    .find(|snap| Some(&snap.id) == request.snapshot_id.as_ref())
                    .map(|snap| snap.volume_size_gb)
                    .unwrap_or(0)
            });
            let handle = VolumeHandle {
                id: id.clone(),
                size_gb,
                volume_type: request.volume_type.clone(),
                iops: request.iops,
                availability_zone: request.availability_zone.clone(),
                snapshot_id: request.snapshot_id.clone(),
            };
            let state = if s.stuck_creating {
                VolumeState::Creating
            } else {
                VolumeState::Available
            };
            s.volumes.insert(
                id,
                FakeVolume {
                    handle: handle.clone(),
                    state,
                    attachment: None,
                    tags: Vec::new(),
                },
            );
            handle
        }))
    }

    async fn delete_volume(&self, volume_id: &str) -> ShrinkResult<()> {
        self.log(format!("delete_volume {volume_id}"));
        self.with(|s| {
            let volume = s.volume_mut(volume_id)?;
            if volume.attachment.is_some() {
                return Err(ShrinkError::cloud("delete-volume", format!("{volume_id} is in use")));
            }
            s.volumes.remove(volume_id);
            Ok(())
        })
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        device: &str,
        instance_id: &str,
    ) -> ShrinkResult<()> {
        self.log(format!("attach_volume {volume_id} {instance_id}{device}"));
        self.with(|s| {
            if s.fail_attach
                .contains(&(volume_id.to_string(), instance_id.to_string()))
            {
                return Err(ShrinkError::cloud(
                    "attach-volume",
                    format!("{volume_id} cannot be attached to {instance_id}"),
                ));
            }
            let occupied = s.volumes.values().any(|v| {
                v.attachment
                    .as_ref()
                    .is_some_and(|(i, d)| i == instance_id && d == device)
            });
            if occupied {
                return Err(ShrinkError::cloud(
                    "attach-volume",
                    format!("{device} on {instance_id} is already in use"),
                ));
            }
            let volume = s.volume_mut(volume_id)?;
            if volume.state != VolumeState::Available {
                return Err(ShrinkError::cloud(
                    "attach-volume",
                    format!("{volume_id} is not available"),
                ));
            }
            volume.attachment = Some((instance_id.to_string(), device.to_string()));
            volume.state = VolumeState::InUse;
            Ok(())
        })
    }

    async fn detach_volume(&self, volume_id: &str) -> ShrinkResult<()> {
        self.log(format!("detach_volume {volume_id}"));
        self.with(|s| {
            let volume = s.volume_mut(volume_id)?;
            if volume.attachment.take().is_none() {
                return Err(ShrinkError::cloud(
                    "detach-volume",
                    format!("{volume_id} is not attached"),
                ));
            }
            volume.state = VolumeState::Available;
            Ok(())
        })
    }

    async fn tag_resource(&self, resource_id: &str, tags: &[Tag]) -> ShrinkResult<()> {
        self.log(format!("tag_resource {resource_id}"));
        self.with(|s| {
            if let Some(volume) = s.volumes.get_mut(resource_id) {
                volume.tags.extend_from_slice(tags);
            } else if let Some(instance) = s.instances.get_mut(resource_id) {
                instance.tags.extend_from_slice(tags);
            }
            Ok(())
        })
    }

    async fn describe_volume_state(&self, volume_id: &str) -> ShrinkResult<VolumeStatus> {
        self.with(|s| {
            let volume = s.volume_mut(volume_id)?;
            Ok(VolumeStatus {
                state: volume.state,
                attachment: volume.attachment.as_ref().map(|_| AttachmentState::Attached),
            })
        })
    }

    async fn create_instance(&self, request: &LaunchRequest) -> ShrinkResult<InstanceHandle> {
        self.log(format!("create_instance {}", request.image_id));
        Ok(self.with(|s| {
            let id = format!("i-new-{}", s.next_id());
            s.instances.insert(
                id.clone(),
                FakeInstance {
                    state: InstanceState::Running,
                    availability_zone: request.availability_zone.clone(),
                    tags: Vec::new(),
                },
            );
            s.launched.push(request.clone());
            InstanceHandle {
                id,
                availability_zone: request.availability_zone.clone(),
                state: InstanceState::Running,
            }
        }))
    }

    async fn start_instance(&self, instance_id: &str) -> ShrinkResult<()> {
        self.log(format!("start_instance {instance_id}"));
        self.with(|s| {
            if s.fail_start.contains(instance_id) {
                return Err(ShrinkError::cloud(
                    "start-instances",
                    format!("{instance_id}: insufficient capacity"),
                ));
            }
            s.instance_mut(instance_id)?.state = InstanceState::Running;
            Ok(())
        })
    }

    async fn stop_instance(&self, instance_id: &str) -> ShrinkResult<()> {
        self.log(format!("stop_instance {instance_id}"));
        self.with(|s| {
            s.instance_mut(instance_id)?.state = InstanceState::Stopped;
            Ok(())
        })
    }

    async fn terminate_instance(&self, instance_id: &str) -> ShrinkResult<()> {
        self.log(format!("terminate_instance {instance_id}"));
        self.with(|s| {
            s.instance_mut(instance_id)?.state = InstanceState::Terminated;
            Ok(())
        })
    }

    async fn describe_instance_status(&self, instance_id: &str) -> ShrinkResult<InstanceStatus> {
        self.log(format!("describe_instance_status {instance_id}"));
        self.with(|s| {
            let impaired_on_replacement = s.impaired_on_replacement;
            let carries_replacement = s.volumes.values().any(|v| {
                v.attachment.as_ref().is_some_and(|(i, _)| i == instance_id)
                    && v.tags.iter().any(|t| t.key == "ShrinkFrom")
            });
            let state = s.instance_mut(instance_id)?.state.clone();
            let health = match state {
                InstanceState::Running if impaired_on_replacement && carries_replacement => {
                    InstanceHealth::Impaired
                }
                InstanceState::Running => InstanceHealth::Ok,
                _ => InstanceHealth::NotApplicable,
            };
            Ok(InstanceStatus { state, health })
        })
    }

    async fn list_volumes(&self, filters: &[Filter]) -> ShrinkResult<Vec<VolumeInfo>> {
        Ok(self.with(|s| {
            s.volumes
                .values()
                .filter(|v| {
                    let attached_to = v.attachment.as_ref().map(|(i, _)| i.as_str()).unwrap_or("");
                    passes(filters, "attachment.instance-id", attached_to)
                })
                .map(|v| VolumeInfo {
                    handle: v.handle.clone(),
                    state: v.state,
                    attachment: v.attachment.as_ref().map(|(i, d)| VolumeAttachment {
                        instance_id: i.clone(),
                        device: d.clone(),
                        state: AttachmentState::Attached,
                    }),
                })
                .collect()
        }))
    }

    async fn list_instances(&self, filters: &[Filter]) -> ShrinkResult<Vec<InstanceHandle>> {
        Ok(self.with(|s| {
            s.instances
                .iter()
                .filter(|(id, i)| {
                    passes(filters, "instance-id", id)
                        && passes(filters, "instance-state-name", i.state.as_str())
                        && passes(filters, "availability-zone", &i.availability_zone)
                })
                .map(|(id, i)| InstanceHandle {
                    id: id.clone(),
                    availability_zone: i.availability_zone.clone(),
                    state: i.state.clone(),
                })
                .collect()
        }))
    }

    async fn list_snapshots(&self, _filters: &[Filter]) -> ShrinkResult<Vec<SnapshotInfo>> {
        Ok(self.with(|s| s.snapshots.clone()))
    }

    async fn list_images(&self, filters: &[Filter]) -> ShrinkResult<Vec<ImageInfo>> {
        Ok(self.with(|s| {
            s.images
                .iter()
                .filter(|i| {
                    passes(filters, "image-id", &i.id)
                        && passes(filters, "name", i.name.as_deref().unwrap_or(""))
                        && passes(filters, "state", &i.state)
                })
                .cloned()
                .collect()
        }))
    }

    async fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        _description: &str,
    ) -> ShrinkResult<String> {
        self.log(format!("create_image {instance_id} {name}"));
        Ok(self.with(|s| {
            let id = format!("ami-new-{}", s.next_id());
            s.images.push(ImageInfo {
                id: id.clone(),
                name: Some(name.to_string()),
                state: "available".to_string(),
            });
            id
        }))
    }
}

/// Contents of one partition as the device fake sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakePartition {
    pub size_mb: u64,
    pub used_mb: u64,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub fs_type: Option<String>,
    /// grub2 configuration; `Some` means the partition has a `boot` directory
    pub boot_config: Option<String>,
    /// Stands in for the data, follows copies
    pub payload: Option<String>,
}

impl FakePartition {
    pub fn ext4(size_mb: u64, used_mb: u64, uuid: &str) -> Self {
        Self {
            size_mb,
            used_mb,
            uuid: Some(uuid.to_string()),
            fs_type: Some("ext4".to_string()),
            payload: Some(format!("files of {uuid}")),
            ..Default::default()
        }
    }

    pub fn raw(size_mb: u64, payload: &str) -> Self {
        Self {
            size_mb,
            payload: Some(payload.to_string()),
            ..Default::default()
        }
    }

    pub fn labelled(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_boot(mut self, config: &str) -> Self {
        self.boot_config = Some(config.to_string());
        self
    }
}

#[derive(Default)]
struct DeviceState {
    disks: BTreeMap<String, Vec<FakePartition>>,
    mounts: BTreeMap<PathBuf, (String, usize)>,
    fail_copy: BTreeSet<String>,
    fail_mount: BTreeSet<String>,
    fail_mkfs: BTreeSet<String>,
    reinstalls: Vec<(String, String)>,
    calls: Vec<String>,
    next_uuid: u32,
}

impl DeviceState {
    fn partition_mut(&mut self, volume_id: &str, index: usize) -> ShrinkResult<&mut FakePartition> {
        self.disks
            .get_mut(volume_id)
            .and_then(|parts| parts.get_mut(index))
            .ok_or_else(|| tool_error("lookup", format!("{volume_id} has no partition {}", index + 1)))
    }

    fn mounted(&self, path: &Path) -> ShrinkResult<(String, usize)> {
        self.mounts
            .get(path)
            .cloned()
            .ok_or_else(|| tool_error("lookup", format!("{} is not mounted", path.display())))
    }
}

pub struct FakeDevice {
    cloud: Arc<FakeCloud>,
    state: Mutex<DeviceState>,
}

impl FakeDevice {
    pub fn new(cloud: Arc<FakeCloud>) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            state: Mutex::new(DeviceState::default()),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut DeviceState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_layout(&self, volume_id: &str, partitions: Vec<FakePartition>) {
        self.with(|s| s.disks.insert(volume_id.to_string(), partitions));
    }

    pub fn layout(&self, volume_id: &str) -> Vec<FakePartition> {
        self.with(|s| s.disks.get(volume_id).cloned().unwrap_or_default())
    }

    /// File copies out of this volume fail.
    pub fn fail_copy_from(&self, volume_id: &str) {
        self.with(|s| s.fail_copy.insert(volume_id.to_string()));
    }

    /// Mounting any partition of this volume fails.
    pub fn fail_mount_of(&self, volume_id: &str) {
        self.with(|s| s.fail_mount.insert(volume_id.to_string()));
    }

    /// `mkfs` on this partition device fails.
    pub fn fail_mkfs_on(&self, device: &str) {
        self.with(|s| s.fail_mkfs.insert(device.to_string()));
    }

    pub fn reinstalls(&self) -> Vec<(String, String)> {
        self.with(|s| s.reinstalls.clone())
    }

    pub fn active_mounts(&self) -> usize {
        self.with(|s| s.mounts.len())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    fn log(&self, call: String) {
        self.with(|s| s.calls.push(call));
    }

    /// Volume behind a worker disk device.
    fn disk(&self, disk: &str) -> ShrinkResult<String> {
        self.cloud
            .volume_at(WORKER_ID, disk)
            .ok_or_else(|| tool_error("lookup", format!("{disk}: no such device")))
    }

    /// Volume and partition index behind a worker partition device.
    fn partition(&self, device: &str) -> ShrinkResult<(String, usize)> {
        let disk = device.trim_end_matches(|c: char| c.is_ascii_digit());
        let number: usize = device[disk.len()..]
            .parse()
            .map_err(|_| tool_error("lookup", format!("{device} is not a partition")))?;
        Ok((self.disk(disk)?, number - 1))
    }
}

#[async_trait]
impl DeviceToolkit for FakeDevice {
    async fn list_partitions(&self, device: &str) -> ShrinkResult<Vec<PartitionEntry>> {
        let volume = self.disk(device)?;
        Ok(self.with(|s| {
            s.disks
                .get(&volume)
                .map(|parts| {
                    parts
                        .iter()
                        .enumerate()
                        .map(|(idx, p)| PartitionEntry {
                            device: format!("{}{}", device, idx + 1),
                            size_mb: p.size_mb,
                        })
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn read_filesystem_id(&self, device: &str) -> ShrinkResult<FilesystemIdentity> {
        let (volume, index) = self.partition(device)?;
        self.with(|s| {
            let p = s.partition_mut(&volume, index)?;
            Ok(FilesystemIdentity {
                uuid: p.uuid.clone(),
                label: p.label.clone(),
                fs_type: p.fs_type.clone(),
            })
        })
    }

    async fn mount(&self, device: &str, path: &Path) -> ShrinkResult<()> {
        self.log(format!("mount {} {}", device, path.display()));
        let (volume, index) = self.partition(device)?;
        self.with(|s| {
            if s.fail_mount.contains(&volume) {
                return Err(tool_error("mount", "can't read superblock"));
            }
            if s.partition_mut(&volume, index)?.fs_type.is_none() {
                return Err(tool_error("mount", "wrong fs type, bad option, bad superblock"));
            }
            if s.mounts.contains_key(path) {
                return Err(tool_error("mount", format!("{} is busy", path.display())));
            }
            s.mounts.insert(path.to_path_buf(), (volume, index));
            Ok(())
        })
    }

    async fn unmount(&self, path: &Path) -> ShrinkResult<()> {
        self.log(format!("umount {}", path.display()));
        self.with(|s| {
            s.mounts
                .remove(path)
                .map(drop)
                .ok_or_else(|| tool_error("umount", format!("{}: not mounted", path.display())))
        })
    }

    async fn measure_used_mb(&self, mount_path: &Path) -> ShrinkResult<u64> {
        self.with(|s| {
            let (volume, index) = s.mounted(mount_path)?;
            Ok(s.partition_mut(&volume, index)?.used_mb)
        })
    }

    async fn create_partition_table(
        &self,
        device: &str,
        extents: &[PartitionExtent],
    ) -> ShrinkResult<Vec<String>> {
        self.log(format!("sfdisk {device}"));
        let volume = self.disk(device)?;
        let total_mb = self
            .cloud
            .volume(&volume)
            .map(|v| (v.handle.size_gb * 1024).saturating_sub(PARTITION_TABLE_OVERHEAD_MB))
            .unwrap_or(0);

        let sized: u64 = extents
            .iter()
            .map(|e| match e {
                PartitionExtent::Sized(mb) => *mb,
                PartitionExtent::Rest => 0,
            })
            .sum();
        if sized > total_mb {
            return Err(tool_error("sfdisk", "partitions exceed the device"));
        }

        let partitions: Vec<FakePartition> = extents
            .iter()
            .map(|e| FakePartition {
                size_mb: match e {
                    PartitionExtent::Sized(mb) => *mb,
                    PartitionExtent::Rest => total_mb - sized,
                },
                ..Default::default()
            })
            .collect();
        self.with(|s| s.disks.insert(volume, partitions));

        Ok((1..=extents.len())
            .map(|n| format!("{device}{n}"))
            .collect())
    }

    async fn create_filesystem(&self, device: &str) -> ShrinkResult<()> {
        self.log(format!("mkfs {device}"));
        let (volume, index) = self.partition(device)?;
        self.with(|s| {
            if s.fail_mkfs.contains(device) {
                return Err(tool_error("mkfs", format!("{device}: Input/output error")));
            }
            s.next_uuid += 1;
            let uuid = format!("fresh-{}", s.next_uuid);
            let p = s.partition_mut(&volume, index)?;
            p.fs_type = Some("ext4".to_string());
            p.uuid = Some(uuid);
            p.used_mb = 0;
            Ok(())
        })
    }

    async fn set_filesystem_identity(
        &self,
        device: &str,
        uuid: &str,
        label: Option<&str>,
    ) -> ShrinkResult<()> {
        self.log(format!("tune2fs {device}"));
        let (volume, index) = self.partition(device)?;
        self.with(|s| {
            let p = s.partition_mut(&volume, index)?;
            p.uuid = Some(uuid.to_string());
            if let Some(label) = label {
                p.label = Some(label.to_string());
            }
            Ok(())
        })
    }

    async fn block_copy(&self, source: &str, target: &str) -> ShrinkResult<()> {
        self.log(format!("dd {source} {target}"));
        let (src_volume, src_index) = self.partition(source)?;
        let (dst_volume, dst_index) = self.partition(target)?;
        self.with(|s| {
            let copy = s.partition_mut(&src_volume, src_index)?.clone();
            let dst = s.partition_mut(&dst_volume, dst_index)?;
            if copy.size_mb > dst.size_mb {
                return Err(tool_error("dd", format!("error writing '{target}': No space left on device")));
            }
            *dst = FakePartition {
                size_mb: dst.size_mb,
                ..copy
            };
            Ok(())
        })
    }

    async fn sync_tree(&self, source: &Path, target: &Path) -> ShrinkResult<()> {
        self.log(format!("rsync {} {}", source.display(), target.display()));
        self.with(|s| {
            let (src_volume, src_index) = s.mounted(source)?;
            let (dst_volume, dst_index) = s.mounted(target)?;
            if s.fail_copy.contains(&src_volume) {
                return Err(tool_error("rsync", "rsync error: error in file IO (code 11)"));
            }
            let copy = s.partition_mut(&src_volume, src_index)?.clone();
            let dst = s.partition_mut(&dst_volume, dst_index)?;
            if copy.used_mb > dst.size_mb {
                return Err(tool_error("rsync", "No space left on device (28)"));
            }
            dst.used_mb = copy.used_mb;
            dst.payload = copy.payload;
            dst.boot_config = copy.boot_config;
            Ok(())
        })
    }

    async fn reinstall_boot_loader(
        &self,
        device: &str,
        mount_path: &Path,
        uuid: &str,
    ) -> ShrinkResult<()> {
        self.log(format!("grub2-install {device}"));
        let config = self.with(|s| {
            let (volume, index) = s.mounted(mount_path)?;
            Ok::<_, ShrinkError>(s.partition_mut(&volume, index)?.boot_config.clone())
        })?;
        let config = config.ok_or_else(|| {
            ShrinkError::BootLoader("no supported boot loader found".to_string())
        })?;

        bootloader::parse_boot_config(&config, bootloader::LOADERS[1].keywords)?;
        self.with(|s| s.reinstalls.push((device.to_string(), uuid.to_string())));
        Ok(())
    }

    async fn has_boot_directory(&self, mount_path: &Path) -> bool {
        self.with(|s| {
            s.mounted(mount_path)
                .ok()
                .and_then(|(volume, index)| s.disks.get(&volume)?.get(index).cloned())
                .is_some_and(|p| p.boot_config.is_some())
        })
    }
}

pub struct Harness {
    pub cloud: Arc<FakeCloud>,
    pub device: Arc<FakeDevice>,
    pub clock: Arc<ManualClock>,
    pub ctx: ShrinkContext,
}

impl Harness {
    pub fn new(config: ShrinkConfig) -> Self {
        let cloud = FakeCloud::new();
        let device = FakeDevice::new(cloud.clone());
        let clock = Arc::new(ManualClock::default());
        let ctx = ShrinkContext::new(
            Arc::new(config),
            cloud.clone(),
            device.clone(),
            clock.clone(),
            worker(),
        )
        .unwrap();

        Self {
            cloud,
            device,
            clock,
            ctx,
        }
    }

    /// A volume detached from `instance_id` and ready for the engine, as the
    /// instance scan leaves it.
    pub fn detached_from(
        &self,
        instance_id: &str,
        device: &str,
        volume_id: &str,
        size_gb: u64,
        layout: Vec<FakePartition>,
    ) -> super::VolumeRecord {
        let pre_shrink_state = self
            .cloud
            .instance_state(instance_id)
            .unwrap_or(InstanceState::Stopped);
        let origin = handle(volume_id, size_gb);
        self.cloud.add_volume(origin.clone());
        self.device.set_layout(volume_id, layout);
        super::VolumeRecord::attached(origin, instance_id, device, pre_shrink_state)
    }
}
