//! `aws ec2` command line adapter.
//!
//! Every call runs `aws ec2 <operation> --region <region> --output json` and
//! decodes the JSON reply.

use super::{
    AttachmentState, CloudVolumeService, CreateVolumeRequest, Filter, ImageInfo, InstanceHandle,
    InstanceHealth, InstanceState, InstanceStatus, LaunchRequest, SnapshotInfo, Tag,
    VolumeAttachment, VolumeHandle, VolumeInfo, VolumeState, VolumeStatus,
};
use crate::args;
use crate::error::{ShrinkError, ShrinkResult};
use crate::execution::CommandExecutor;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub struct AwsCli {
    executor: CommandExecutor,
    region: String,
}

impl AwsCli {
    pub fn new(executor: CommandExecutor, region: impl Into<String>) -> Self {
        Self {
            executor,
            region: region.into(),
        }
    }

    async fn invoke(&self, operation: &str, args: Vec<String>) -> ShrinkResult<String> {
        let mut full = args!["ec2", operation];
        full.extend(args);
        full.extend(args!["--region", self.region, "--output", "json"]);

        match self.executor.run("aws", &full).await {
            Ok(output) => Ok(output.stdout),
            Err(ShrinkError::Tooling { status, stderr, .. }) => Err(ShrinkError::cloud(
                operation,
                format!("{} ({})", stderr, status),
            )),
            Err(err) => Err(err),
        }
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, args: Vec<String>) -> ShrinkResult<T> {
        let stdout = self.invoke(operation, args).await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    fn filter_args(filters: &[Filter]) -> Vec<String> {
        if filters.is_empty() {
            return Vec::new();
        }
        let mut args = args!["--filters"];
        args.extend(filters.iter().map(Filter::to_arg));
        args
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApiTag<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiVolume {
    volume_id: String,
    size: u64,
    volume_type: String,
    #[serde(default)]
    iops: Option<u32>,
    availability_zone: String,
    #[serde(default)]
    snapshot_id: Option<String>,
    state: String,
    #[serde(default)]
    attachments: Vec<ApiAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiAttachment {
    instance_id: String,
    device: String,
    state: String,
}

impl From<ApiVolume> for VolumeInfo {
    fn from(volume: ApiVolume) -> Self {
        let attachment = volume
            .attachments
            .into_iter()
            .next()
            .map(|a| VolumeAttachment {
                instance_id: a.instance_id,
                device: a.device,
                state: AttachmentState::from_api(&a.state),
            });

        VolumeInfo {
            handle: VolumeHandle {
                id: volume.volume_id,
                size_gb: volume.size,
                volume_type: volume.volume_type,
                iops: volume.iops,
                availability_zone: volume.availability_zone,
                snapshot_id: volume.snapshot_id.filter(|s| !s.is_empty()),
            },
            state: VolumeState::from_api(&volume.state),
            attachment,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumes {
    volumes: Vec<ApiVolume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiInstance {
    instance_id: String,
    placement: ApiPlacement,
    state: ApiStateName,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiPlacement {
    availability_zone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiStateName {
    name: String,
}

impl From<ApiInstance> for InstanceHandle {
    fn from(instance: ApiInstance) -> Self {
        InstanceHandle {
            id: instance.instance_id,
            availability_zone: instance.placement.availability_zone,
            state: InstanceState::from_api(&instance.state.name),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    instances: Vec<ApiInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstanceStatus {
    instance_statuses: Vec<ApiInstanceStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiInstanceStatus {
    instance_state: ApiStateName,
    instance_status: ApiStatusSummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiStatusSummary {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSnapshots {
    snapshots: Vec<ApiSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiSnapshot {
    snapshot_id: String,
    volume_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImages {
    images: Vec<ApiImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiImage {
    image_id: String,
    #[serde(default)]
    name: Option<String>,
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateImage {
    image_id: String,
}

#[async_trait]
impl CloudVolumeService for AwsCli {
    async fn create_volume(&self, request: &CreateVolumeRequest) -> ShrinkResult<VolumeHandle> {
        let mut args = args![
            "--volume-type",
            request.volume_type,
            "--availability-zone",
            request.availability_zone
        ];
        if let Some(size) = request.size_gb {
            args.extend(args!["--size", size]);
        }
        if let Some(iops) = request.iops {
            args.extend(args!["--iops", iops]);
        }
        if let Some(snapshot) = &request.snapshot_id {
            args.extend(args!["--snapshot-id", snapshot]);
        }

        let volume: ApiVolume = self.call("create-volume", args).await?;
        Ok(VolumeInfo::from(volume).handle)
    }

    async fn delete_volume(&self, volume_id: &str) -> ShrinkResult<()> {
        self.invoke("delete-volume", args!["--volume-id", volume_id])
            .await
            .map(drop)
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        device: &str,
        instance_id: &str,
    ) -> ShrinkResult<()> {
        self.invoke(
            "attach-volume",
            args![
                "--volume-id",
                volume_id,
                "--instance-id",
                instance_id,
                "--device",
                device
            ],
        )
        .await
        .map(drop)
    }

    async fn detach_volume(&self, volume_id: &str) -> ShrinkResult<()> {
        self.invoke("detach-volume", args!["--volume-id", volume_id])
            .await
            .map(drop)
    }

    async fn tag_resource(&self, resource_id: &str, tags: &[Tag]) -> ShrinkResult<()> {
        // JSON form, tag values such as UPWT contain commas
        let api_tags: Vec<ApiTag> = tags
            .iter()
            .map(|t| ApiTag {
                key: &t.key,
                value: &t.value,
            })
            .collect();
        let tags_json = serde_json::to_string(&api_tags)?;

        self.invoke(
            "create-tags",
            args!["--resources", resource_id, "--tags", tags_json],
        )
        .await
        .map(drop)
    }

    async fn describe_volume_state(&self, volume_id: &str) -> ShrinkResult<VolumeStatus> {
        let reply: DescribeVolumes = self
            .call("describe-volumes", args!["--volume-ids", volume_id])
            .await?;
        let info = reply
            .volumes
            .into_iter()
            .next()
            .map(VolumeInfo::from)
            .ok_or_else(|| ShrinkError::cloud("describe-volumes", format!("{volume_id} not found")))?;

        Ok(VolumeStatus {
            state: info.state,
            attachment: info.attachment.map(|a| a.state),
        })
    }

    async fn create_instance(&self, request: &LaunchRequest) -> ShrinkResult<InstanceHandle> {
        let mut args = args![
            "--image-id",
            request.image_id,
            "--instance-type",
            request.instance_type,
            "--count",
            1,
            "--placement",
            format!("AvailabilityZone={}", request.availability_zone)
        ];
        if let Some(user_data) = &request.user_data {
            args.extend(args!["--user-data", user_data]);
        }
        if let Some(arn) = &request.iam_instance_profile_arn {
            args.extend(args!["--iam-instance-profile", format!("Arn={arn}")]);
        }
        if request.terminate_on_shutdown {
            args.extend(args![
                "--instance-initiated-shutdown-behavior",
                "terminate",
                "--ebs-optimized"
            ]);
        }

        let reply: Reservation = self.call("run-instances", args).await?;
        reply
            .instances
            .into_iter()
            .next()
            .map(InstanceHandle::from)
            .ok_or_else(|| ShrinkError::cloud("run-instances", "no instance returned"))
    }

    async fn start_instance(&self, instance_id: &str) -> ShrinkResult<()> {
        self.invoke("start-instances", args!["--instance-ids", instance_id])
            .await
            .map(drop)
    }

    async fn stop_instance(&self, instance_id: &str) -> ShrinkResult<()> {
        self.invoke("stop-instances", args!["--instance-ids", instance_id])
            .await
            .map(drop)
    }

    async fn terminate_instance(&self, instance_id: &str) -> ShrinkResult<()> {
        self.invoke("terminate-instances", args!["--instance-ids", instance_id])
            .await
            .map(drop)
    }

    async fn describe_instance_status(&self, instance_id: &str) -> ShrinkResult<InstanceStatus> {
        let reply: DescribeInstanceStatus = self
            .call(
                "describe-instance-status",
                args!["--instance-ids", instance_id, "--include-all-instances"],
            )
            .await?;
        let status = reply.instance_statuses.into_iter().next().ok_or_else(|| {
            ShrinkError::cloud("describe-instance-status", format!("{instance_id} not found"))
        })?;

        Ok(InstanceStatus {
            state: InstanceState::from_api(&status.instance_state.name),
            health: InstanceHealth::from_api(&status.instance_status.status),
        })
    }

    async fn list_volumes(&self, filters: &[Filter]) -> ShrinkResult<Vec<VolumeInfo>> {
        let reply: DescribeVolumes = self
            .call("describe-volumes", Self::filter_args(filters))
            .await?;
        Ok(reply.volumes.into_iter().map(VolumeInfo::from).collect())
    }

    async fn list_instances(&self, filters: &[Filter]) -> ShrinkResult<Vec<InstanceHandle>> {
        let reply: DescribeInstances = self
            .call("describe-instances", Self::filter_args(filters))
            .await?;
        Ok(reply
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(InstanceHandle::from)
            .collect())
    }

    async fn list_snapshots(&self, filters: &[Filter]) -> ShrinkResult<Vec<SnapshotInfo>> {
        let mut args = args!["--owner-ids", "self"];
        args.extend(Self::filter_args(filters));
        let reply: DescribeSnapshots = self.call("describe-snapshots", args).await?;
        Ok(reply
            .snapshots
            .into_iter()
            .map(|s| SnapshotInfo {
                id: s.snapshot_id,
                volume_size_gb: s.volume_size,
            })
            .collect())
    }

    async fn list_images(&self, filters: &[Filter]) -> ShrinkResult<Vec<ImageInfo>> {
        let mut args = args!["--owners", "self"];
        args.extend(Self::filter_args(filters));
        let reply: DescribeImages = self.call("describe-images", args).await?;
        Ok(reply
            .images
            .into_iter()
            .map(|i| ImageInfo {
                id: i.image_id,
                name: i.name,
                state: i.state,
            })
            .collect())
    }

    async fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        description: &str,
    ) -> ShrinkResult<String> {
        let reply: CreateImage = self
            .call(
                "create-image",
                args![
                    "--instance-id",
                    instance_id,
                    "--name",
                    name,
                    "--description",
                    description,
                    "--no-reboot"
                ],
            )
            .await?;
        Ok(reply.image_id)
    }
}
