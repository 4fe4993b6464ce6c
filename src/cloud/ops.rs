//! Waiting wrappers around the raw cloud calls.

use super::{
    AttachmentState, CloudVolumeService, CreateVolumeRequest, InstanceHealth, InstanceState,
    VolumeHandle, VolumeState,
};
use crate::error::{ShrinkError, ShrinkResult};
use crate::retry::{Clock, RetryPolicy, poll_until};
use tracing::{info, warn};

pub struct CloudOps<'a> {
    cloud: &'a dyn CloudVolumeService,
    clock: &'a dyn Clock,
    volume_poll: RetryPolicy,
    instance_poll: RetryPolicy,
}

impl<'a> CloudOps<'a> {
    pub fn new(
        cloud: &'a dyn CloudVolumeService,
        clock: &'a dyn Clock,
        volume_poll: RetryPolicy,
        instance_poll: RetryPolicy,
    ) -> Self {
        Self {
            cloud,
            clock,
            volume_poll,
            instance_poll,
        }
    }

    /// Create a volume and wait until it is available.
    ///
    /// On timeout the half-created volume is deleted before the error is returned.
    pub async fn create_volume(&self, request: &CreateVolumeRequest) -> ShrinkResult<VolumeHandle> {
        let volume = self.cloud.create_volume(request).await?;
        if let Err(err) = self.wait_volume_available(&volume.id).await {
            if let Err(cleanup) = self.cloud.delete_volume(&volume.id).await {
                warn!("{} left behind after failed creation: {}", volume.id, cleanup);
            }
            return Err(err);
        }
        info!(
            volume = %volume.id,
            size_gb = volume.size_gb,
            volume_type = %volume.volume_type,
            "{} created",
            volume.id
        );
        Ok(volume)
    }

    pub async fn wait_volume_available(&self, volume_id: &str) -> ShrinkResult<()> {
        poll_until(self.clock, self.volume_poll, "create", volume_id, || async {
            let status = self.cloud.describe_volume_state(volume_id).await?;
            match status.state {
                VolumeState::Available => Ok(Some(())),
                VolumeState::Error => Err(ShrinkError::cloud(
                    "create-volume",
                    format!("{volume_id} entered error state"),
                )),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Detach a volume if it is in use and wait until it is available again.
    pub async fn detach_volume(&self, volume_id: &str) -> ShrinkResult<()> {
        let status = self.cloud.describe_volume_state(volume_id).await?;
        if status.state == VolumeState::InUse {
            self.cloud.detach_volume(volume_id).await?;
        }

        poll_until(self.clock, self.volume_poll, "detach", volume_id, || async {
            let status = self.cloud.describe_volume_state(volume_id).await?;
            Ok((status.state == VolumeState::Available).then_some(()))
        })
        .await
    }

    /// Attach a volume at `device`, detaching it from wherever it is first.
    pub async fn attach_volume(
        &self,
        volume_id: &str,
        device: &str,
        instance_id: &str,
    ) -> ShrinkResult<()> {
        if let Err(err) = self.detach_volume(volume_id).await {
            warn!("{} could not be released before attaching: {}", volume_id, err);
        }

        self.cloud
            .attach_volume(volume_id, device, instance_id)
            .await?;

        poll_until(self.clock, self.volume_poll, "attach", volume_id, || async {
            let status = self.cloud.describe_volume_state(volume_id).await?;
            Ok((status.attachment == Some(AttachmentState::Attached)).then_some(()))
        })
        .await?;

        info!("{} attached to {}{}", volume_id, instance_id, device);
        Ok(())
    }

    /// Stop an instance and wait until it reports `stopped`.
    pub async fn stop_instance(&self, instance_id: &str) -> ShrinkResult<()> {
        self.cloud.stop_instance(instance_id).await?;
        poll_until(self.clock, self.instance_poll, "stop", instance_id, || async {
            let status = self.cloud.describe_instance_status(instance_id).await?;
            Ok((status.state == InstanceState::Stopped).then_some(()))
        })
        .await?;
        info!("{} stopped", instance_id);
        Ok(())
    }

    /// Start an instance. With `verify`, wait for it to run and pass its
    /// status checks; an impaired status fails immediately.
    pub async fn start_instance(&self, instance_id: &str, verify: bool) -> ShrinkResult<()> {
        self.cloud.start_instance(instance_id).await?;
        info!("{} starting...", instance_id);
        if !verify {
            return Ok(());
        }

        poll_until(self.clock, self.instance_poll, "start", instance_id, || async {
            let status = self.cloud.describe_instance_status(instance_id).await?;
            Ok((status.state == InstanceState::Running).then_some(()))
        })
        .await?;

        poll_until(self.clock, self.instance_poll, "status check", instance_id, || async {
            let status = self.cloud.describe_instance_status(instance_id).await?;
            match status.health {
                InstanceHealth::Ok => Ok(Some(())),
                InstanceHealth::Impaired => Err(ShrinkError::cloud(
                    "describe-instance-status",
                    format!("{instance_id} reports impaired status"),
                )),
                _ => Ok(None),
            }
        })
        .await?;

        info!("{} started", instance_id);
        Ok(())
    }

    pub async fn wait_image_available(&self, image_id: &str) -> ShrinkResult<()> {
        poll_until(self.clock, self.instance_poll, "image creation", image_id, || async {
            let images = self
                .cloud
                .list_images(&[super::Filter::new("image-id", &[image_id])])
                .await?;
            Ok(images
                .iter()
                .any(|image| image.state == "available")
                .then_some(()))
        })
        .await
    }

    pub fn cloud(&self) -> &'a dyn CloudVolumeService {
        self.cloud
    }
}
