//! Replacement volume creation and partition layout.

use super::record::VolumeRecord;
use super::{ShrinkContext, Slot};
use crate::cloud::{CreateVolumeRequest, Tag};
use crate::error::ShrinkResult;
use tracing::{error, info, warn};

/// Create the replacement, attach it at the slot's second device and lay out
/// the origin's partitions on it.
///
/// On failure a half-built replacement is detached and deleted, leaving
/// `record.replacement` empty.
pub async fn provision(
    ctx: &ShrinkContext,
    record: &mut VolumeRecord,
    slot: &Slot,
    target_size_gb: u64,
) -> ShrinkResult<()> {
    let built = build(ctx, record, slot, target_size_gb).await;
    if built.is_err() {
        discard_replacement(ctx, record).await;
    }
    built
}

async fn build(
    ctx: &ShrinkContext,
    record: &mut VolumeRecord,
    slot: &Slot,
    target_size_gb: u64,
) -> ShrinkResult<()> {
    let origin = &record.origin;
    let request = CreateVolumeRequest {
        volume_type: origin.volume_type.clone(),
        size_gb: Some(target_size_gb),
        iops: origin
            .iops
            .filter(|_| ctx.config.carries_iops(&origin.volume_type)),
        availability_zone: ctx.worker.availability_zone.clone(),
        snapshot_id: None,
    };

    let ops = ctx.ops();
    let replacement = ops.create_volume(&request).await?;
    record.replacement = Some(replacement.clone());

    ctx.cloud
        .tag_resource(&replacement.id, &[Tag::new("ShrinkFrom", &record.origin.id)])
        .await?;

    ops.attach_volume(&replacement.id, &slot.replacement_device, &ctx.worker.instance_id)
        .await?;
    ctx.settle().await;

    let devices = ctx
        .device
        .create_partition_table(&slot.replacement_device, &record.partitions.extents())
        .await?;
    record.partitions.bind_replacements(devices)?;

    for partition in record.partitions.iter().filter(|p| !p.raw) {
        if let Some(device) = &partition.replacement_device {
            ctx.device.create_filesystem(device).await?;
        }
    }

    info!(
        "{} prepared for {} with {} partitions",
        replacement.id,
        record.origin.id,
        record.partitions.len()
    );
    Ok(())
}

/// Detach and delete the replacement of `record`, if any.
pub async fn discard_replacement(ctx: &ShrinkContext, record: &mut VolumeRecord) {
    let Some(replacement) = record.replacement.take() else {
        return;
    };

    let ops = ctx.ops();
    if let Err(err) = ops.detach_volume(&replacement.id).await {
        warn!("{} could not be detached: {}", replacement.id, err);
    }
    match ctx.cloud.delete_volume(&replacement.id).await {
        Ok(()) => info!("{} (replacement of {}) deleted", replacement.id, record.origin.id),
        Err(err) => {
            error!("{} could not be deleted: {}", replacement.id, err);
            record.replacement = Some(replacement);
        }
    }
}
