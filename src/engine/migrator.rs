//! Data migration from origin to replacement, one task per volume.

use super::record::{Partition, VolumeRecord, Winner};
use super::{ShrinkContext, Slot};
use crate::error::{OpOutcome, ShrinkError, ShrinkResult};
use tracing::{error, info, warn};

/// Copy every partition in order. The first failure aborts the volume and
/// leaves its result undecided. Both volumes are detached from the worker
/// afterwards whatever happened.
pub async fn migrate(ctx: ShrinkContext, mut record: VolumeRecord, slot: Slot) -> VolumeRecord {
    let copied = copy_partitions(&ctx, &record, &slot).await;
    release(&ctx, &record).await;
    record.outcome = OpOutcome::of(&copied);

    match copied {
        Ok(()) => {
            record.decide(Winner::Replacement);
            info!("{} migrated to {}", record.origin.id, replacement_id(&record));
        }
        Err(err) => error!(
            volume = %record.origin.id,
            outcome = ?err.outcome(),
            "{} failed to shrink: {}",
            record.origin.id,
            err
        ),
    }
    record
}

async fn copy_partitions(ctx: &ShrinkContext, record: &VolumeRecord, slot: &Slot) -> ShrinkResult<()> {
    let boot_candidate = ctx.config.boot_device.applies_to(record.device());

    for partition in &record.partitions {
        let target = partition.replacement_device.as_deref().ok_or_else(|| {
            ShrinkError::Parse(format!("{} has no replacement partition", partition.source_device))
        })?;

        if partition.raw {
            ctx.device.block_copy(&partition.source_device, target).await?;
            continue;
        }

        copy_tree(ctx, partition, target, slot, boot_candidate).await?;

        match &partition.filesystem_id {
            Some(uuid) => {
                ctx.device
                    .set_filesystem_identity(target, uuid, partition.label.as_deref())
                    .await?
            }
            None => warn!("{} has no filesystem UUID to carry over", partition.source_device),
        }
    }
    Ok(())
}

/// File level copy of one partition. Both mounts are released before this
/// returns.
async fn copy_tree(
    ctx: &ShrinkContext,
    partition: &Partition,
    target: &str,
    slot: &Slot,
    boot_candidate: bool,
) -> ShrinkResult<()> {
    let device = &ctx.device;
    device.mount(&partition.source_device, &slot.origin_mount).await?;
    if let Err(err) = device.mount(target, &slot.replacement_mount).await {
        if let Err(unmount_err) = device.unmount(&slot.origin_mount).await {
            warn!("{} could not be unmounted: {}", slot.origin_mount.display(), unmount_err);
        }
        return Err(err);
    }

    let synced = device
        .sync_tree(&slot.origin_mount, &slot.replacement_mount)
        .await;
    let source_released = device.unmount(&slot.origin_mount).await;

    let boot = if synced.is_ok()
        && source_released.is_ok()
        && boot_candidate
        && device.has_boot_directory(&slot.replacement_mount).await
    {
        match &partition.filesystem_id {
            Some(uuid) => {
                device
                    .reinstall_boot_loader(&slot.replacement_device, &slot.replacement_mount, uuid)
                    .await
            }
            None => Err(ShrinkError::BootLoader(format!(
                "{} has no filesystem UUID",
                partition.source_device
            ))),
        }
    } else {
        Ok(())
    };

    let target_released = device.unmount(&slot.replacement_mount).await;

    synced?;
    source_released?;
    boot?;
    target_released
}

/// Detach origin and replacement from the worker, logging failures.
pub async fn release(ctx: &ShrinkContext, record: &VolumeRecord) {
    let ops = ctx.ops();
    let volumes = std::iter::once(&record.origin).chain(record.replacement.as_ref());
    for volume in volumes {
        if let Err(err) = ops.detach_volume(&volume.id).await {
            warn!("{} could not be detached from the worker: {}", volume.id, err);
        }
    }
    info!(
        "{}(origin) and {}(replacement) detached from the worker",
        record.origin.id,
        replacement_id(record)
    );
}

fn replacement_id(record: &VolumeRecord) -> &str {
    record
        .replacement
        .as_ref()
        .map(|r| r.id.as_str())
        .unwrap_or("-")
}
