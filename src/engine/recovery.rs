//! Finalization: put the winning volume in place and bring owners back up.

use super::provisioner::discard_replacement;
use super::record::{Ownership, VolumeRecord, Winner};
use super::ShrinkContext;
use crate::cloud::Tag;
use tracing::{debug, error, info, warn};

/// Finalize `records[idx]`.
///
/// An undecided record keeps its origin. Snapshot records keep exactly one
/// volume. Attached records go back to their owner, and the owner is started
/// once all of its records in the batch are finalized, rolling back to the
/// origins if it does not come up healthy on the replacements.
pub async fn finalize(ctx: &ShrinkContext, records: &mut [VolumeRecord], idx: usize) {
    let record = &mut records[idx];
    if record.finalized {
        debug!("{} already finalized", record.origin.id);
        return;
    }
    if record.result().is_none() {
        record.decide(Winner::Origin);
    }

    let Ownership::Attached {
        instance_id,
        device,
        pre_shrink_state,
    } = record.ownership.clone()
    else {
        finalize_detached(ctx, record).await;
        return;
    };

    reattach(ctx, record, &instance_id, &device).await;
    if record.winner() == Winner::Origin {
        discard_replacement(ctx, record).await;
    }
    record.finalized = true;

    if !pre_shrink_state.is_active() {
        info!("{} was {} before shrinking, leaving it stopped", instance_id, pre_shrink_state);
        return;
    }

    let pending = records
        .iter()
        .any(|r| r.owner_id() == Some(instance_id.as_str()) && !r.finalized);
    if pending {
        return;
    }

    settle_owner(ctx, records, &instance_id).await;
}

async fn finalize_detached(ctx: &ShrinkContext, record: &mut VolumeRecord) {
    let snapshot = record.origin.snapshot_id.clone().unwrap_or_default();
    let ops = ctx.ops();

    if record.winner() == Winner::Replacement {
        let origin = &record.origin.id;
        if let Err(err) = ops.detach_volume(origin).await {
            warn!("{} could not be detached: {}", origin, err);
        }
        match ctx.cloud.delete_volume(origin).await {
            Ok(()) => info!(
                "[SUCCESS]{} for {}(Snapshot), {} deleted",
                record.winning_volume().id,
                snapshot,
                origin
            ),
            Err(err) => error!("{} could not be deleted: {}", origin, err),
        }
    } else {
        info!("[FAILED]{} for {}(Snapshot)", record.origin.id, snapshot);
        discard_replacement(ctx, record).await;
        if let Err(err) = ops.detach_volume(&record.origin.id).await {
            warn!("{} could not be detached: {}", record.origin.id, err);
        }
    }

    record.finalized = true;
}

/// Attach the winner at the owner's device. A replacement that cannot be
/// attached is swapped for the origin.
async fn reattach(ctx: &ShrinkContext, record: &mut VolumeRecord, instance_id: &str, device: &str) {
    let ops = ctx.ops();
    let winner = record.winning_volume().id.clone();

    let Err(err) = ops.attach_volume(&winner, device, instance_id).await else {
        return;
    };
    error!("{} could not be attached to {}{}: {}", winner, instance_id, device, err);

    if record.winner() == Winner::Replacement {
        if let Err(err) = ops.detach_volume(&winner).await {
            warn!("{} could not be detached: {}", winner, err);
        }
        match ops.attach_volume(&record.origin.id, device, instance_id).await {
            Ok(()) => {
                record.rolled_back = true;
                mark_rolled_back(ctx, &winner).await;
            }
            Err(err) => error!(
                "FATAL: {} has neither {} nor {} at {}: {}",
                instance_id, winner, record.origin.id, device, err
            ),
        }
    }
}

/// Start an owner whose records are all finalized.
async fn settle_owner(ctx: &ShrinkContext, records: &mut [VolumeRecord], instance_id: &str) {
    let changed = records
        .iter()
        .any(|r| r.owner_id() == Some(instance_id) && r.is_shrunk());

    let ops = ctx.ops();
    match ops.start_instance(instance_id, changed).await {
        Ok(()) => {}
        Err(err) if !changed => error!("{} failed to start: {}", instance_id, err),
        Err(err) => {
            warn!("{} failed to start on shrunk volumes: {}", instance_id, err);
            rollback(ctx, records, instance_id).await;
        }
    }
}

/// Put every origin of `instance_id` back and start it unverified.
async fn rollback(ctx: &ShrinkContext, records: &mut [VolumeRecord], instance_id: &str) {
    let ops = ctx.ops();
    if let Err(err) = ops.stop_instance(instance_id).await {
        error!("{} could not be stopped for rollback: {}", instance_id, err);
    }

    for record in records
        .iter_mut()
        .filter(|r| r.owner_id() == Some(instance_id) && r.is_shrunk())
    {
        let (Some(replacement), Some(device)) = (record.replacement.clone(), record.device()) else {
            continue;
        };
        let device = device.to_string();

        if let Err(err) = ops.detach_volume(&replacement.id).await {
            error!("{} could not be detached: {}", replacement.id, err);
        }
        if let Err(err) = ops.attach_volume(&record.origin.id, &device, instance_id).await {
            error!("{} could not be reattached: {}", record.origin.id, err);
            continue;
        }
        mark_rolled_back(ctx, &replacement.id).await;
        record.rolled_back = true;
        info!("{} rolled back to {} on {}{}", replacement.id, record.origin.id, instance_id, device);
    }

    match ops.start_instance(instance_id, false).await {
        Ok(()) => info!("{} restarted on its original volumes", instance_id),
        Err(err) => error!("FATAL: {} could not be started after rollback: {}", instance_id, err),
    }
}

/// Tag a replacement that is kept but no longer in use.
async fn mark_rolled_back(ctx: &ShrinkContext, replacement_id: &str) {
    if let Err(err) = ctx
        .cloud
        .tag_resource(replacement_id, &[Tag::new("ShrinkRolledBack", "true")])
        .await
    {
        warn!("{} could not be tagged: {}", replacement_id, err);
    }
}
