use super::migrator;
use super::prober::{self, ProbeVerdict};
use super::provisioner;
use super::record::VolumeRecord;
use super::recovery;
use super::{ShrinkContext, Slot};
use crate::error::{OpOutcome, ShrinkResult};
use tracing::{error, info};

/// Shrink one batch in place.
///
/// Probing and provisioning run in order on the calling task, migrations
/// run concurrently, and finalization waits for every migration to be joined.
/// Failures stay with the record they happened to. Every record is finalized
/// when this returns.
pub async fn run_batch(ctx: &ShrinkContext, records: &mut [VolumeRecord]) {
    let described: Vec<String> = records.iter().map(describe).collect();
    info!("===Begin shrinking for {:?}", described);

    let mut ready = Vec::new();
    for idx in 0..records.len() {
        let slot = match ctx.slots.slot(idx) {
            Ok(slot) => slot,
            Err(err) => {
                error!("{} has no slot: {}", records[idx].origin.id, err);
                records[idx].outcome = err.outcome();
                recovery::finalize(ctx, records, idx).await;
                continue;
            }
        };

        match prepare(ctx, &mut records[idx], &slot).await {
            Ok(true) => ready.push((idx, slot)),
            Ok(false) => recovery::finalize(ctx, records, idx).await,
            Err(err) => {
                records[idx].outcome = err.outcome();
                error!(
                    volume = %records[idx].origin.id,
                    outcome = ?err.outcome(),
                    "Exception occurred, {} failed to shrink: {}",
                    records[idx].origin.id,
                    err
                );
                recovery::finalize(ctx, records, idx).await;
            }
        }
    }

    let mut handles = Vec::with_capacity(ready.len());
    for (idx, slot) in ready {
        let unit = records[idx].clone();
        let ctx_clone = ctx.clone();
        let handle = tokio::spawn(async move { migrator::migrate(ctx_clone, unit, slot).await });
        handles.push((idx, handle));
    }

    for (idx, handle) in handles {
        match handle.await {
            Ok(record) => records[idx] = record,
            Err(err) => {
                error!("migration task for {} aborted: {}", records[idx].origin.id, err);
                records[idx].outcome = OpOutcome::ToolingFailed;
                migrator::release(ctx, &records[idx]).await;
            }
        }
    }

    for idx in 0..records.len() {
        recovery::finalize(ctx, records, idx).await;
    }
}

/// Probe and provision. `Ok(false)` means the record needs no migration.
async fn prepare(ctx: &ShrinkContext, record: &mut VolumeRecord, slot: &Slot) -> ShrinkResult<bool> {
    match prober::probe(ctx, record, slot).await? {
        ProbeVerdict::Skip { reason } => {
            info!("{} need not to shrink: {}", record.origin.id, reason);
            Ok(false)
        }
        ProbeVerdict::Shrink { target_size_gb, .. } => {
            provisioner::provision(ctx, record, slot, target_size_gb).await?;
            Ok(true)
        }
    }
}

fn describe(record: &VolumeRecord) -> String {
    match (record.owner_id(), record.device(), record.pre_shrink_state()) {
        (Some(owner), Some(device), Some(state)) => {
            format!("{} on {} {}{}", record.origin.id, state, owner, device)
        }
        _ => format!("{} on snapshot", record.origin.id),
    }
}
