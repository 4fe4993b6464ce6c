//! Capacity probing: how big does the replacement have to be?

use super::record::{Partition, PartitionTable, VolumeRecord};
use super::{ShrinkContext, Slot};
use crate::device::PARTITION_TABLE_OVERHEAD_MB;
use crate::error::ShrinkResult;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeVerdict {
    Shrink { target_size_gb: u64, usage_ratio: f64 },
    Skip { reason: String },
}

/// Attach the origin to the worker, measure every partition and decide
/// whether shrinking is worth it. Fills in `record.partitions`.
pub async fn probe(
    ctx: &ShrinkContext,
    record: &mut VolumeRecord,
    slot: &Slot,
) -> ShrinkResult<ProbeVerdict> {
    let ops = ctx.ops();
    ops.attach_volume(&record.origin.id, &slot.origin_device, &ctx.worker.instance_id)
        .await?;
    ctx.settle().await;

    let entries = ctx.device.list_partitions(&slot.origin_device).await?;
    if entries.is_empty() {
        return Ok(ProbeVerdict::Skip {
            reason: "no partitions found".to_string(),
        });
    }

    let mut partitions = Vec::with_capacity(entries.len());
    for entry in entries {
        let identity = ctx.device.read_filesystem_id(&entry.device).await?;
        let raw = identity.is_raw();

        let size_estimate_mb = if raw {
            debug!("{} has no mountable filesystem, copying raw", entry.device);
            entry.size_mb
        } else {
            let used_mb = measure(ctx, &entry.device, slot).await?;
            estimate_mb(used_mb, ctx.config.expansion_factor)
        };

        partitions.push(Partition {
            source_device: entry.device,
            replacement_device: None,
            filesystem_id: identity.uuid,
            label: identity.label,
            size_estimate_mb,
            raw,
        });
    }
    record.partitions = PartitionTable::new(partitions);

    let total_mb = record.partitions.total_estimate_mb();
    let usage_ratio = total_mb as f64 / 1024.0 / record.origin.size_gb as f64;
    if ctx.config.should_skip(usage_ratio) {
        return Ok(ProbeVerdict::Skip {
            reason: format!("high usage ({:.0}%)", usage_ratio * 100.0),
        });
    }

    let target_size_gb = target_size_gb(
        total_mb,
        ctx.config.min_volume_size_gb,
        ctx.config.size_ceiling(&record.origin.volume_type),
    );
    info!(
        volume = %record.origin.id,
        "{} uses {:.0}%, shrinking {}GB to {}GB",
        record.origin.id,
        usage_ratio * 100.0,
        record.origin.size_gb,
        target_size_gb
    );
    Ok(ProbeVerdict::Shrink {
        target_size_gb,
        usage_ratio,
    })
}

async fn measure(ctx: &ShrinkContext, device: &str, slot: &Slot) -> ShrinkResult<u64> {
    ctx.device.mount(device, &slot.origin_mount).await?;
    let used = ctx.device.measure_used_mb(&slot.origin_mount).await;
    let released = ctx.device.unmount(&slot.origin_mount).await;
    let used = used?;
    released?;
    Ok(used)
}

/// Used space scaled by the expansion factor, plus one megabyte.
pub fn estimate_mb(used_mb: u64, expansion_factor: f64) -> u64 {
    (used_mb as f64 * expansion_factor).ceil() as u64 + 1
}

/// Whole gigabytes holding `total_mb` of partitions plus the partition table,
/// at least `min_gb` and at most `ceiling_gb`.
pub fn target_size_gb(total_mb: u64, min_gb: u64, ceiling_gb: Option<u64>) -> u64 {
    let size = (total_mb + PARTITION_TABLE_OVERHEAD_MB)
        .div_ceil(1024)
        .max(min_gb);
    match ceiling_gb {
        Some(ceiling) => size.min(ceiling),
        None => size,
    }
}
