//! Fan instances out to ephemeral worker instances.
//!
//! Each worker boots from an image of this host, shrinks the volumes of a
//! single instance in that instance's availability zone and terminates
//! itself on shutdown.

use super::{OmitTarget, PROJECT_TAG, SCANNED_STATES, ScanOptions};
use crate::cloud::{Filter, InstanceHandle, LaunchRequest, Tag};
use crate::engine::ShrinkContext;
use anyhow::{Context, Result};
use tracing::{error, info, warn};

/// Shell script a worker runs at boot.
pub fn worker_user_data(command: &str, omit_boot: bool, instance_id: &str) -> String {
    let omit = if omit_boot { " -o b" } else { "" };
    format!("#!/bin/bash\n{command} -o a -o s{omit} instance-id={instance_id}\nsudo shutdown\n")
}

/// Launch one worker per matching instance. Returns how many were started.
pub async fn dispatch(ctx: &ShrinkContext, options: &ScanOptions) -> Result<usize> {
    info!("===Shrink Master Node is starting to dispatch task to worker node===");
    let image_id = worker_image(ctx).await?;

    let mut filters = vec![Filter::new("instance-state-name", SCANNED_STATES)];
    filters.extend(options.filters.iter().cloned());
    let instances = ctx
        .cloud
        .list_instances(&filters)
        .await
        .context("listing instances")?;

    if ctx.worker.iam_instance_profile_arn.is_none() {
        warn!("{} has no instance profile, workers start without one", ctx.worker.instance_id);
    }

    let mut started = 0;
    for instance in instances.iter().filter(|i| i.id != ctx.worker.instance_id) {
        match launch_worker(ctx, options, &image_id, instance).await {
            Ok(worker) => {
                started += 1;
                info!(
                    "{}(worker) is starting to shrink volumes of {}(target)",
                    worker, instance.id
                );
            }
            Err(err) => error!("no worker for {}: {:#}", instance.id, err),
        }
    }

    info!("==={} ShrinkWorker is starting... Master Node terminated normally===", started);
    Ok(started)
}

/// Find the worker image by name, or create it from this host.
async fn worker_image(ctx: &ShrinkContext) -> Result<String> {
    let name = &ctx.config.worker_image_name;
    let images = ctx
        .cloud
        .list_images(&[Filter::new("name", &[name.as_str()])])
        .await
        .context("looking up the worker image")?;

    let image_id = match images.into_iter().next() {
        Some(image) => {
            info!("{} found for worker nodes", image.id);
            image.id
        }
        None => {
            let id = ctx
                .cloud
                .create_image(&ctx.worker.instance_id, name, "VolumeShrink tools")
                .await
                .context("creating the worker image")?;
            info!("Creating {} for worker nodes", id);
            id
        }
    };

    ctx.ops()
        .wait_image_available(&image_id)
        .await
        .with_context(|| format!("{} never became available", image_id))?;
    Ok(image_id)
}

async fn launch_worker(
    ctx: &ShrinkContext,
    options: &ScanOptions,
    image_id: &str,
    target: &InstanceHandle,
) -> Result<String> {
    let request = LaunchRequest {
        image_id: image_id.to_string(),
        instance_type: ctx.config.worker_instance_type.clone(),
        availability_zone: target.availability_zone.clone(),
        user_data: Some(worker_user_data(
            &ctx.config.worker_command,
            options.omits(OmitTarget::BootVolumes),
            &target.id,
        )),
        iam_instance_profile_arn: ctx.worker.iam_instance_profile_arn.clone(),
        terminate_on_shutdown: true,
    };
    let worker = ctx.cloud.create_instance(&request).await?;

    ctx.cloud
        .tag_resource(
            &worker.id,
            &[
                Tag::new("Name", "ShrinkWorker"),
                Tag::new(PROJECT_TAG.0, PROJECT_TAG.1),
                Tag::new("ShrinkingFor", &target.id),
            ],
        )
        .await?;
    ctx.cloud
        .tag_resource(&target.id, &[Tag::new("ShrinkingBy", &worker.id)])
        .await?;
    Ok(worker.id)
}
