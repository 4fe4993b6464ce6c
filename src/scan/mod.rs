//! Candidate discovery.
//!
//! Volumes are found on machine images (through a temporary instance), on
//! instances in the worker's availability zone and on snapshots (through a
//! temporary volume). Every candidate ends up in the [`BatchScheduler`],
//! which shrinks them a batch at a time.

pub mod master;

use crate::cloud::{
    CreateVolumeRequest, Filter, ImageInfo, InstanceHandle, InstanceState, LaunchRequest, Tag,
    VolumeHandle,
};
use crate::config::ShrinkConfig;
use crate::engine::{BatchScheduler, RunReport, ShrinkContext, VolumeRecord};
use crate::error::ShrinkResult;
use crate::retry::poll_until;
use anyhow::{Context, Result};
use colored::*;
use dialoguer::Confirm;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, error, info, warn};

pub const PROJECT_TAG: (&str, &str) = ("Project", "ShrinkVolume");

/// Instance states a scan considers.
pub const SCANNED_STATES: &[&str] = &["pending", "running", "shutting-down", "stopping", "stopped"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum OmitTarget {
    /// Machine images
    #[value(name = "a")]
    Images,
    /// Instances
    #[value(name = "e")]
    Instances,
    /// Snapshots
    #[value(name = "s")]
    Snapshots,
    /// System volumes of instances
    #[value(name = "b")]
    BootVolumes,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub filters: Vec<Filter>,
    pub omit: BTreeSet<OmitTarget>,
    pub interactive: bool,
}

impl ScanOptions {
    pub fn omits(&self, target: OmitTarget) -> bool {
        self.omit.contains(&target)
    }
}

/// Why a discovered volume is or is not shrunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    TooSmall,
    SystemVolume,
    BelowTypeFloor,
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Eligibility::Eligible => "eligible",
            Eligibility::TooSmall => "too small",
            Eligibility::SystemVolume => "system volume omitted",
            Eligibility::BelowTypeFloor => "below minimum size of its type",
        };
        f.write_str(text)
    }
}

pub fn eligibility(
    config: &ShrinkConfig,
    omit_boot: bool,
    volume: &VolumeHandle,
    device: Option<&str>,
) -> Eligibility {
    if volume.size_gb < config.min_volume_size_gb {
        return Eligibility::TooSmall;
    }
    if omit_boot && device.is_some_and(|d| config.boot_device.names_system_device(d)) {
        return Eligibility::SystemVolume;
    }
    if config
        .scan_floor(&volume.volume_type)
        .is_some_and(|floor| volume.size_gb < floor)
    {
        return Eligibility::BelowTypeFloor;
    }
    Eligibility::Eligible
}

/// A volume attached to a scanned instance.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub volume: VolumeHandle,
    pub owner: InstanceHandle,
    pub device: String,
    pub eligibility: Eligibility,
}

impl Candidate {
    /// Tag recording where the volume came from, so it can be put back by hand.
    pub fn layout_tag(&self) -> Tag {
        let iops = self
            .volume
            .iops
            .map(|iops| iops.to_string())
            .unwrap_or_else(|| "None".to_string());
        Tag::new(
            "UPWT",
            format!(
                "{},{}Gib,{},IOPS:{}",
                self.owner.id, self.volume.size_gb, self.volume.volume_type, iops
            ),
        )
    }

    pub fn into_record(self) -> VolumeRecord {
        VolumeRecord::attached(self.volume, self.owner.id, self.device, self.owner.state)
    }
}

/// Volumes attached to `instance`, ordered by device.
pub async fn instance_volumes(
    ctx: &ShrinkContext,
    omit_boot: bool,
    instance: &InstanceHandle,
) -> ShrinkResult<Vec<Candidate>> {
    let volumes = ctx
        .cloud
        .list_volumes(&[Filter::new("attachment.instance-id", &[instance.id.as_str()])])
        .await?;

    let mut candidates: Vec<Candidate> = volumes
        .into_iter()
        .filter_map(|info| {
            let attachment = info.attachment.filter(|a| a.instance_id == instance.id)?;
            let eligibility =
                eligibility(&ctx.config, omit_boot, &info.handle, Some(&attachment.device));
            Some(Candidate {
                volume: info.handle,
                owner: instance.clone(),
                device: attachment.device,
                eligibility,
            })
        })
        .collect();
    candidates.sort_by(|a, b| a.device.cmp(&b.device));
    Ok(candidates)
}

/// One line of a dry-run plan.
#[derive(Debug, Clone)]
pub enum PlanEntry {
    Image(ImageInfo),
    Volume(Candidate),
    Snapshot {
        snapshot_id: String,
        size_gb: u64,
        eligibility: Eligibility,
    },
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanEntry::Image(image) => write!(
                f,
                "image {} ({}): volumes known after launching a temporary instance",
                image.id,
                image.name.as_deref().unwrap_or("-")
            ),
            PlanEntry::Volume(c) => write!(
                f,
                "{} {}GB {} on {} {}{}: {}",
                c.volume.id,
                c.volume.size_gb,
                c.volume.volume_type,
                c.owner.state,
                c.owner.id,
                c.device,
                c.eligibility
            ),
            PlanEntry::Snapshot {
                snapshot_id,
                size_gb,
                eligibility,
            } => write!(f, "snapshot {} {}GB: {}", snapshot_id, size_gb, eligibility),
        }
    }
}

impl PlanEntry {
    pub fn is_eligible(&self) -> bool {
        match self {
            PlanEntry::Image(_) => true,
            PlanEntry::Volume(c) => c.eligibility == Eligibility::Eligible,
            PlanEntry::Snapshot { eligibility, .. } => *eligibility == Eligibility::Eligible,
        }
    }
}

pub fn print_plan(entries: &[PlanEntry]) {
    if entries.is_empty() {
        println!("{}", "Nothing matches the given filters.".yellow());
        return;
    }
    println!("{}", "Planned candidates:".bold());
    for entry in entries {
        if entry.is_eligible() {
            println!("  {}", entry.to_string().green());
        } else {
            println!("  {}", entry.to_string().dimmed());
        }
    }
}

pub struct Scanner {
    scheduler: BatchScheduler,
    options: ScanOptions,
    /// Instances launched from images, terminated once their volumes are done
    temporaries: Vec<String>,
}

impl Scanner {
    pub fn new(ctx: ShrinkContext, options: ScanOptions) -> Self {
        Self {
            scheduler: BatchScheduler::new(ctx),
            options,
            temporaries: Vec::new(),
        }
    }

    fn ctx(&self) -> &ShrinkContext {
        self.scheduler.context()
    }

    /// Run every scan that is not omitted and return what was shrunk.
    pub async fn run(mut self) -> Result<RunReport> {
        if !self.options.omits(OmitTarget::Images) {
            self.scan_images().await?;
        }
        if !self.options.omits(OmitTarget::Instances) {
            self.scan_instances().await?;
        }
        if !self.options.omits(OmitTarget::Snapshots) {
            self.scan_snapshots().await?;
        }
        Ok(self.scheduler.into_report())
    }

    fn image_filters(&self) -> Vec<Filter> {
        let mut filters = vec![Filter::new("state", &["available"])];
        filters.extend(self.options.filters.iter().cloned());
        filters
    }

    fn instance_filters(&self) -> Vec<Filter> {
        let mut filters = vec![
            Filter::new("instance-state-name", SCANNED_STATES),
            Filter::new("availability-zone", &[self.ctx().worker.availability_zone.as_str()]),
        ];
        filters.extend(self.options.filters.iter().cloned());
        filters
    }

    fn snapshot_filters(&self) -> Vec<Filter> {
        let mut filters = self.options.filters.clone();
        filters.push(Filter::new("status", &["completed"]));
        filters
    }

    async fn scan_images(&mut self) -> Result<()> {
        let images = self
            .ctx()
            .cloud
            .list_images(&self.image_filters())
            .await
            .context("listing images")?;
        info!("{} images match", images.len());

        for image in images {
            let instance = match self.launch_from_image(&image).await {
                Ok(instance) => instance,
                Err(err) => {
                    error!("[FAILED]{} could not be launched: {}", image.id, err);
                    continue;
                }
            };

            let candidates = match instance_volumes(self.ctx(), self.omit_boot(), &instance).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    error!("volumes of {} could not be listed: {}", instance.id, err);
                    continue;
                }
            };
            let eligible = eligible_only(candidates);
            self.scheduler.reserve(eligible.len()).await;
            let records = self
                .detach(eligible, &[Tag::new("AMI", &image.id)])
                .await;
            for record in records {
                self.scheduler.append(record);
            }
        }
        self.scheduler.flush().await;

        let ops = self.ctx().ops();
        for id in &self.temporaries {
            match ops.cloud().terminate_instance(id).await {
                Ok(()) => info!("{}(tmp for AMI) terminated.", id),
                Err(err) => error!("{}(tmp for AMI) could not be terminated: {}", id, err),
            }
        }
        Ok(())
    }

    /// Launch a temporary instance from `image` in the worker's zone and stop
    /// it. An instance that does not stop is terminated.
    async fn launch_from_image(&mut self, image: &ImageInfo) -> ShrinkResult<InstanceHandle> {
        let ctx = self.scheduler.context().clone();
        let request = LaunchRequest {
            image_id: image.id.clone(),
            instance_type: ctx.config.image_instance_type.clone(),
            availability_zone: ctx.worker.availability_zone.clone(),
            user_data: None,
            iam_instance_profile_arn: None,
            terminate_on_shutdown: false,
        };
        let instance = ctx.cloud.create_instance(&request).await?;
        ctx.cloud
            .tag_resource(
                &instance.id,
                &[
                    Tag::new("Name", "tmp4shrinking"),
                    Tag::new(PROJECT_TAG.0, PROJECT_TAG.1),
                ],
            )
            .await?;

        let ops = ctx.ops();
        let launched = poll_until(
            ctx.clock.as_ref(),
            ctx.config.instance_poll,
            "launch",
            &instance.id,
            || async {
                let status = ctx.cloud.describe_instance_status(&instance.id).await?;
                Ok((status.state == InstanceState::Running).then_some(()))
            },
        )
        .await;
        let stopped = match launched {
            Ok(()) => ops.stop_instance(&instance.id).await,
            Err(err) => Err(err),
        };
        if let Err(err) = stopped {
            warn!("[FAILED]{} from {} failed to stop, ignore shrinking...", instance.id, image.id);
            if let Err(cleanup) = ctx.cloud.terminate_instance(&instance.id).await {
                error!("{} could not be terminated: {}", instance.id, cleanup);
            }
            return Err(err);
        }

        self.temporaries.push(instance.id.clone());
        info!("{} launched from {} for shrinking", instance.id, image.id);
        Ok(InstanceHandle {
            state: InstanceState::Stopped,
            ..instance
        })
    }

    async fn scan_instances(&mut self) -> Result<()> {
        let instances = self
            .ctx()
            .cloud
            .list_instances(&self.instance_filters())
            .await
            .context("listing instances")?;

        for instance in instances {
            if instance.id == self.ctx().worker.instance_id || self.temporaries.contains(&instance.id) {
                continue;
            }

            let candidates = match instance_volumes(self.ctx(), self.omit_boot(), &instance).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    error!("volumes of {} could not be listed: {}", instance.id, err);
                    continue;
                }
            };
            let eligible = eligible_only(candidates);
            if eligible.is_empty() {
                debug!("{} has no volume worth shrinking", instance.id);
                continue;
            }

            self.scheduler.reserve(eligible.len()).await;
            if !self.stop_owner(&instance).await? {
                error!("[FAILED]{} failed to stop, ignore shrinking...", instance.id);
                continue;
            }
            for record in self.detach(eligible, &[]).await {
                self.scheduler.append(record);
            }
        }
        self.scheduler.flush().await;
        Ok(())
    }

    /// Stop `instance`, asking first in interactive mode. `Ok(false)` means
    /// the instance is not to be shrunk.
    async fn stop_owner(&self, instance: &InstanceHandle) -> Result<bool> {
        if instance.state == InstanceState::Stopped {
            return Ok(true);
        }
        if self.options.interactive && instance.state.is_active() && !confirm_stop(instance).await? {
            println!("shrink for {} is skipped...", instance.id);
            return Ok(false);
        }

        match self.ctx().ops().stop_instance(&instance.id).await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!("Unable to stop {}: {}", instance.id, err);
                Ok(false)
            }
        }
    }

    /// Tag and detach candidates from their stopped owner.
    async fn detach(&self, candidates: Vec<Candidate>, extra_tags: &[Tag]) -> Vec<VolumeRecord> {
        let ctx = self.ctx();
        let ops = ctx.ops();
        let mut records = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let mut tags = extra_tags.to_vec();
            tags.push(candidate.layout_tag());
            if let Err(err) = ctx.cloud.tag_resource(&candidate.volume.id, &tags).await {
                warn!("{} could not be tagged: {}", candidate.volume.id, err);
            }

            if let Err(err) = ops.detach_volume(&candidate.volume.id).await {
                error!(
                    "{} could not be detached from {}: {}",
                    candidate.volume.id, candidate.owner.id, err
                );
                continue;
            }
            info!(
                " {} detached from the {} {}({}) for shrinking...",
                candidate.volume.id, candidate.owner.state, candidate.owner.id, candidate.device
            );
            records.push(candidate.into_record());
        }

        if !records.is_empty() {
            ctx.settle().await;
        }
        records
    }

    async fn scan_snapshots(&mut self) -> Result<()> {
        let snapshots = self
            .ctx()
            .cloud
            .list_snapshots(&self.snapshot_filters())
            .await
            .context("listing snapshots")?;

        for snapshot in snapshots {
            if snapshot.volume_size_gb < self.ctx().config.min_volume_size_gb {
                debug!("{} is too small to shrink", snapshot.id);
                continue;
            }

            let volume = match self.restore(&snapshot.id).await {
                Ok(volume) => volume,
                Err(err) => {
                    error!("[FAILED]{} could not be restored: {}", snapshot.id, err);
                    continue;
                }
            };
            self.scheduler.append(VolumeRecord::detached(volume));
            if self.scheduler.size() >= self.scheduler.capacity() {
                self.scheduler.flush().await;
            }
        }
        self.scheduler.flush().await;
        Ok(())
    }

    /// Temporary volume holding the contents of `snapshot_id`.
    async fn restore(&self, snapshot_id: &str) -> ShrinkResult<VolumeHandle> {
        let ctx = self.ctx();
        let request = CreateVolumeRequest {
            volume_type: ctx.config.snapshot_volume_type.clone(),
            size_gb: None,
            iops: None,
            availability_zone: ctx.worker.availability_zone.clone(),
            snapshot_id: Some(snapshot_id.to_string()),
        };
        let volume = ctx.ops().create_volume(&request).await?;
        ctx.cloud
            .tag_resource(
                &volume.id,
                &[
                    Tag::new("Origin", snapshot_id),
                    Tag::new(PROJECT_TAG.0, PROJECT_TAG.1),
                ],
            )
            .await?;
        Ok(VolumeHandle {
            snapshot_id: Some(snapshot_id.to_string()),
            ..volume
        })
    }

    /// Discovery without any change: what a run would pick up.
    pub async fn plan(&self) -> Result<Vec<PlanEntry>> {
        let ctx = self.ctx();
        let mut entries = Vec::new();

        if !self.options.omits(OmitTarget::Images) {
            let images = ctx
                .cloud
                .list_images(&self.image_filters())
                .await
                .context("listing images")?;
            entries.extend(images.into_iter().map(PlanEntry::Image));
        }

        if !self.options.omits(OmitTarget::Instances) {
            let instances = ctx
                .cloud
                .list_instances(&self.instance_filters())
                .await
                .context("listing instances")?;
            for instance in instances.iter().filter(|i| i.id != ctx.worker.instance_id) {
                let candidates = instance_volumes(ctx, self.omit_boot(), instance)
                    .await
                    .with_context(|| format!("listing volumes of {}", instance.id))?;
                entries.extend(candidates.into_iter().map(PlanEntry::Volume));
            }
        }

        if !self.options.omits(OmitTarget::Snapshots) {
            let snapshots = ctx
                .cloud
                .list_snapshots(&self.snapshot_filters())
                .await
                .context("listing snapshots")?;
            entries.extend(snapshots.into_iter().map(|s| {
                let eligibility = if s.volume_size_gb < ctx.config.min_volume_size_gb {
                    Eligibility::TooSmall
                } else {
                    Eligibility::Eligible
                };
                PlanEntry::Snapshot {
                    snapshot_id: s.id,
                    size_gb: s.volume_size_gb,
                    eligibility,
                }
            }));
        }

        Ok(entries)
    }

    fn omit_boot(&self) -> bool {
        self.options.omits(OmitTarget::BootVolumes)
    }
}

fn eligible_only(candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            if c.eligibility != Eligibility::Eligible {
                debug!("{} on {}{} skipped: {}", c.volume.id, c.owner.id, c.device, c.eligibility);
            }
            c.eligibility == Eligibility::Eligible
        })
        .collect()
}

async fn confirm_stop(instance: &InstanceHandle) -> Result<bool> {
    let prompt = format!("{} is {}, stop it for shrinking?", instance.id, instance.state);
    let answer = tokio::task::spawn_blocking(move || {
        Confirm::new().with_prompt(prompt).default(true).interact()
    })
    .await
    .context("waiting for confirmation")??;
    Ok(answer)
}
