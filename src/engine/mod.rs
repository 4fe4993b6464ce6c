//! Volume shrink orchestration.
//!
//! A batch of [`VolumeRecord`]s moves through probing and provisioning one
//! record at a time, then migrates concurrently (one task per record), and is
//! finalized once every migration task has been joined.

pub mod migrator;
pub mod orchestrator;
pub mod prober;
pub mod provisioner;
pub mod record;
pub mod recovery;
pub mod report;
pub mod repository;
pub mod slots;

#[cfg(test)]
pub mod testing;

use crate::cloud::{CloudOps, CloudVolumeService, WorkerHost};
use crate::config::ShrinkConfig;
use crate::device::DeviceToolkit;
use crate::error::ShrinkResult;
use crate::retry::Clock;
use std::sync::Arc;

pub use record::VolumeRecord;
pub use report::RunReport;
pub use repository::BatchScheduler;
pub use slots::{Slot, SlotAllocator};

/// Everything a stage needs, shared by the scheduler and every migration task.
#[derive(Clone)]
pub struct ShrinkContext {
    pub config: Arc<ShrinkConfig>,
    pub cloud: Arc<dyn CloudVolumeService>,
    pub device: Arc<dyn DeviceToolkit>,
    pub clock: Arc<dyn Clock>,
    pub worker: WorkerHost,
    pub slots: SlotAllocator,
}

impl ShrinkContext {
    pub fn new(
        config: Arc<ShrinkConfig>,
        cloud: Arc<dyn CloudVolumeService>,
        device: Arc<dyn DeviceToolkit>,
        clock: Arc<dyn Clock>,
        worker: WorkerHost,
    ) -> ShrinkResult<Self> {
        let slots = SlotAllocator::from_config(&config)?;
        Ok(Self {
            config,
            cloud,
            device,
            clock,
            worker,
            slots,
        })
    }

    pub fn ops(&self) -> CloudOps<'_> {
        CloudOps::new(
            self.cloud.as_ref(),
            self.clock.as_ref(),
            self.config.volume_poll,
            self.config.instance_poll,
        )
    }

    /// Pause for device nodes and udev after attachment changes.
    pub async fn settle(&self) {
        self.clock.sleep(self.config.settle_delay()).await;
    }
}
