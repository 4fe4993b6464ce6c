//! In-flight records and the capacity-bounded batch trigger.

use super::orchestrator;
use super::record::VolumeRecord;
use super::report::RunReport;
use super::ShrinkContext;

/// Records waiting for the next batch. Only touched from the scanning path.
#[derive(Debug, Default)]
pub struct VolumeRepository {
    records: Vec<VolumeRecord>,
    capacity: usize,
}

impl VolumeRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, record: VolumeRecord) {
        self.records.push(record);
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `pending` more records have to wait for a flush first.
    pub fn must_flush_before(&self, pending: usize) -> bool {
        !self.records.is_empty() && self.records.len() + pending >= self.capacity
    }

    pub fn records_mut(&mut self) -> &mut [VolumeRecord] {
        &mut self.records
    }

    /// Remove every record. Only finalized records should leave.
    pub fn take(&mut self) -> Vec<VolumeRecord> {
        std::mem::take(&mut self.records)
    }
}

pub struct BatchScheduler {
    ctx: ShrinkContext,
    repository: VolumeRepository,
    report: RunReport,
}

impl BatchScheduler {
    pub fn new(ctx: ShrinkContext) -> Self {
        let repository = VolumeRepository::new(ctx.config.capacity);
        Self {
            ctx,
            repository,
            report: RunReport::default(),
        }
    }

    pub fn context(&self) -> &ShrinkContext {
        &self.ctx
    }

    pub fn capacity(&self) -> usize {
        self.repository.capacity()
    }

    pub fn size(&self) -> usize {
        self.repository.size()
    }

    /// Make room for `pending` records that belong in the same batch.
    pub async fn reserve(&mut self, pending: usize) {
        if self.repository.must_flush_before(pending) {
            self.flush().await;
        }
    }

    pub fn append(&mut self, record: VolumeRecord) {
        self.repository.append(record);
    }

    /// Run the orchestrator over the current records, then empty the
    /// repository once every record is finalized.
    pub async fn flush(&mut self) {
        if self.repository.is_empty() {
            return;
        }
        orchestrator::run_batch(&self.ctx, self.repository.records_mut()).await;
        let finished = self.repository.take();
        self.report.record_batch(&finished);
    }

    pub fn into_report(self) -> RunReport {
        self.report
    }
}
