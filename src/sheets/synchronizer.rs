// 🔃 Synchronizer - one read, one plan, batched writes with retries per worksheet

use tracing::{info, warn};

use super::client::SpreadsheetApi;
use super::plan::{ExistingIndex, SyncPlan, WorksheetLayout};
use super::SheetRow;
use crate::config::{SpreadsheetSettings, WorksheetSettings};
use crate::error::SyncError;
use crate::retry::{RetryError, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorksheetOutcome {
    pub worksheet: String,
    pub inserted: usize,
    pub updated_cells: usize,
    pub updated_rows: usize,
    pub unchanged: usize,
    pub batches: usize,
}

impl WorksheetOutcome {
    pub fn writes(&self) -> usize {
        self.inserted + self.updated_cells
    }
}

pub struct Synchronizer<A: SpreadsheetApi> {
    api: A,
    batch_size: usize,
    policy: RetryPolicy,
}

impl<A: SpreadsheetApi> Synchronizer<A> {
    pub fn new(api: A, settings: &SpreadsheetSettings) -> Self {
        Synchronizer {
            api,
            batch_size: settings.batch_size.max(1),
            policy: settings.retry_policy(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Bring one worksheet in line with `rows`.
    ///
    /// Batches already written stay written if a later batch gives up.
    pub async fn sync_worksheet<R: SheetRow>(
        &self,
        definition: &WorksheetSettings,
        rows: &[R],
    ) -> Result<WorksheetOutcome, SyncError> {
        let layout = WorksheetLayout::from_settings(definition)?;
        let range = layout.data_range();

        let values = self
            .retry(&layout.name, "read", || self.api.read_range(&range))
            .await?;
        let index = ExistingIndex::from_values(&layout, values);
        let plan = SyncPlan::compute(&layout, &index, rows);

        let mut outcome = WorksheetOutcome {
            worksheet: layout.name.clone(),
            unchanged: plan.unchanged,
            updated_rows: plan.updated_rows(),
            ..WorksheetOutcome::default()
        };
        info!(
            worksheet = %layout.name,
            existing = index.len(),
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            unchanged = plan.unchanged,
            "sync plan computed"
        );

        if plan.is_empty() {
            return Ok(outcome);
        }

        for batch in plan.updates.chunks(self.batch_size) {
            self.retry(&layout.name, "update", || self.api.update_cells(&layout.name, batch))
                .await?;
            outcome.updated_cells += batch.len();
            outcome.batches += 1;
        }

        for batch in plan.inserts.chunks(self.batch_size) {
            self.retry(&layout.name, "append", || self.api.append_rows(&layout.name, batch))
                .await?;
            outcome.inserted += batch.len();
            outcome.batches += 1;
        }

        info!(
            worksheet = %outcome.worksheet,
            inserted = outcome.inserted,
            updated_cells = outcome.updated_cells,
            batches = outcome.batches,
            "worksheet synchronized"
        );
        Ok(outcome)
    }

    async fn retry<T, F, Fut>(&self, worksheet: &str, operation: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        let label = format!("{} {}", operation, worksheet);
        match self.policy.run(&label, |_| op(), SyncError::is_retryable).await {
            Ok(value) => Ok(value),
            Err(RetryError::Aborted { error, .. }) => Err(error),
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(worksheet, operation, attempts, "sheet writes gave up");
                Err(SyncError::Exhausted {
                    worksheet: worksheet.to_string(),
                    operation: operation.to_string(),
                    attempts,
                    last: Box::new(last),
                })
            }
        }
    }
}
