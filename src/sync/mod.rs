pub mod syncer;

use serde::Serialize;

use crate::ingest::IngestReport;
use crate::storage::repository::{Coverage, MirrorCounts, RunCounts, SnapshotCounts, SyncRunRecord};

/// `app_config` key holding the next log offset to pull from.
pub const LOG_OFFSET_KEY: &str = "log_offset";
/// `app_config` key holding the remote log size seen by the last pull.
pub const LOG_TOTAL_KEY: &str = "log_total";

/// Callbacks for reporting progress during long-running operations.
///
/// Every method has an empty default so implementors pick what they show.
pub trait SyncProgress: Send + Sync {
    fn on_batch_fetched(&self, _fetched: usize, _total_in_api: u64) {}
    fn on_entry_progress(&self, _current: usize, _total: usize) {}
    fn on_reconcile_progress(&self, _current: usize, _total: usize) {}
    fn on_run_complete(&self, _kind: RunKind, _counts: &RunCounts) {}
}

/// Progress reporter that ignores everything.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

/// What a recorded sync run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    PullWebhooks,
    BulkReconcile,
    ResyncAssignees,
    BackfillLinks,
    PullBoards,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::PullWebhooks => "pull_webhooks",
            RunKind::BulkReconcile => "bulk_reconcile",
            RunKind::ResyncAssignees => "resync_assignees",
            RunKind::BackfillLinks => "backfill_links",
            RunKind::PullBoards => "pull_boards",
        }
    }
}

/// Run lifecycle: `running` until it ends as `completed` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Options for one pull.
#[derive(Debug, Clone)]
pub struct PullOptions {
    pub batch_size: u32,
    /// Start position; `None` resumes from the stored offset.
    pub offset: Option<u64>,
    /// Reconcile every mapped, unsynced snapshot after ingesting.
    pub auto_sync: bool,
}

/// Report returned by a pull.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PullReport {
    pub run_id: i64,
    pub total_in_api: u64,
    pub batch_fetched: u64,
    pub processed: u64,
    pub skipped: u64,
    pub ignored: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub offset: u64,
    pub new_offset: u64,
    pub has_more: bool,
    pub remaining: u64,
    pub auto_synced: u64,
    pub auto_sync_failed: u64,
}

impl PullReport {
    pub(crate) fn from_ingest(run_id: i64, ingest: &IngestReport) -> Self {
        Self {
            run_id,
            total_in_api: ingest.total_in_api,
            batch_fetched: ingest.batch_fetched,
            processed: ingest.processed,
            skipped: ingest.skipped,
            ignored: ingest.ignored,
            created: ingest.created,
            updated: ingest.updated,
            failed: ingest.failed,
            offset: ingest.offset,
            new_offset: ingest.new_offset,
            has_more: ingest.has_more,
            remaining: ingest.remaining(),
            ..Default::default()
        }
    }
}

/// Report returned by a bulk reconciliation. `errors` holds the first ten.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReconcileReport {
    pub run_id: i64,
    pub total: u64,
    pub synced: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub deleted: MirrorCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    pub processed: i64,
    pub total_in_api: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub boards: Coverage,
    pub statuses: Coverage,
    pub members: Coverage,
    pub tasks: SnapshotCounts,
    pub local_tasks: i64,
    pub logs: LogStats,
    pub recent_runs: Vec<SyncRunRecord>,
}
