pub mod client;
pub mod config;
pub mod date_util;
pub mod error;
pub mod ingest;
pub mod mapping;
pub mod reconcile;
pub mod storage;
pub mod sync;

use std::sync::Arc;

pub use client::{ApiClient, RemoteSource};
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use ingest::BoardPullReport;
pub use mapping::{
    AutoMapMembersReport, AutoMapStatusesReport, EmailThenNameMatcher, FastTrackProjectsReport,
    FastTrackStatusesReport, MemberMatcher, StatusMappingResult,
};
pub use reconcile::{ReconcileOutcome, Reconciler, ResyncReport, TaskChange, TaskObserver};
pub use storage::Database;
pub use sync::{
    BulkReconcileReport, NoopProgress, PullOptions, PullReport, ResetReport, RunKind, StatsReport,
    SyncProgress,
};

use sync::syncer;

/// Main entry point for the board sync engine.
///
/// Holds the store, the remote source (only needed for pulls), the member
/// matcher used by auto-mapping and the reconciler with its observers.
pub struct BoardSync {
    db: Database,
    config: SyncConfig,
    source: Option<Arc<dyn RemoteSource>>,
    matcher: Arc<dyn MemberMatcher>,
    reconciler: Reconciler,
}

impl BoardSync {
    pub fn new(db: Database, config: SyncConfig) -> Self {
        let reconciler = Reconciler::new().with_default_status(config.default_status.clone());
        Self {
            db,
            config,
            source: None,
            matcher: Arc::new(EmailThenNameMatcher),
            reconciler,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn RemoteSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the default e-mail/name member matcher.
    pub fn with_matcher(mut self, matcher: Arc<dyn MemberMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.reconciler = std::mem::take(&mut self.reconciler).with_observer(observer);
        self
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn source(&self) -> Result<&dyn RemoteSource> {
        self.source
            .as_deref()
            .ok_or_else(|| Error::Config("no remote source configured".into()))
    }

    // ── Ingestion ──────────────────────────────────────────────────

    /// Pull one batch of the remote log. `offset: None` resumes from the
    /// stored cursor; `batch_size: None` uses the configured default.
    pub async fn pull(
        &self,
        batch_size: Option<u32>,
        offset: Option<u64>,
        auto_sync: bool,
        progress: &dyn SyncProgress,
    ) -> Result<PullReport> {
        let options = PullOptions {
            batch_size: batch_size.unwrap_or(self.config.batch_size),
            offset,
            auto_sync,
        };
        syncer::pull_and_reconcile(
            &self.db,
            self.source()?,
            &self.reconciler,
            &self.config.log_endpoint,
            self.config.page_size,
            &options,
            progress,
        )
        .await
    }

    pub async fn pull_boards(&self) -> Result<BoardPullReport> {
        syncer::pull_boards(
            &self.db,
            self.source()?,
            self.config.boards_endpoint()?,
            self.config.page_size,
            self.config.max_board_pages,
        )
        .await
    }

    // ── Mapping ────────────────────────────────────────────────────

    pub async fn map_board(&self, board_id: i64, project_id: Option<i64>) -> Result<()> {
        mapping::map_board(&self.db, board_id, project_id).await
    }

    pub async fn map_status(
        &self,
        status_id: i64,
        local_status_id: Option<i64>,
    ) -> Result<StatusMappingResult> {
        mapping::map_status(&self.db, status_id, local_status_id).await
    }

    pub async fn map_member(&self, member_id: i64, local_member_id: Option<i64>) -> Result<()> {
        mapping::map_member(&self.db, member_id, local_member_id).await
    }

    pub async fn auto_map_statuses(&self) -> Result<AutoMapStatusesReport> {
        mapping::auto_map_statuses(&self.db).await
    }

    pub async fn auto_map_members(&self) -> Result<AutoMapMembersReport> {
        mapping::auto_map_members(&self.db, Arc::clone(&self.matcher)).await
    }

    pub async fn fast_track_projects(&self) -> Result<FastTrackProjectsReport> {
        mapping::fast_track_projects(&self.db).await
    }

    pub async fn fast_track_statuses(&self) -> Result<FastTrackStatusesReport> {
        mapping::fast_track_statuses(&self.db).await
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Reconcile a single snapshot.
    pub async fn sync_task(&self, snapshot_id: i64) -> Result<ReconcileOutcome> {
        self.reconciler.reconcile(&self.db, snapshot_id).await
    }

    pub async fn bulk_reconcile(&self, progress: &dyn SyncProgress) -> Result<BulkReconcileReport> {
        syncer::bulk_reconcile(&self.db, &self.reconciler, progress).await
    }

    pub async fn resync_assignees(&self) -> Result<ResyncReport> {
        syncer::resync_assignees(&self.db, &self.reconciler).await
    }

    pub async fn backfill_links(&self) -> Result<u64> {
        syncer::backfill_links(&self.db).await
    }

    // ── Maintenance ────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<StatsReport> {
        syncer::stats(&self.db).await
    }

    pub async fn reset(&self, confirm: bool) -> Result<ResetReport> {
        syncer::reset(&self.db, confirm).await
    }
}
