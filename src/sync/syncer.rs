use std::future::Future;

use serde_json::{json, Value};

use crate::client::RemoteSource;
use crate::error::{Error, Result};
use crate::ingest::{self, BoardPullReport, IngestReport, PullWindow};
use crate::reconcile::{self, Reconciler, ResyncReport};
use crate::storage::repository::{self, RunCounts};
use crate::storage::{local, Database};
use crate::sync::{
    BulkReconcileReport, LogStats, PullOptions, PullReport, ResetReport, RunKind, RunStatus,
    StatsReport, SyncProgress, LOG_OFFSET_KEY, LOG_TOTAL_KEY,
};

/// Errors kept in a run's `details` blob.
const DETAIL_ERROR_LIMIT: usize = 100;
/// Errors returned to the caller of a bulk reconciliation.
const REPORT_ERROR_LIMIT: usize = 10;
/// Runs shown by `stats`.
const RECENT_RUNS: u32 = 5;

pub const RESET_WARNING: &str = "This deletes every mirrored board, section, status, member, \
task snapshot, sync run and processed-log marker. Local tasks are kept but lose their link to \
the remote board. Pass confirm to proceed.";

// ── Run bookkeeping ────────────────────────────────────────────────

/// Record a run around `work`: `running` before it starts, then `completed`
/// with the counters from `summarize`, or `failed` with the error text.
async fn track_run<T>(
    db: &Database,
    kind: RunKind,
    work: impl Future<Output = Result<T>>,
    summarize: impl FnOnce(&T) -> (RunCounts, Value),
) -> Result<(i64, T)> {
    let run_id = db
        .writer()
        .call(move |conn| repository::insert_sync_run(conn, kind.as_str()))
        .await?;
    log::info!("Sync run {run_id} ({}) started", kind.as_str());

    match work.await {
        Ok(value) => {
            let (counts, details) = summarize(&value);
            db.writer()
                .call(move |conn| {
                    repository::finish_sync_run(
                        conn,
                        run_id,
                        RunStatus::Completed.as_str(),
                        counts,
                        None,
                        &details,
                    )
                })
                .await?;
            log::info!(
                "Sync run {run_id} ({}) completed: {} processed, {} created, {} updated, {} failed",
                kind.as_str(),
                counts.processed,
                counts.created,
                counts.updated,
                counts.failed
            );
            Ok((run_id, value))
        }
        Err(e) => {
            log::error!("Sync run {run_id} ({}) failed: {e}", kind.as_str());
            let message = e.to_string();
            if let Err(finish_err) = db
                .writer()
                .call(move |conn| {
                    repository::finish_sync_run(
                        conn,
                        run_id,
                        RunStatus::Failed.as_str(),
                        RunCounts::default(),
                        Some(message.as_str()),
                        &Value::Null,
                    )
                })
                .await
            {
                log::error!("Could not mark sync run {run_id} failed: {finish_err}");
            }
            Err(e)
        }
    }
}

fn first_errors(errors: &[String], limit: usize) -> Vec<String> {
    errors.iter().take(limit).cloned().collect()
}

// ── Pull ───────────────────────────────────────────────────────────

/// The stored resume offset, 0 if none was ever saved.
pub async fn stored_offset(db: &Database) -> Result<u64> {
    let raw = db
        .reader()
        .call(|conn| repository::get_config(conn, LOG_OFFSET_KEY))
        .await?;
    match raw {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{LOG_OFFSET_KEY} is not a number: {v:?}"))),
        None => Ok(0),
    }
}

async fn save_cursor(db: &Database, report: &IngestReport) -> Result<()> {
    let (offset, total) = (report.new_offset, report.total_in_api);
    db.writer()
        .call(move |conn| {
            repository::set_config(conn, LOG_OFFSET_KEY, &offset.to_string())?;
            repository::set_config(conn, LOG_TOTAL_KEY, &total.to_string())?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
    Ok(())
}

/// Pull one batch of the remote log and, if asked, reconcile everything that
/// became eligible. The cursor is saved only after a successful fetch, so a
/// failed pull is retried from the same offset.
pub async fn pull_and_reconcile(
    db: &Database,
    source: &dyn RemoteSource,
    reconciler: &Reconciler,
    endpoint: &str,
    page_size: u32,
    options: &PullOptions,
    progress: &dyn SyncProgress,
) -> Result<PullReport> {
    let offset = match options.offset {
        Some(offset) => offset,
        None => stored_offset(db).await?,
    };
    let window = PullWindow {
        batch_size: options.batch_size,
        offset,
        page_size,
    };

    let work = async {
        let ingest = ingest::pull(db, source, endpoint, window, progress).await?;
        save_cursor(db, &ingest).await?;
        let pending = if options.auto_sync {
            Some(reconcile_pending(db, reconciler, progress).await?)
        } else {
            None
        };
        Ok::<_, Error>((ingest, pending))
    };

    let batch_size = options.batch_size;
    let (run_id, (ingest, pending)) = track_run(db, RunKind::PullWebhooks, work, |(ingest, pending)| {
        let counts = RunCounts {
            processed: ingest.processed,
            created: ingest.created,
            updated: ingest.updated,
            failed: ingest.failed,
        };
        let details = json!({
            "batch_size": batch_size,
            "offset": ingest.offset,
            "new_offset": ingest.new_offset,
            "total_in_api": ingest.total_in_api,
            "has_more": ingest.has_more,
            "skipped": ingest.skipped,
            "ignored": ingest.ignored,
            "auto_synced": pending.as_ref().map_or(0, |p| p.synced),
            "errors": first_errors(&ingest.errors, DETAIL_ERROR_LIMIT),
        });
        (counts, details)
    })
    .await?;

    let mut report = PullReport::from_ingest(run_id, &ingest);
    if let Some(pending) = pending {
        report.auto_synced = pending.synced;
        report.auto_sync_failed = pending.failed;
    }
    progress.on_run_complete(
        RunKind::PullWebhooks,
        &RunCounts {
            processed: report.processed,
            created: report.created,
            updated: report.updated,
            failed: report.failed,
        },
    );
    Ok(report)
}

/// Fetch every board from the boards endpoint into the mirror.
pub async fn pull_boards(
    db: &Database,
    source: &dyn RemoteSource,
    endpoint: &str,
    page_size: u32,
    max_pages: u32,
) -> Result<BoardPullReport> {
    let work = ingest::pull_boards(db, source, endpoint, page_size, max_pages);
    let (_, report) = track_run(db, RunKind::PullBoards, work, |r| {
        (
            RunCounts {
                processed: r.fetched,
                created: r.created,
                updated: 0,
                failed: r.failed,
            },
            json!({ "endpoint": endpoint }),
        )
    })
    .await?;
    Ok(report)
}

// ── Reconciliation runs ────────────────────────────────────────────

#[derive(Debug, Default)]
struct PendingOutcome {
    total: u64,
    synced: u64,
    created: u64,
    failed: u64,
    errors: Vec<String>,
}

/// Reconcile every unsynced snapshot whose board (and status, if any) is
/// mapped. One failure never stops the batch.
async fn reconcile_pending(
    db: &Database,
    reconciler: &Reconciler,
    progress: &dyn SyncProgress,
) -> Result<PendingOutcome> {
    let ids = db
        .reader()
        .call(|conn| repository::list_reconcilable_snapshot_ids(conn))
        .await?;

    let mut outcome = PendingOutcome {
        total: ids.len() as u64,
        ..Default::default()
    };
    for (i, snapshot_id) in ids.iter().enumerate() {
        progress.on_reconcile_progress(i + 1, ids.len());
        match reconciler.reconcile(db, *snapshot_id).await {
            Ok(result) => {
                outcome.synced += 1;
                if result.created {
                    outcome.created += 1;
                }
            }
            Err(e) => {
                outcome.failed += 1;
                outcome.errors.push(format!("snapshot {snapshot_id}: {e}"));
            }
        }
    }
    log::info!(
        "Reconciled {}/{} pending snapshots ({} failed)",
        outcome.synced,
        outcome.total,
        outcome.failed
    );
    Ok(outcome)
}

pub async fn bulk_reconcile(
    db: &Database,
    reconciler: &Reconciler,
    progress: &dyn SyncProgress,
) -> Result<BulkReconcileReport> {
    let work = reconcile_pending(db, reconciler, progress);
    let (run_id, outcome) = track_run(db, RunKind::BulkReconcile, work, |o| {
        (
            RunCounts {
                processed: o.total,
                created: o.created,
                updated: o.synced - o.created,
                failed: o.failed,
            },
            json!({ "errors": first_errors(&o.errors, DETAIL_ERROR_LIMIT) }),
        )
    })
    .await?;

    let report = BulkReconcileReport {
        run_id,
        total: outcome.total,
        synced: outcome.synced,
        failed: outcome.failed,
        errors: first_errors(&outcome.errors, REPORT_ERROR_LIMIT),
    };
    progress.on_run_complete(
        RunKind::BulkReconcile,
        &RunCounts {
            processed: report.total,
            created: outcome.created,
            updated: report.synced - outcome.created,
            failed: report.failed,
        },
    );
    Ok(report)
}

pub async fn resync_assignees(db: &Database, reconciler: &Reconciler) -> Result<ResyncReport> {
    let work = reconciler.resync_assignees(db);
    let (_, report) = track_run(db, RunKind::ResyncAssignees, work, |r| {
        (
            RunCounts {
                processed: r.updated + r.failed,
                created: 0,
                updated: r.updated,
                failed: r.failed,
            },
            Value::Null,
        )
    })
    .await?;
    Ok(report)
}

pub async fn backfill_links(db: &Database) -> Result<u64> {
    let work = reconcile::backfill_external_links(db);
    let (_, updated) = track_run(db, RunKind::BackfillLinks, work, |n| {
        (
            RunCounts {
                processed: *n,
                updated: *n,
                ..Default::default()
            },
            Value::Null,
        )
    })
    .await?;
    Ok(updated)
}

// ── Reset & stats ──────────────────────────────────────────────────

/// Delete the whole mirror. Without `confirm` nothing is touched and
/// [`Error::ConfirmationRequired`] is returned.
pub async fn reset(db: &Database, confirm: bool) -> Result<ResetReport> {
    if !confirm {
        return Err(Error::ConfirmationRequired(RESET_WARNING.into()));
    }
    let deleted = db
        .writer()
        .call(|conn| {
            let tx = conn.transaction()?;
            let counts = repository::mirror_counts(&tx)?;
            repository::delete_mirror(&tx)?;
            repository::delete_config(&tx, LOG_OFFSET_KEY)?;
            repository::delete_config(&tx, LOG_TOTAL_KEY)?;
            tx.commit()?;
            Ok::<_, rusqlite::Error>(counts)
        })
        .await?;
    log::warn!(
        "Mirror reset: {} snapshots, {} boards, {} statuses, {} members deleted",
        deleted.tasks,
        deleted.boards,
        deleted.statuses,
        deleted.members
    );
    Ok(ResetReport { deleted })
}

pub async fn stats(db: &Database) -> Result<StatsReport> {
    let report = db
        .reader()
        .call(|conn| {
            let conn: &rusqlite::Connection = conn;
            let number = |key: &str| -> std::result::Result<u64, rusqlite::Error> {
                Ok(repository::get_config(conn, key)?
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0))
            };
            Ok::<_, rusqlite::Error>(StatsReport {
                boards: repository::board_coverage(conn)?,
                statuses: repository::status_coverage(conn)?,
                members: repository::member_coverage(conn)?,
                tasks: repository::snapshot_counts(conn)?,
                local_tasks: local::count_tasks(conn)?,
                logs: LogStats {
                    processed: repository::mirror_counts(conn)?.processed_markers,
                    total_in_api: number(LOG_TOTAL_KEY)?,
                    offset: number(LOG_OFFSET_KEY)?,
                },
                recent_runs: repository::list_recent_sync_runs(conn, RECENT_RUNS)?,
            })
        })
        .await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NoopProgress;
    use async_trait::async_trait;

    /// A log that is either healthy (serving `entries`) or always failing.
    struct FakeLog {
        entries: Vec<Value>,
        down: bool,
    }

    #[async_trait]
    impl RemoteSource for FakeLog {
        async fn fetch_page(&self, _endpoint: &str, params: &[(String, String)]) -> Result<Value> {
            if self.down {
                return Err(Error::Api {
                    status: 503,
                    body: "maintenance".into(),
                });
            }
            let get = |k: &str| {
                params
                    .iter()
                    .find(|(key, _)| key == k)
                    .and_then(|(_, v)| v.parse::<usize>().ok())
                    .unwrap_or(1)
            };
            let (page, size) = (get("page"), get("page_size"));
            let start = ((page - 1) * size).min(self.entries.len());
            let end = (start + size).min(self.entries.len());
            Ok(json!({"count": self.entries.len(), "results": self.entries[start..end].to_vec()}))
        }
    }

    fn entry(id: i64) -> Value {
        let body = json!({
            "triggerType": "Task_Created",
            "payload": {"id": format!("T{id}"), "title": format!("Task {id}"),
                        "partition": {"id": "B1", "name": "Board"},
                        "status": {"id": "S1", "name": "Open"}}
        });
        json!({"id": id, "raw_body": body.to_string()})
    }

    fn options(batch_size: u32, offset: Option<u64>) -> PullOptions {
        PullOptions {
            batch_size,
            offset,
            auto_sync: false,
        }
    }

    #[tokio::test]
    async fn test_pull_saves_cursor_and_resumes() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeLog {
            entries: (1..=7).map(entry).collect(),
            down: false,
        };
        let reconciler = Reconciler::new();

        let first = pull_and_reconcile(&db, &source, &reconciler, "/log", 3, &options(5, None), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(first.batch_fetched, 5);
        assert_eq!(first.remaining, 2);
        assert_eq!(stored_offset(&db).await.unwrap(), 5);

        let second = pull_and_reconcile(&db, &source, &reconciler, "/log", 3, &options(5, None), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(second.offset, 5);
        assert_eq!(second.batch_fetched, 2);
        assert!(!second.has_more);

        let runs = stats(&db).await.unwrap().recent_runs;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == "completed"));
    }

    #[tokio::test]
    async fn test_failed_pull_marks_run_failed_and_keeps_cursor() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| repository::set_config(conn, LOG_OFFSET_KEY, "40"))
            .await
            .unwrap();
        let source = FakeLog {
            entries: Vec::new(),
            down: true,
        };

        let err = pull_and_reconcile(&db, &source, &Reconciler::new(), "/log", 10, &options(10, None), &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api { status: 503, .. }));
        assert_eq!(stored_offset(&db).await.unwrap(), 40);

        let runs = stats(&db).await.unwrap().recent_runs;
        assert_eq!(runs[0].status, "failed");
        assert!(runs[0].error_message.contains("503"));
        assert!(runs[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_reset_requires_confirmation() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeLog {
            entries: (1..=3).map(entry).collect(),
            down: false,
        };
        pull_and_reconcile(&db, &source, &Reconciler::new(), "/log", 10, &options(10, Some(0)), &NoopProgress)
            .await
            .unwrap();

        assert!(matches!(reset(&db, false).await, Err(Error::ConfirmationRequired(_))));
        assert_eq!(stats(&db).await.unwrap().tasks.total, 3);

        let report = reset(&db, true).await.unwrap();
        assert_eq!(report.deleted.tasks, 3);
        assert_eq!(report.deleted.processed_markers, 3);
        let after = stats(&db).await.unwrap();
        assert_eq!(after.tasks.total, 0);
        assert_eq!(after.logs.offset, 0);
    }

    #[tokio::test]
    async fn test_bulk_reconcile_skips_unmapped_and_records_run() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeLog {
            entries: (1..=2).map(entry).collect(),
            down: false,
        };
        pull_and_reconcile(&db, &source, &Reconciler::new(), "/log", 10, &options(10, Some(0)), &NoopProgress)
            .await
            .unwrap();

        let reconciler = Reconciler::new();
        let nothing = bulk_reconcile(&db, &reconciler, &NoopProgress).await.unwrap();
        assert_eq!(nothing.total, 0);

        db.writer()
            .call(|conn| {
                let project = local::insert_project(conn, "Board", "board", None)?;
                repository::set_board_mapping(conn, 1, Some(project))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        let status_unmapped = bulk_reconcile(&db, &reconciler, &NoopProgress).await.unwrap();
        assert_eq!(status_unmapped.total, 0);

        db.writer()
            .call(|conn| {
                let open = local::insert_task_status(conn, "Open", 1, true)?;
                repository::set_status_mapping(conn, 1, Some(open))?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        let report = bulk_reconcile(&db, &reconciler, &NoopProgress).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.synced, 2);
        assert!(report.errors.is_empty());

        let s = stats(&db).await.unwrap();
        assert_eq!(s.tasks.synced, 2);
        assert_eq!(s.local_tasks, 2);
        assert_eq!(s.recent_runs[0].run_kind, "bulk_reconcile");
        assert_eq!(s.recent_runs[0].items_created, 2);
    }
}
