//! Turns task snapshots into local tasks.
//!
//! One snapshot maps to at most one local task. The whole upsert (task row,
//! assignee links, snapshot sync flag) commits in a single `IMMEDIATE`
//! transaction while a per-remote-task lock is held, so two reconciliations
//! of the same task never interleave.

pub mod assignees;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::local::{self, TaskFields};
use crate::storage::repository::{self, SnapshotFilter, TaskSnapshot};
use crate::storage::Database;

pub use assignees::AssigneeDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub task_id: i64,
    pub created: bool,
}

/// What a committed reconciliation changed, handed to every [`TaskObserver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskChange {
    pub task_id: i64,
    pub snapshot_id: i64,
    pub external_task_id: String,
    pub created: bool,
    pub previous_status_id: Option<i64>,
    pub status_id: Option<i64>,
    pub assignees: AssigneeDiff,
}

impl TaskChange {
    pub fn status_changed(&self) -> bool {
        !self.created && self.previous_status_id != self.status_id
    }
}

/// Notified after a reconciliation commits. Observers run inline on the
/// reconciling task and must not block.
pub trait TaskObserver: Send + Sync {
    fn on_task_reconciled(&self, change: &TaskChange);
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResyncReport {
    pub updated: u64,
    pub failed: u64,
}

/// Reconciles snapshots, serializing work per remote task id.
#[derive(Default)]
pub struct Reconciler {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    observers: Vec<Arc<dyn TaskObserver>>,
    default_status: Option<String>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Name of the local status used for snapshots without a status.
    pub fn with_default_status(mut self, name: Option<String>) -> Self {
        self.default_status = name;
        self
    }

    fn lock_for(&self, external_task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(external_task_id.to_string())
            .or_default()
            .clone()
    }

    fn release(&self, external_task_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Held only by the map and by us: nobody is waiting on it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(external_task_id);
        }
    }

    /// Create or update the local task for one snapshot.
    ///
    /// Fails with [`Error::UnmappedDependency`] when the snapshot's board has
    /// no project, or its status has no local status. Any failure is written
    /// to the snapshot's `sync_error` and leaves `is_synced` untouched.
    pub async fn reconcile(&self, db: &Database, snapshot_id: i64) -> Result<ReconcileOutcome> {
        let external_task_id = db
            .reader()
            .call(move |conn| {
                Ok::<_, rusqlite::Error>(
                    repository::get_snapshot(conn, snapshot_id)?.map(|s| s.external_task_id),
                )
            })
            .await?
            .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_id}")))?;

        let default_status = self.default_status.clone();
        let lock = self.lock_for(&external_task_id);
        let result = {
            let _guard = lock.lock().await;
            let result = match db
                .writer()
                .call(move |conn| reconcile_in_tx(conn, snapshot_id, default_status.as_deref()))
                .await
            {
                Ok(inner) => inner,
                Err(e) => Err(Error::from(e)),
            };
            if let Err(e) = &result {
                log::warn!("Snapshot {external_task_id} not reconciled: {e}");
                let message = e.to_string();
                if let Err(record_err) = db
                    .writer()
                    .call(move |conn| repository::record_snapshot_error(conn, snapshot_id, &message))
                    .await
                {
                    log::error!("Could not record sync error on snapshot {snapshot_id}: {record_err}");
                }
            }
            result
        };
        self.release(&external_task_id, lock);

        let change = result?;
        log::debug!(
            "{} task {} from snapshot {}",
            if change.created { "Created" } else { "Updated" },
            change.task_id,
            change.external_task_id
        );
        for observer in &self.observers {
            observer.on_task_reconciled(&change);
        }
        Ok(ReconcileOutcome {
            task_id: change.task_id,
            created: change.created,
        })
    }

    /// Re-run only the assignee step for every synced snapshot, repairing
    /// drift after members were mapped late.
    pub async fn resync_assignees(&self, db: &Database) -> Result<ResyncReport> {
        let targets = db
            .reader()
            .call(|conn| {
                let synced = repository::list_snapshots(
                    conn,
                    &SnapshotFilter {
                        is_synced: Some(true),
                        ..Default::default()
                    },
                )?;
                Ok::<_, rusqlite::Error>(
                    synced
                        .into_iter()
                        .filter(|s| s.synced_task_id.is_some())
                        .map(|s| (s.snapshot_id, s.external_task_id))
                        .collect::<Vec<_>>(),
                )
            })
            .await?;

        let mut report = ResyncReport::default();
        for (snapshot_id, external_task_id) in targets {
            let lock = self.lock_for(&external_task_id);
            let result = {
                let _guard = lock.lock().await;
                db.writer()
                    .call(move |conn| resync_in_tx(conn, snapshot_id))
                    .await
            };
            self.release(&external_task_id, lock);

            match result.map_err(Error::from).and_then(|inner| inner) {
                Ok(Some(_)) => report.updated += 1,
                Ok(None) => log::debug!("Snapshot {external_task_id} is no longer linked, skipped"),
                Err(e) => {
                    log::warn!("Assignee resync failed for {external_task_id}: {e}");
                    report.failed += 1;
                }
            }
        }
        log::info!(
            "Resynced assignees on {} tasks ({} failed)",
            report.updated,
            report.failed
        );
        Ok(report)
    }
}

/// Apply the snapshot's assignees as stored at commit time. The snapshot is
/// read inside the transaction, so an ingest that landed while we waited for
/// the task lock is what gets applied. `None` when the link is gone.
fn resync_in_tx(
    conn: &mut Connection,
    snapshot_id: i64,
) -> std::result::Result<Result<Option<AssigneeDiff>>, rusqlite::Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Some(snap) = repository::get_snapshot(&tx, snapshot_id)? else {
        return Ok(Ok(None));
    };
    let Some(task_id) = snap.synced_task_id.filter(|_| snap.is_synced) else {
        return Ok(Ok(None));
    };
    if local::get_task(&tx, task_id)?.is_none() {
        return Ok(Err(Error::NotFound(format!("task {task_id}"))));
    }
    let changes = assignees::sync_task_assignees(&tx, task_id, &snap.assignee_ids())?;
    tx.commit()?;
    Ok(Ok(Some(changes)))
}

/// Copy each synced snapshot's remote URL onto its local task when the task
/// has none. Returns the number of tasks updated.
pub async fn backfill_external_links(db: &Database) -> Result<u64> {
    let updated = db
        .writer()
        .call(|conn| {
            let tx = conn.transaction()?;
            let mut updated = 0u64;
            for (snapshot_id, task_id) in repository::list_synced_links(&tx)? {
                let Some(url) = repository::get_snapshot(&tx, snapshot_id)?
                    .and_then(|s| s.url)
                    .filter(|u| !u.trim().is_empty())
                else {
                    continue;
                };
                let Some(task) = local::get_task(&tx, task_id)? else {
                    continue;
                };
                if task.external_url.as_deref().is_some_and(|u| !u.trim().is_empty()) {
                    continue;
                }
                local::set_task_external_url(&tx, task_id, &url)?;
                updated += 1;
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(updated)
        })
        .await?;
    log::info!("Backfilled external links on {updated} tasks");
    Ok(updated)
}

fn unmapped(snap: &TaskSnapshot, missing: impl Into<String>) -> Error {
    Error::UnmappedDependency {
        snapshot: snap.external_task_id.clone(),
        missing: missing.into(),
    }
}

/// Local status for snapshots that carry no status at all.
fn default_status(
    conn: &Connection,
    name: Option<&str>,
) -> std::result::Result<Option<i64>, rusqlite::Error> {
    if let Some(name) = name {
        if let Some(status) = local::find_task_status_by_name(conn, name)? {
            return Ok(Some(status.status_id));
        }
        log::warn!("Configured default status {name:?} does not exist locally");
    }
    Ok(local::default_task_status(conn)?.map(|s| s.status_id))
}

fn reconcile_in_tx(
    conn: &mut Connection,
    snapshot_id: i64,
    default_status_name: Option<&str>,
) -> std::result::Result<Result<TaskChange>, rusqlite::Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(snap) = repository::get_snapshot(&tx, snapshot_id)? else {
        return Ok(Err(Error::NotFound(format!("snapshot {snapshot_id}"))));
    };

    let project_id = match snap.board_id {
        Some(board_id) => repository::get_board(&tx, board_id)?.and_then(|b| b.mapped_project_id),
        None => None,
    };
    let Some(project_id) = project_id else {
        return Ok(Err(unmapped(&snap, "board is not mapped to a project")));
    };

    let resolved_status = match snap.status_id {
        Some(status_id) => match repository::get_status(&tx, status_id)? {
            Some(status) => match status.mapped_status_id {
                Some(id) => Some(id),
                None => {
                    return Ok(Err(unmapped(
                        &snap,
                        format!("status {:?} is not mapped to a local status", status.name),
                    )))
                }
            },
            None => return Ok(Err(unmapped(&snap, "status is unknown"))),
        },
        None => default_status(&tx, default_status_name)?,
    };

    let linked = match snap.synced_task_id {
        Some(task_id) => local::get_task(&tx, task_id)?,
        None => None,
    };
    let existing = match linked {
        Some(task) => Some(task),
        None => match local::find_task_by_title(&tx, project_id, &snap.title)? {
            Some(task_id) => local::get_task(&tx, task_id)?,
            None => None,
        },
    };

    let description = if snap.user_story.trim().is_empty() {
        snap.description.clone()
    } else {
        snap.user_story.clone()
    };
    let previous_status_id = existing.as_ref().and_then(|t| t.status_id);
    let fields = TaskFields {
        title: snap.title.clone(),
        description,
        status_id: resolved_status.or(previous_status_id),
        external_url: snap
            .url
            .clone()
            .or_else(|| existing.as_ref().and_then(|t| t.external_url.clone())),
        due_date: snap.due_date.clone(),
        start_date: snap.start_date.clone(),
    };

    let (task_id, created) = match &existing {
        Some(task) => {
            local::update_task(&tx, task.task_id, &fields)?;
            (task.task_id, false)
        }
        None => (local::insert_task(&tx, project_id, &fields)?, true),
    };

    let diff = assignees::sync_task_assignees(&tx, task_id, &snap.assignee_ids())?;
    repository::mark_snapshot_synced(&tx, snapshot_id, task_id)?;
    tx.commit()?;

    Ok(Ok(TaskChange {
        task_id,
        snapshot_id,
        external_task_id: snap.external_task_id,
        created,
        previous_status_id,
        status_id: fields.status_id,
        assignees: diff,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::parser::{store_entry, StoreOutcome};
    use crate::ingest::payload::LogEntryBody;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TaskChange>>);

    impl TaskObserver for Recorder {
        fn on_task_reconciled(&self, change: &TaskChange) {
            self.0.lock().unwrap().push(change.clone());
        }
    }

    fn body(task: &str, title: &str, status: Option<&str>, assignees: &[&str]) -> LogEntryBody {
        let assignees: Vec<_> = assignees.iter().map(|id| json!({"id": id, "name": id})).collect();
        let mut payload = json!({
            "id": task,
            "title": title,
            "description": "plain description",
            "url": format!("https://board.example/{task}"),
            "partition": {"id": "B1", "name": "Platform"},
            "assignees": assignees,
        });
        if let Some(status) = status {
            payload["status"] = json!({"id": format!("ST-{status}"), "name": status});
        }
        serde_json::from_value(json!({"triggerType": "Task_Updated", "payload": payload})).unwrap()
    }

    async fn store(db: &Database, body: LogEntryBody) -> i64 {
        db.writer()
            .call(move |conn| match store_entry(conn, None, &body)? {
                StoreOutcome::Created(id) | StoreOutcome::Updated(id) => Ok::<_, rusqlite::Error>(id),
                StoreOutcome::Ignored => panic!("entry ignored"),
            })
            .await
            .unwrap()
    }

    /// Map every board to a fresh project and every status to a local status
    /// of the same name.
    async fn map_all(db: &Database) -> i64 {
        let project = db
            .writer()
            .call(|conn| {
                let project = local::insert_project(conn, "Platform", "platform", None)?;
                for board in repository::list_boards(conn)? {
                    repository::set_board_mapping(conn, board.board_id, Some(project))?;
                }
                Ok::<_, rusqlite::Error>(project)
            })
            .await
            .unwrap();
        map_statuses(db).await;
        project
    }

    async fn map_statuses(db: &Database) {
        db.writer()
            .call(|conn| {
                for status in repository::list_statuses(conn)? {
                    let id = match local::find_task_status_by_name(conn, &status.name)? {
                        Some(s) => s.status_id,
                        None => local::insert_task_status(conn, &status.name, 1, false)?,
                    };
                    repository::set_status_mapping(conn, status.status_id, Some(id))?;
                }
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let db = Database::open_memory().await.unwrap();
        let snap = store(&db, body("T1", "Fix login", Some("Open"), &[])).await;
        map_all(&db).await;
        let reconciler = Reconciler::new();

        let first = reconciler.reconcile(&db, snap).await.unwrap();
        let second = reconciler.reconcile(&db, snap).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.task_id, second.task_id);

        let (tasks, snapshot) = db
            .reader()
            .call(move |conn| {
                Ok::<_, rusqlite::Error>((local::count_tasks(conn)?, repository::get_snapshot(conn, snap)?))
            })
            .await
            .unwrap();
        assert_eq!(tasks, 1);
        let snapshot = snapshot.unwrap();
        assert!(snapshot.is_synced);
        assert_eq!(snapshot.synced_task_id, Some(first.task_id));
        assert!(snapshot.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_unmapped_board_records_error() {
        let db = Database::open_memory().await.unwrap();
        let snap = store(&db, body("T1", "Fix login", Some("Open"), &[])).await;

        let err = Reconciler::new().reconcile(&db, snap).await.unwrap_err();
        assert!(matches!(err, Error::UnmappedDependency { .. }), "{err}");

        let snapshot = db
            .reader()
            .call(move |conn| repository::get_snapshot(conn, snap))
            .await
            .unwrap()
            .unwrap();
        assert!(!snapshot.is_synced);
        assert!(snapshot.sync_error.contains("board"));
    }

    #[tokio::test]
    async fn test_unmapped_status_blocks_but_missing_status_uses_default() {
        let db = Database::open_memory().await.unwrap();
        let with_status = store(&db, body("T1", "A", Some("Open"), &[])).await;
        db.writer()
            .call(|conn| {
                let project = local::insert_project(conn, "P", "p", None)?;
                repository::set_board_mapping(conn, 1, Some(project))?;
                local::insert_task_status(conn, "Backlog", 1, true)?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        let reconciler = Reconciler::new();

        let err = reconciler.reconcile(&db, with_status).await.unwrap_err();
        assert!(matches!(err, Error::UnmappedDependency { .. }));

        let no_status = store(&db, body("T2", "B", None, &[])).await;
        let outcome = reconciler.reconcile(&db, no_status).await.unwrap();
        let task = db
            .reader()
            .call(move |conn| local::get_task(conn, outcome.task_id))
            .await
            .unwrap()
            .unwrap();
        let backlog = db
            .reader()
            .call(|conn| local::find_task_status_by_name(conn, "backlog"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status_id, Some(backlog.status_id));
    }

    #[tokio::test]
    async fn test_configured_default_status_overrides_flagged_default() {
        let db = Database::open_memory().await.unwrap();
        let snap = store(&db, body("T1", "A", None, &[])).await;
        let triage = db
            .writer()
            .call(|conn| {
                let project = local::insert_project(conn, "P", "p", None)?;
                repository::set_board_mapping(conn, 1, Some(project))?;
                local::insert_task_status(conn, "Backlog", 1, true)?;
                local::insert_task_status(conn, "Triage", 2, false)
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new().with_default_status(Some("Triage".into()));
        let outcome = reconciler.reconcile(&db, snap).await.unwrap();
        let task = db
            .reader()
            .call(move |conn| local::get_task(conn, outcome.task_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status_id, Some(triage));
    }

    #[tokio::test]
    async fn test_existing_task_with_same_title_is_reused() {
        let db = Database::open_memory().await.unwrap();
        let snap = store(&db, body("T1", "Fix login", Some("Open"), &[])).await;
        let project = map_all(&db).await;
        let manual = db
            .writer()
            .call(move |conn| {
                local::insert_task(
                    conn,
                    project,
                    &TaskFields {
                        title: "Fix login".into(),
                        ..Default::default()
                    },
                )
            })
            .await
            .unwrap();

        let outcome = Reconciler::new().reconcile(&db, snap).await.unwrap();
        assert_eq!(outcome.task_id, manual);
        assert!(!outcome.created);
    }

    #[tokio::test]
    async fn test_observer_sees_status_change() {
        let db = Database::open_memory().await.unwrap();
        let snap = store(&db, body("T1", "Fix login", Some("Open"), &[])).await;
        map_all(&db).await;
        let recorder = Arc::new(Recorder::default());
        let reconciler = Reconciler::new().with_observer(recorder.clone());

        reconciler.reconcile(&db, snap).await.unwrap();
        store(&db, body("T1", "Fix login", Some("Done"), &[])).await;
        map_statuses(&db).await;
        reconciler.reconcile(&db, snap).await.unwrap();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].created);
        assert!(seen[1].status_changed());
    }

    #[tokio::test]
    async fn test_description_prefers_user_story() {
        let db = Database::open_memory().await.unwrap();
        let mut with_story = body("T1", "Story", Some("Open"), &[]);
        if let Some(payload) = with_story.payload.as_mut() {
            payload.custom_fields.insert(
                "cf".into(),
                json!({"name": "User story", "value": "As a user"}),
            );
        }
        let snap = store(&db, with_story).await;
        map_all(&db).await;

        let outcome = Reconciler::new().reconcile(&db, snap).await.unwrap();
        let task = db
            .reader()
            .call(move |conn| local::get_task(conn, outcome.task_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.description.as_deref(), Some("As a user"));
        assert_eq!(task.external_url.as_deref(), Some("https://board.example/T1"));
    }

    #[tokio::test]
    async fn test_resync_assignees_picks_up_late_mapping() {
        let db = Database::open_memory().await.unwrap();
        let snap = store(&db, body("T1", "Fix login", Some("Open"), &["m1"])).await;
        map_all(&db).await;
        let reconciler = Reconciler::new();
        let outcome = reconciler.reconcile(&db, snap).await.unwrap();

        let local_member = db
            .writer()
            .call(|conn| {
                let id = local::insert_member(conn, Some("Ana"), None, None)?;
                repository::set_member_mapping(conn, 1, Some(id))?;
                Ok::<_, rusqlite::Error>(id)
            })
            .await
            .unwrap();

        let report = reconciler.resync_assignees(&db).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 0);
        let assigned = db
            .reader()
            .call(move |conn| local::list_task_assignees(conn, outcome.task_id))
            .await
            .unwrap();
        assert_eq!(assigned, vec![local_member]);
    }

    /// Maps the remote member `external_id` to a new local member.
    async fn map_new_member(db: &Database, external_id: &'static str) -> i64 {
        db.writer()
            .call(move |conn| {
                let member = repository::list_members(conn)?
                    .into_iter()
                    .find(|m| m.external_id == external_id)
                    .expect("member mirrored");
                let id = local::insert_member(conn, Some(external_id), None, None)?;
                repository::set_member_mapping(conn, member.member_id, Some(id))?;
                Ok::<_, rusqlite::Error>(id)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resync_applies_assignees_stored_while_waiting_for_lock() {
        let db = Database::open_memory().await.unwrap();
        let snap = store(&db, body("T1", "Fix login", Some("Open"), &["m1"])).await;
        map_all(&db).await;
        let first = map_new_member(&db, "m1").await;
        let reconciler = Arc::new(Reconciler::new());
        let outcome = reconciler.reconcile(&db, snap).await.unwrap();

        let lock = reconciler.lock_for("T1");
        let guard = lock.lock().await;
        let resync = {
            let reconciler = Arc::clone(&reconciler);
            let db = db.clone();
            tokio::spawn(async move { reconciler.resync_assignees(&db).await })
        };
        // Let the resync list its targets and park on the task lock.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        store(&db, body("T1", "Fix login", Some("Open"), &["m2"])).await;
        let second = map_new_member(&db, "m2").await;
        drop(guard);
        drop(lock);

        let report = resync.await.unwrap().unwrap();
        assert_eq!(report.updated, 1);
        let assigned = db
            .reader()
            .call(move |conn| local::list_task_assignees(conn, outcome.task_id))
            .await
            .unwrap();
        assert_eq!(assigned, vec![second]);
        assert!(!assigned.contains(&first));
    }

    #[tokio::test]
    async fn test_backfill_external_links_fills_only_missing() {
        let db = Database::open_memory().await.unwrap();
        let snap = store(&db, body("T1", "Fix login", Some("Open"), &[])).await;
        map_all(&db).await;
        let outcome = Reconciler::new().reconcile(&db, snap).await.unwrap();
        assert_eq!(backfill_external_links(&db).await.unwrap(), 0);

        db.writer()
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET external_url = NULL WHERE task_id = ?1",
                    [outcome.task_id],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        assert_eq!(backfill_external_links(&db).await.unwrap(), 1);
    }
}
