//! Turns one decoded log body into a task snapshot plus the side entities it
//! references (board, section, status, members).

use rusqlite::Connection;
use serde_json::Value;

use crate::date_util::{lenient_date, millis_to_rfc3339};
use crate::ingest::payload::{LogEntryBody, TaskPayload};
use crate::storage::repository::{self, SnapshotRecord};

/// What happened to a log body handed to [`store_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Created(i64),
    Updated(i64),
    /// Not a task event (no payload or no task id).
    Ignored,
}

/// Get-or-create the referenced side entities, then upsert the snapshot keyed
/// by the payload's task id. Safe to call repeatedly with the same body.
pub fn store_entry(
    conn: &Connection,
    log_entry_id: Option<i64>,
    body: &LogEntryBody,
) -> Result<StoreOutcome, rusqlite::Error> {
    let Some(payload) = body.payload.as_ref() else {
        return Ok(StoreOutcome::Ignored);
    };
    let Some(external_task_id) = payload.id.as_deref() else {
        return Ok(StoreOutcome::Ignored);
    };

    let board_id = match payload.partition.as_ref() {
        Some(p) => match p.id.as_deref() {
            Some(id) => Some(repository::get_or_create_board(
                conn,
                id,
                p.name.as_deref().unwrap_or_default(),
                p.url.as_deref().filter(|u| !u.is_empty()),
            )?),
            None => None,
        },
        None => None,
    };

    // Sections only exist inside a board.
    let section_id = match (payload.section.as_ref(), board_id) {
        (Some(s), Some(board_id)) => match s.id.as_deref() {
            Some(id) => Some(repository::get_or_create_section(
                conn,
                id,
                s.name.as_deref().unwrap_or_default(),
                board_id,
            )?),
            None => None,
        },
        _ => None,
    };

    let status_id = match payload.status.as_ref() {
        Some(s) => match s.id.as_deref() {
            Some(id) => Some(repository::get_or_create_status(
                conn,
                id,
                s.name.as_deref().unwrap_or_default().trim(),
                s.color_type.as_deref().unwrap_or_default(),
                s.mapping_type.as_deref().unwrap_or_default(),
                board_id,
            )?),
            None => None,
        },
        None => None,
    };

    for assignee in &payload.assignees {
        if let Some(id) = assignee.id.as_deref() {
            repository::get_or_create_member(
                conn,
                id,
                assignee.name.as_deref().unwrap_or_default(),
                assignee.email_id.as_deref().unwrap_or_default(),
                assignee.url.as_deref().filter(|u| !u.is_empty()),
            )?;
        }
    }

    let record = build_record(
        external_task_id,
        log_entry_id,
        body,
        payload,
        board_id,
        section_id,
        status_id,
    );
    let (snapshot_id, created) = repository::upsert_snapshot(conn, &record)?;
    log::debug!(
        "{} snapshot {external_task_id} (#{snapshot_id}) from log entry {log_entry_id:?}",
        if created { "created" } else { "updated" }
    );
    Ok(if created {
        StoreOutcome::Created(snapshot_id)
    } else {
        StoreOutcome::Updated(snapshot_id)
    })
}

fn build_record(
    external_task_id: &str,
    log_entry_id: Option<i64>,
    body: &LogEntryBody,
    payload: &TaskPayload,
    board_id: Option<i64>,
    section_id: Option<i64>,
    status_id: Option<i64>,
) -> SnapshotRecord {
    let actor = body.triggered_by.clone().unwrap_or_default();
    let scope = body.scope.clone().unwrap_or_default();
    let priority = payload.priority.clone().unwrap_or_default();
    let json_or = |v: &Option<Value>, empty: &str| {
        v.as_ref()
            .filter(|v| !v.is_null())
            .map(Value::to_string)
            .unwrap_or_else(|| empty.to_string())
    };

    SnapshotRecord {
        external_task_id: external_task_id.to_string(),
        internal_task_id: payload.task_id.clone().unwrap_or_default(),
        title: payload.title.clone().unwrap_or_default(),
        description: payload.description.clone().unwrap_or_default(),
        url: payload.url.clone().filter(|u| !u.is_empty()),
        board_id,
        section_id,
        status_id,
        priority_id: priority.id.unwrap_or_default(),
        priority_name: priority.name.unwrap_or_default(),
        due_date: payload.due_date.as_ref().and_then(lenient_date),
        start_date: payload.start_date.as_ref().and_then(lenient_date),
        assignees_json: serde_json::to_string(&payload.assignees).unwrap_or_else(|_| "[]".into()),
        custom_fields_json: Value::Object(payload.custom_fields.clone()).to_string(),
        category_name: payload.category(),
        user_story: payload.user_story(),
        checklists_json: json_or(&payload.checklists, "[]"),
        tags_json: json_or(&payload.tags, "[]"),
        attachments_json: json_or(&payload.attachments, "[]"),
        trigger_type: body.trigger_type.clone().unwrap_or_default(),
        triggered_by_id: actor.id.unwrap_or_default(),
        triggered_by_name: actor.name.unwrap_or_default(),
        triggered_by_email: actor.email_id.unwrap_or_default(),
        triggered_time: body.triggered_time_in_millis.and_then(millis_to_rfc3339),
        triggered_time_millis: body.triggered_time_in_millis,
        scope_id: scope.id.unwrap_or_default(),
        scope_name: scope.name.unwrap_or_default(),
        raw_payload: serde_json::to_string(body).unwrap_or_else(|_| "{}".into()),
        log_entry_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use serde_json::json;

    fn body(task_id: &str, title: &str, status: &str) -> LogEntryBody {
        serde_json::from_value(json!({
            "triggerType": "Task_Updated",
            "triggeredBy": {"id": "u9", "name": "Ravi", "emailId": "ravi@example.com"},
            "triggeredTimeInMillis": 1_700_000_000_000_i64,
            "payload": {
                "id": task_id,
                "title": title,
                "description": "plain",
                "url": "https://board.example/t/1",
                "partition": {"id": "B1", "name": "Platform"},
                "section": {"id": "SEC1", "name": "Backend"},
                "status": {"id": format!("ST-{status}"), "name": status},
                "priority": {"id": "2", "name": "High"},
                "dueDate": "2025-03-01",
                "assignees": [
                    {"id": "m1", "name": "Ana", "emailId": "ana@example.com"},
                    {"id": "m2", "name": "Bo"}
                ],
                "customFields": {"c": {"name": "User story", "value": "story text"}},
                "tags": ["x"]
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_entry_twice_is_idempotent() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let first = store_entry(conn, Some(1), &body("T1", "Fix login", "Open"))?;
                let second = store_entry(conn, Some(1), &body("T1", "Fix login", "Open"))?;
                let StoreOutcome::Created(id) = first else {
                    panic!("expected created, got {first:?}");
                };
                assert_eq!(second, StoreOutcome::Updated(id));

                let counts = repository::mirror_counts(conn)?;
                assert_eq!(counts.tasks, 1);
                assert_eq!(counts.boards, 1);
                assert_eq!(counts.sections, 1);
                assert_eq!(counts.statuses, 1);
                assert_eq!(counts.members, 2);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_entry_derives_snapshot_fields() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let StoreOutcome::Created(id) =
                    store_entry(conn, Some(5), &body("T1", "Fix login", "Open"))?
                else {
                    panic!("expected created");
                };
                let snap = repository::get_snapshot(conn, id)?.unwrap();
                assert_eq!(snap.title, "Fix login");
                assert_eq!(snap.user_story, "story text");
                assert_eq!(snap.priority_name, "High");
                assert_eq!(snap.due_date.as_deref(), Some("2025-03-01"));
                assert_eq!(snap.assignee_ids(), vec!["m1".to_string(), "m2".to_string()]);
                assert_eq!(snap.trigger_type, "Task_Updated");
                assert!(snap.triggered_time.unwrap().starts_with("2023-11-14"));
                assert!(!snap.is_synced);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_change_moves_snapshot_to_new_status() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                store_entry(conn, Some(1), &body("T1", "Fix login", "Open"))?;
                store_entry(conn, Some(2), &body("T1", "Fix login", "Done"))?;
                let snap = repository::find_snapshot_by_external_id(conn, "T1")?.unwrap();
                let status = repository::get_status(conn, snap.status_id.unwrap())?.unwrap();
                assert_eq!(status.name, "Done");
                assert_eq!(repository::list_statuses(conn)?.len(), 2);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_entries_without_task_id_are_ignored() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let no_payload: LogEntryBody =
                    serde_json::from_value(json!({"triggerType": "Board_Created"})).unwrap();
                let no_id: LogEntryBody =
                    serde_json::from_value(json!({"payload": {"title": "orphan"}})).unwrap();
                assert_eq!(store_entry(conn, Some(1), &no_payload)?, StoreOutcome::Ignored);
                assert_eq!(store_entry(conn, Some(2), &no_id)?, StoreOutcome::Ignored);
                assert_eq!(repository::mirror_counts(conn)?.tasks, 0);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
