use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::ingest::payload::Assignee;

// ── Boards ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalBoard {
    pub board_id: i64,
    pub external_id: String,
    pub name: String,
    pub url: Option<String>,
    pub mapped_project_id: Option<i64>,
}

fn board_from_row(row: &Row<'_>) -> Result<ExternalBoard, rusqlite::Error> {
    Ok(ExternalBoard {
        board_id: row.get(0)?,
        external_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        mapped_project_id: row.get(4)?,
    })
}

/// Insert the board on first sighting; an existing row keeps its name and url.
pub fn get_or_create_board(
    conn: &Connection,
    external_id: &str,
    name: &str,
    url: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO ext_boards (external_id, name, url, created_at, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'), datetime('now'))
         ON CONFLICT(external_id) DO NOTHING",
        params![external_id, name, url],
    )?;
    conn.query_row(
        "SELECT board_id FROM ext_boards WHERE external_id = ?1",
        params![external_id],
        |row| row.get(0),
    )
}

pub fn get_board(conn: &Connection, board_id: i64) -> Result<Option<ExternalBoard>, rusqlite::Error> {
    conn.query_row(
        "SELECT board_id, external_id, name, url, mapped_project_id
         FROM ext_boards WHERE board_id = ?1",
        params![board_id],
        board_from_row,
    )
    .optional()
}

pub fn list_boards(conn: &Connection) -> Result<Vec<ExternalBoard>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT board_id, external_id, name, url, mapped_project_id
         FROM ext_boards ORDER BY name, board_id",
    )?;
    let rows = stmt.query_map([], board_from_row)?;
    rows.collect()
}

pub fn set_board_mapping(
    conn: &Connection,
    board_id: i64,
    project_id: Option<i64>,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE ext_boards SET mapped_project_id = ?2, updated_at = datetime('now')
         WHERE board_id = ?1",
        params![board_id, project_id],
    )
}

// ── Sections ───────────────────────────────────────────────────────

pub fn get_or_create_section(
    conn: &Connection,
    external_id: &str,
    name: &str,
    board_id: i64,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO ext_sections (external_id, name, board_id, created_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(external_id) DO NOTHING",
        params![external_id, name, board_id],
    )?;
    conn.query_row(
        "SELECT section_id FROM ext_sections WHERE external_id = ?1",
        params![external_id],
        |row| row.get(0),
    )
}

// ── Statuses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalStatus {
    pub status_id: i64,
    pub external_id: String,
    pub name: String,
    pub color_type: String,
    pub mapping_type: String,
    pub board_id: Option<i64>,
    pub mapped_status_id: Option<i64>,
}

fn status_from_row(row: &Row<'_>) -> Result<ExternalStatus, rusqlite::Error> {
    Ok(ExternalStatus {
        status_id: row.get(0)?,
        external_id: row.get(1)?,
        name: row.get(2)?,
        color_type: row.get(3)?,
        mapping_type: row.get(4)?,
        board_id: row.get(5)?,
        mapped_status_id: row.get(6)?,
    })
}

pub fn get_or_create_status(
    conn: &Connection,
    external_id: &str,
    name: &str,
    color_type: &str,
    mapping_type: &str,
    board_id: Option<i64>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO ext_statuses (external_id, name, color_type, mapping_type, board_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
         ON CONFLICT(external_id) DO NOTHING",
        params![external_id, name, color_type, mapping_type, board_id],
    )?;
    conn.query_row(
        "SELECT status_id FROM ext_statuses WHERE external_id = ?1",
        params![external_id],
        |row| row.get(0),
    )
}

pub fn get_status(conn: &Connection, status_id: i64) -> Result<Option<ExternalStatus>, rusqlite::Error> {
    conn.query_row(
        "SELECT status_id, external_id, name, color_type, mapping_type, board_id, mapped_status_id
         FROM ext_statuses WHERE status_id = ?1",
        params![status_id],
        status_from_row,
    )
    .optional()
}

pub fn list_statuses(conn: &Connection) -> Result<Vec<ExternalStatus>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT status_id, external_id, name, color_type, mapping_type, board_id, mapped_status_id
         FROM ext_statuses ORDER BY name, status_id",
    )?;
    let rows = stmt.query_map([], status_from_row)?;
    rows.collect()
}

/// Map every status sharing `name` (exact match, any board). Returns rows touched.
pub fn set_status_mapping_by_name(
    conn: &Connection,
    name: &str,
    mapped_status_id: Option<i64>,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE ext_statuses SET mapped_status_id = ?2 WHERE name = ?1",
        params![name, mapped_status_id],
    )
}

pub fn set_status_mapping(
    conn: &Connection,
    status_id: i64,
    mapped_status_id: Option<i64>,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE ext_statuses SET mapped_status_id = ?2 WHERE status_id = ?1",
        params![status_id, mapped_status_id],
    )
}

/// Distinct names of statuses that have no local mapping yet.
pub fn list_unmapped_status_names(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT name FROM ext_statuses WHERE mapped_status_id IS NULL ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

// ── Members ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalMember {
    pub member_id: i64,
    pub external_id: String,
    pub name: String,
    pub email: String,
    pub profile_url: Option<String>,
    pub mapped_member_id: Option<i64>,
}

fn member_from_row(row: &Row<'_>) -> Result<ExternalMember, rusqlite::Error> {
    Ok(ExternalMember {
        member_id: row.get(0)?,
        external_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        profile_url: row.get(4)?,
        mapped_member_id: row.get(5)?,
    })
}

pub fn get_or_create_member(
    conn: &Connection,
    external_id: &str,
    name: &str,
    email: &str,
    profile_url: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO ext_members (external_id, name, email, profile_url, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'), datetime('now'))
         ON CONFLICT(external_id) DO NOTHING",
        params![external_id, name, email, profile_url],
    )?;
    conn.query_row(
        "SELECT member_id FROM ext_members WHERE external_id = ?1",
        params![external_id],
        |row| row.get(0),
    )
}

pub fn get_member(conn: &Connection, member_id: i64) -> Result<Option<ExternalMember>, rusqlite::Error> {
    conn.query_row(
        "SELECT member_id, external_id, name, email, profile_url, mapped_member_id
         FROM ext_members WHERE member_id = ?1",
        params![member_id],
        member_from_row,
    )
    .optional()
}

pub fn list_members(conn: &Connection) -> Result<Vec<ExternalMember>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT member_id, external_id, name, email, profile_url, mapped_member_id
         FROM ext_members ORDER BY name, member_id",
    )?;
    let rows = stmt.query_map([], member_from_row)?;
    rows.collect()
}

pub fn set_member_mapping(
    conn: &Connection,
    member_id: i64,
    mapped_member_id: Option<i64>,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE ext_members SET mapped_member_id = ?2, updated_at = datetime('now')
         WHERE member_id = ?1",
        params![member_id, mapped_member_id],
    )
}

/// Local member ids mapped from the given remote user ids. Unmapped or
/// unknown ids are skipped.
pub fn mapped_member_ids(
    conn: &Connection,
    external_ids: &[String],
) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT mapped_member_id FROM ext_members
         WHERE external_id = ?1 AND mapped_member_id IS NOT NULL",
    )?;
    let mut ids = Vec::new();
    for external_id in external_ids {
        if let Some(id) = stmt
            .query_row(params![external_id], |row| row.get::<_, i64>(0))
            .optional()?
        {
            ids.push(id);
        }
    }
    Ok(ids)
}

// ── Task snapshots ─────────────────────────────────────────────────

/// Everything the parser derives from one log entry.
#[derive(Debug, Clone, Default)]
pub struct SnapshotRecord {
    pub external_task_id: String,
    pub internal_task_id: String,
    pub title: String,
    pub description: String,
    pub url: Option<String>,
    pub board_id: Option<i64>,
    pub section_id: Option<i64>,
    pub status_id: Option<i64>,
    pub priority_id: String,
    pub priority_name: String,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub assignees_json: String,
    pub custom_fields_json: String,
    pub category_name: String,
    pub user_story: String,
    pub checklists_json: String,
    pub tags_json: String,
    pub attachments_json: String,
    pub trigger_type: String,
    pub triggered_by_id: String,
    pub triggered_by_name: String,
    pub triggered_by_email: String,
    pub triggered_time: Option<String>,
    pub triggered_time_millis: Option<i64>,
    pub scope_id: String,
    pub scope_name: String,
    pub raw_payload: String,
    pub log_entry_id: Option<i64>,
}

/// Upsert keyed by `external_task_id`. Sync state (`is_synced`,
/// `synced_task_id`, `last_sync_at`) is never touched here. Returns
/// `(snapshot_id, created)`.
pub fn upsert_snapshot(
    conn: &Connection,
    rec: &SnapshotRecord,
) -> Result<(i64, bool), rusqlite::Error> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT snapshot_id FROM task_snapshots WHERE external_task_id = ?1",
            params![rec.external_task_id],
            |row| row.get(0),
        )
        .optional()?;

    let values = params![
        rec.external_task_id,
        rec.internal_task_id,
        rec.title,
        rec.description,
        rec.url,
        rec.board_id,
        rec.section_id,
        rec.status_id,
        rec.priority_id,
        rec.priority_name,
        rec.due_date,
        rec.start_date,
        rec.assignees_json,
        rec.custom_fields_json,
        rec.category_name,
        rec.user_story,
        rec.checklists_json,
        rec.tags_json,
        rec.attachments_json,
        rec.trigger_type,
        rec.triggered_by_id,
        rec.triggered_by_name,
        rec.triggered_by_email,
        rec.triggered_time,
        rec.triggered_time_millis,
        rec.scope_id,
        rec.scope_name,
        rec.raw_payload,
        rec.log_entry_id,
    ];

    match existing {
        Some(snapshot_id) => {
            conn.execute(
                "UPDATE task_snapshots SET
                    internal_task_id = ?2, title = ?3, description = ?4, url = ?5,
                    board_id = ?6, section_id = ?7, status_id = ?8,
                    priority_id = ?9, priority_name = ?10, due_date = ?11, start_date = ?12,
                    assignees_json = ?13, custom_fields_json = ?14, category_name = ?15,
                    user_story = ?16, checklists_json = ?17, tags_json = ?18,
                    attachments_json = ?19, trigger_type = ?20, triggered_by_id = ?21,
                    triggered_by_name = ?22, triggered_by_email = ?23, triggered_time = ?24,
                    triggered_time_millis = ?25, scope_id = ?26, scope_name = ?27,
                    raw_payload = ?28, log_entry_id = ?29, updated_at = datetime('now')
                 WHERE external_task_id = ?1",
                values,
            )?;
            Ok((snapshot_id, false))
        }
        None => {
            conn.execute(
                "INSERT INTO task_snapshots (
                    external_task_id, internal_task_id, title, description, url,
                    board_id, section_id, status_id, priority_id, priority_name,
                    due_date, start_date, assignees_json, custom_fields_json, category_name,
                    user_story, checklists_json, tags_json, attachments_json, trigger_type,
                    triggered_by_id, triggered_by_name, triggered_by_email, triggered_time,
                    triggered_time_millis, scope_id, scope_name, raw_payload, log_entry_id,
                    created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29,
                    datetime('now'), datetime('now')
                )",
                values,
            )?;
            Ok((conn.last_insert_rowid(), true))
        }
    }
}

/// Read model of a snapshot, with the fields reconciliation and listings use.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub snapshot_id: i64,
    pub external_task_id: String,
    pub title: String,
    pub description: String,
    pub user_story: String,
    pub category_name: String,
    pub priority_name: String,
    pub url: Option<String>,
    pub board_id: Option<i64>,
    pub section_id: Option<i64>,
    pub status_id: Option<i64>,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub assignees: Vec<Assignee>,
    pub trigger_type: String,
    pub triggered_time: Option<String>,
    pub is_synced: bool,
    pub synced_task_id: Option<i64>,
    pub last_sync_at: Option<String>,
    pub sync_error: String,
}

impl TaskSnapshot {
    /// Remote user ids of the assignees, in payload order.
    pub fn assignee_ids(&self) -> Vec<String> {
        self.assignees.iter().filter_map(|a| a.id.clone()).collect()
    }
}

const SNAPSHOT_COLUMNS: &str = "snapshot_id, external_task_id, title, description, user_story,
    category_name, priority_name, url, board_id, section_id, status_id, due_date, start_date,
    assignees_json, trigger_type, triggered_time, is_synced, synced_task_id, last_sync_at,
    sync_error";

fn snapshot_from_row(row: &Row<'_>) -> Result<TaskSnapshot, rusqlite::Error> {
    let assignees_json: String = row.get(13)?;
    let assignees: Vec<Assignee> = serde_json::from_str(&assignees_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(TaskSnapshot {
        snapshot_id: row.get(0)?,
        external_task_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        user_story: row.get(4)?,
        category_name: row.get(5)?,
        priority_name: row.get(6)?,
        url: row.get(7)?,
        board_id: row.get(8)?,
        section_id: row.get(9)?,
        status_id: row.get(10)?,
        due_date: row.get(11)?,
        start_date: row.get(12)?,
        assignees,
        trigger_type: row.get(14)?,
        triggered_time: row.get(15)?,
        is_synced: row.get::<_, i64>(16)? != 0,
        synced_task_id: row.get(17)?,
        last_sync_at: row.get(18)?,
        sync_error: row.get(19)?,
    })
}

pub fn get_snapshot(conn: &Connection, snapshot_id: i64) -> Result<Option<TaskSnapshot>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SNAPSHOT_COLUMNS} FROM task_snapshots WHERE snapshot_id = ?1"),
        params![snapshot_id],
        snapshot_from_row,
    )
    .optional()
}

pub fn find_snapshot_by_external_id(
    conn: &Connection,
    external_task_id: &str,
) -> Result<Option<TaskSnapshot>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {SNAPSHOT_COLUMNS} FROM task_snapshots WHERE external_task_id = ?1"),
        params![external_task_id],
        snapshot_from_row,
    )
    .optional()
}

/// Filters for listing snapshots. `None` means "any".
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub is_synced: Option<bool>,
    pub board_id: Option<i64>,
    pub trigger_type: Option<String>,
    pub limit: Option<u32>,
}

pub fn list_snapshots(
    conn: &Connection,
    filter: &SnapshotFilter,
) -> Result<Vec<TaskSnapshot>, rusqlite::Error> {
    let mut sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM task_snapshots WHERE 1=1");
    let mut args: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(synced) = filter.is_synced {
        args.push((synced as i64).into());
        sql.push_str(&format!(" AND is_synced = ?{}", args.len()));
    }
    if let Some(board_id) = filter.board_id {
        args.push(board_id.into());
        sql.push_str(&format!(" AND board_id = ?{}", args.len()));
    }
    if let Some(ref trigger_type) = filter.trigger_type {
        args.push(trigger_type.clone().into());
        sql.push_str(&format!(" AND trigger_type = ?{}", args.len()));
    }
    sql.push_str(" ORDER BY triggered_time_millis DESC, snapshot_id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args), snapshot_from_row)?;
    rows.collect()
}

/// Unsynced snapshots whose board and status are both mapped. Snapshots
/// without a status are left to an explicit single-task sync.
pub fn list_reconcilable_snapshot_ids(conn: &Connection) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT s.snapshot_id FROM task_snapshots s
         JOIN ext_boards b ON b.board_id = s.board_id
         JOIN ext_statuses st ON st.status_id = s.status_id
         WHERE s.is_synced = 0
           AND b.mapped_project_id IS NOT NULL
           AND st.mapped_status_id IS NOT NULL
         ORDER BY s.snapshot_id",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// `(snapshot_id, task_id)` for every synced snapshot still linked to a task.
pub fn list_synced_links(conn: &Connection) -> Result<Vec<(i64, i64)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT snapshot_id, synced_task_id FROM task_snapshots
         WHERE is_synced = 1 AND synced_task_id IS NOT NULL
         ORDER BY snapshot_id",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

pub fn mark_snapshot_synced(
    conn: &Connection,
    snapshot_id: i64,
    task_id: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE task_snapshots SET
            is_synced = 1, synced_task_id = ?2, last_sync_at = datetime('now'), sync_error = ''
         WHERE snapshot_id = ?1",
        params![snapshot_id, task_id],
    )?;
    Ok(())
}

pub fn record_snapshot_error(
    conn: &Connection,
    snapshot_id: i64,
    message: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE task_snapshots SET sync_error = ?2 WHERE snapshot_id = ?1",
        params![snapshot_id, message],
    )?;
    Ok(())
}

// ── Processed log markers ──────────────────────────────────────────

pub fn is_log_entry_processed(conn: &Connection, log_entry_id: i64) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM processed_log_entries WHERE log_entry_id = ?1)",
        params![log_entry_id],
        |row| row.get(0),
    )
}

pub fn mark_log_entry_processed(conn: &Connection, log_entry_id: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO processed_log_entries (log_entry_id, processed_at)
         VALUES (?1, datetime('now'))",
        params![log_entry_id],
    )?;
    Ok(())
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn delete_config(conn: &Connection, key: &str) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync runs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunRecord {
    pub id: i64,
    pub run_kind: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub items_processed: i64,
    pub items_created: i64,
    pub items_updated: i64,
    pub items_failed: i64,
    pub error_message: String,
    pub details: serde_json::Value,
}

/// Final counters written when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

pub fn insert_sync_run(conn: &Connection, run_kind: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (run_kind, status, started_at) VALUES (?1, 'running', datetime('now'))",
        params![run_kind],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_sync_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    counts: RunCounts,
    error_message: Option<&str>,
    details: &serde_json::Value,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?2, completed_at = datetime('now'),
            items_processed = ?3, items_created = ?4, items_updated = ?5, items_failed = ?6,
            error_message = ?7, details = ?8
         WHERE id = ?1",
        params![
            run_id,
            status,
            counts.processed as i64,
            counts.created as i64,
            counts.updated as i64,
            counts.failed as i64,
            error_message.unwrap_or(""),
            details.to_string(),
        ],
    )?;
    Ok(())
}

pub fn list_recent_sync_runs(conn: &Connection, limit: u32) -> Result<Vec<SyncRunRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, run_kind, status, started_at, completed_at, items_processed,
                items_created, items_updated, items_failed, error_message, details
         FROM sync_runs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        let details: String = row.get(10)?;
        Ok(SyncRunRecord {
            id: row.get(0)?,
            run_kind: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            items_processed: row.get(5)?,
            items_created: row.get(6)?,
            items_updated: row.get(7)?,
            items_failed: row.get(8)?,
            error_message: row.get(9)?,
            details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        })
    })?;
    rows.collect()
}

// ── Counts & reset ─────────────────────────────────────────────────

/// Row counts of the mirror tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorCounts {
    pub tasks: i64,
    pub boards: i64,
    pub sections: i64,
    pub statuses: i64,
    pub members: i64,
    pub sync_logs: i64,
    pub processed_markers: i64,
}

fn count(conn: &Connection, sql: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(sql, [], |row| row.get(0))
}

pub fn mirror_counts(conn: &Connection) -> Result<MirrorCounts, rusqlite::Error> {
    Ok(MirrorCounts {
        tasks: count(conn, "SELECT COUNT(*) FROM task_snapshots")?,
        boards: count(conn, "SELECT COUNT(*) FROM ext_boards")?,
        sections: count(conn, "SELECT COUNT(*) FROM ext_sections")?,
        statuses: count(conn, "SELECT COUNT(*) FROM ext_statuses")?,
        members: count(conn, "SELECT COUNT(*) FROM ext_members")?,
        sync_logs: count(conn, "SELECT COUNT(*) FROM sync_runs")?,
        processed_markers: count(conn, "SELECT COUNT(*) FROM processed_log_entries")?,
    })
}

/// Mapping coverage used by the stats view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub total: i64,
    pub mapped: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotCounts {
    pub total: i64,
    pub synced: i64,
    pub unsynced: i64,
}

pub fn board_coverage(conn: &Connection) -> Result<Coverage, rusqlite::Error> {
    Ok(Coverage {
        total: count(conn, "SELECT COUNT(*) FROM ext_boards")?,
        mapped: count(
            conn,
            "SELECT COUNT(*) FROM ext_boards WHERE mapped_project_id IS NOT NULL",
        )?,
    })
}

/// Statuses are counted by distinct name, since a mapping applies per name.
pub fn status_coverage(conn: &Connection) -> Result<Coverage, rusqlite::Error> {
    Ok(Coverage {
        total: count(conn, "SELECT COUNT(DISTINCT name) FROM ext_statuses")?,
        mapped: count(
            conn,
            "SELECT COUNT(DISTINCT name) FROM ext_statuses WHERE mapped_status_id IS NOT NULL",
        )?,
    })
}

pub fn member_coverage(conn: &Connection) -> Result<Coverage, rusqlite::Error> {
    Ok(Coverage {
        total: count(conn, "SELECT COUNT(*) FROM ext_members")?,
        mapped: count(
            conn,
            "SELECT COUNT(*) FROM ext_members WHERE mapped_member_id IS NOT NULL",
        )?,
    })
}

pub fn snapshot_counts(conn: &Connection) -> Result<SnapshotCounts, rusqlite::Error> {
    Ok(SnapshotCounts {
        total: count(conn, "SELECT COUNT(*) FROM task_snapshots")?,
        synced: count(conn, "SELECT COUNT(*) FROM task_snapshots WHERE is_synced = 1")?,
        unsynced: count(conn, "SELECT COUNT(*) FROM task_snapshots WHERE is_synced = 0")?,
    })
}

/// Delete every mirror row. Local tasks are not touched.
pub fn delete_mirror(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "DELETE FROM task_snapshots;
         DELETE FROM ext_sections;
         DELETE FROM ext_statuses;
         DELETE FROM ext_members;
         DELETE FROM ext_boards;
         DELETE FROM sync_runs;
         DELETE FROM processed_log_entries;",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "log_offset", "200")?;
                assert_eq!(get_config(conn, "log_offset")?, Some("200".to_string()));
                set_config(conn, "log_offset", "300")?;
                assert_eq!(get_config(conn, "log_offset")?, Some("300".to_string()));
                assert_eq!(get_config(conn, "missing")?, None);
                assert_eq!(list_config(conn)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_board_get_or_create_keeps_first_name() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let a = get_or_create_board(conn, "B1", "Platform", Some("https://b/1"))?;
                let b = get_or_create_board(conn, "B1", "Renamed", None)?;
                assert_eq!(a, b);
                let board = get_board(conn, a)?.unwrap();
                assert_eq!(board.name, "Platform");
                assert_eq!(board.url.as_deref(), Some("https://b/1"));
                assert_eq!(list_boards(conn)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_mapping_by_name_spans_boards() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let b1 = get_or_create_board(conn, "B1", "One", None)?;
                let b2 = get_or_create_board(conn, "B2", "Two", None)?;
                get_or_create_status(conn, "S1", "Done", "", "", Some(b1))?;
                get_or_create_status(conn, "S2", "Done", "", "", Some(b2))?;
                get_or_create_status(conn, "S3", "Open", "", "", Some(b2))?;
                let local = crate::storage::local::insert_task_status(conn, "Done", 1, false)?;

                assert_eq!(set_status_mapping_by_name(conn, "Done", Some(local))?, 2);
                assert_eq!(list_unmapped_status_names(conn)?, vec!["Open".to_string()]);
                let cov = status_coverage(conn)?;
                assert_eq!(cov, Coverage { total: 2, mapped: 1 });
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_upsert_preserves_sync_state() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let mut rec = SnapshotRecord {
                    external_task_id: "T1".into(),
                    title: "First".into(),
                    assignees_json: "[]".into(),
                    custom_fields_json: "{}".into(),
                    checklists_json: "[]".into(),
                    tags_json: "[]".into(),
                    attachments_json: "[]".into(),
                    raw_payload: "{}".into(),
                    ..Default::default()
                };
                let (id, created) = upsert_snapshot(conn, &rec)?;
                assert!(created);

                let project = crate::storage::local::insert_project(conn, "P", "p", None)?;
                let task = crate::storage::local::insert_task(
                    conn,
                    project,
                    &crate::storage::local::TaskFields {
                        title: "First".into(),
                        ..Default::default()
                    },
                )?;
                mark_snapshot_synced(conn, id, task)?;

                rec.title = "Second".into();
                let (same_id, created) = upsert_snapshot(conn, &rec)?;
                assert_eq!(same_id, id);
                assert!(!created);

                let snap = get_snapshot(conn, id)?.unwrap();
                assert_eq!(snap.title, "Second");
                assert!(snap.is_synced);
                assert_eq!(snap.synced_task_id, Some(task));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_processed_marker_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert!(!is_log_entry_processed(conn, 7)?);
                mark_log_entry_processed(conn, 7)?;
                mark_log_entry_processed(conn, 7)?;
                assert!(is_log_entry_processed(conn, 7)?);
                assert_eq!(mirror_counts(conn)?.processed_markers, 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_run_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let id = insert_sync_run(conn, "pull_webhooks")?;
                finish_sync_run(
                    conn,
                    id,
                    "completed",
                    RunCounts {
                        processed: 10,
                        created: 4,
                        updated: 5,
                        failed: 1,
                    },
                    None,
                    &serde_json::json!({"new_offset": 10}),
                )?;
                let runs = list_recent_sync_runs(conn, 5)?;
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].status, "completed");
                assert_eq!(runs[0].items_failed, 1);
                assert_eq!(runs[0].details["new_offset"], 10);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
