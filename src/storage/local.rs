//! Local project-management records the sync engine writes into.
//!
//! These tables belong to the host application; the engine only needs the
//! create/update/lookup operations below.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalProject {
    pub project_id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalStatus {
    pub status_id: i64,
    pub name: String,
    pub sort_order: i64,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalMember {
    pub member_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

impl LocalMember {
    /// "First Last", trimmed; empty parts are skipped.
    pub fn full_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalTask {
    pub task_id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub status_id: Option<i64>,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub external_url: Option<String>,
}

/// Mutable task fields overwritten on every reconciliation.
#[derive(Debug, Clone, Default)]
pub struct TaskFields {
    pub title: String,
    pub description: String,
    pub status_id: Option<i64>,
    pub external_url: Option<String>,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
}

// ── Projects ───────────────────────────────────────────────────────

pub fn insert_project(
    conn: &Connection,
    name: &str,
    slug: &str,
    description: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO projects (name, slug, description, status, visibility, created_at)
         VALUES (?1, ?2, ?3, 'active', 'private', datetime('now'))",
        params![name, slug, description],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn project_slug_exists(conn: &Connection, slug: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM projects WHERE slug = ?1)",
        params![slug],
        |row| row.get(0),
    )
}

pub fn get_project(conn: &Connection, project_id: i64) -> Result<Option<LocalProject>, rusqlite::Error> {
    conn.query_row(
        "SELECT project_id, name, slug FROM projects WHERE project_id = ?1",
        params![project_id],
        |row| {
            Ok(LocalProject {
                project_id: row.get(0)?,
                name: row.get(1)?,
                slug: row.get(2)?,
            })
        },
    )
    .optional()
}

pub fn list_projects(conn: &Connection) -> Result<Vec<LocalProject>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT project_id, name, slug FROM projects ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(LocalProject {
            project_id: row.get(0)?,
            name: row.get(1)?,
            slug: row.get(2)?,
        })
    })?;
    rows.collect()
}

// ── Task statuses ──────────────────────────────────────────────────

fn status_from_row(row: &rusqlite::Row<'_>) -> Result<LocalStatus, rusqlite::Error> {
    Ok(LocalStatus {
        status_id: row.get(0)?,
        name: row.get(1)?,
        sort_order: row.get(2)?,
        is_default: row.get::<_, i64>(3)? != 0,
    })
}

pub fn insert_task_status(
    conn: &Connection,
    name: &str,
    sort_order: i64,
    is_default: bool,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO task_statuses (name, sort_order, is_default) VALUES (?1, ?2, ?3)",
        params![name, sort_order, is_default as i32],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_task_status(conn: &Connection, status_id: i64) -> Result<Option<LocalStatus>, rusqlite::Error> {
    conn.query_row(
        "SELECT status_id, name, sort_order, is_default FROM task_statuses WHERE status_id = ?1",
        params![status_id],
        status_from_row,
    )
    .optional()
}

/// Case-insensitive, whitespace-trimmed name lookup. Lowest id wins on ties.
pub fn find_task_status_by_name(
    conn: &Connection,
    name: &str,
) -> Result<Option<LocalStatus>, rusqlite::Error> {
    conn.query_row(
        "SELECT status_id, name, sort_order, is_default FROM task_statuses
         WHERE lower(trim(name)) = lower(trim(?1))
         ORDER BY status_id LIMIT 1",
        params![name],
        status_from_row,
    )
    .optional()
}

/// The local status flagged as default, if any.
pub fn default_task_status(conn: &Connection) -> Result<Option<LocalStatus>, rusqlite::Error> {
    conn.query_row(
        "SELECT status_id, name, sort_order, is_default FROM task_statuses
         WHERE is_default = 1 AND is_active = 1
         ORDER BY sort_order, status_id LIMIT 1",
        [],
        status_from_row,
    )
    .optional()
}

pub fn count_task_statuses(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM task_statuses", [], |row| row.get(0))
}

pub fn list_task_statuses(conn: &Connection) -> Result<Vec<LocalStatus>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT status_id, name, sort_order, is_default FROM task_statuses
         ORDER BY sort_order, status_id",
    )?;
    let rows = stmt.query_map([], status_from_row)?;
    rows.collect()
}

// ── Members ────────────────────────────────────────────────────────

pub fn insert_member(
    conn: &Connection,
    first_name: Option<&str>,
    last_name: Option<&str>,
    email: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO members (first_name, last_name, email) VALUES (?1, ?2, ?3)",
        params![first_name, last_name, email],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_members(conn: &Connection) -> Result<Vec<LocalMember>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT member_id, first_name, last_name, email FROM members
         WHERE is_active = 1 ORDER BY member_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(LocalMember {
            member_id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            email: row.get(3)?,
        })
    })?;
    rows.collect()
}

pub fn member_exists(conn: &Connection, member_id: i64) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM members WHERE member_id = ?1)",
        params![member_id],
        |row| row.get(0),
    )
}

// ── Tasks ──────────────────────────────────────────────────────────

pub fn get_task(conn: &Connection, task_id: i64) -> Result<Option<LocalTask>, rusqlite::Error> {
    conn.query_row(
        "SELECT task_id, project_id, title, description, status_id,
                due_date, start_date, external_url
         FROM tasks WHERE task_id = ?1",
        params![task_id],
        |row| {
            Ok(LocalTask {
                task_id: row.get(0)?,
                project_id: row.get(1)?,
                title: row.get(2)?,
                description: row.get(3)?,
                status_id: row.get(4)?,
                due_date: row.get(5)?,
                start_date: row.get(6)?,
                external_url: row.get(7)?,
            })
        },
    )
    .optional()
}

/// First task in `project_id` with exactly this title.
pub fn find_task_by_title(
    conn: &Connection,
    project_id: i64,
    title: &str,
) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT task_id FROM tasks WHERE project_id = ?1 AND title = ?2
         ORDER BY task_id LIMIT 1",
        params![project_id, title],
        |row| row.get(0),
    )
    .optional()
}

pub fn insert_task(
    conn: &Connection,
    project_id: i64,
    fields: &TaskFields,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO tasks (
            project_id, title, description, status_id, external_url,
            due_date, start_date, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'), datetime('now'))",
        params![
            project_id,
            fields.title,
            fields.description,
            fields.status_id,
            fields.external_url,
            fields.due_date,
            fields.start_date,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_task(
    conn: &Connection,
    task_id: i64,
    fields: &TaskFields,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE tasks SET
            title = ?2, description = ?3, status_id = ?4, external_url = ?5,
            due_date = ?6, start_date = ?7, updated_at = datetime('now')
         WHERE task_id = ?1",
        params![
            task_id,
            fields.title,
            fields.description,
            fields.status_id,
            fields.external_url,
            fields.due_date,
            fields.start_date,
        ],
    )?;
    Ok(())
}

pub fn set_task_external_url(
    conn: &Connection,
    task_id: i64,
    url: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE tasks SET external_url = ?2, updated_at = datetime('now') WHERE task_id = ?1",
        params![task_id, url],
    )?;
    Ok(())
}

pub fn count_tasks(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
}

// ── Task assignees ─────────────────────────────────────────────────

pub fn list_task_assignees(conn: &Connection, task_id: i64) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT member_id FROM task_assignees WHERE task_id = ?1 ORDER BY member_id",
    )?;
    let rows = stmt.query_map(params![task_id], |row| row.get(0))?;
    rows.collect()
}

pub fn add_task_assignee(
    conn: &Connection,
    task_id: i64,
    member_id: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO task_assignees (task_id, member_id, assigned_at)
         VALUES (?1, ?2, datetime('now'))",
        params![task_id, member_id],
    )?;
    Ok(())
}

pub fn remove_task_assignee(
    conn: &Connection,
    task_id: i64,
    member_id: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "DELETE FROM task_assignees WHERE task_id = ?1 AND member_id = ?2",
        params![task_id, member_id],
    )?;
    Ok(())
}
