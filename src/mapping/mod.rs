//! Links between mirrored remote entities and local records.
//!
//! Every operation here is re-runnable: auto-map and fast-track skip
//! entities that already carry a mapping and never delete local rows.

pub mod matcher;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::{local, repository, Database};

pub use matcher::{EmailThenNameMatcher, MemberMatcher};

static RE_NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

const SLUG_MAX: usize = 50;
const SLUG_STEM: usize = 45;

/// Result of a status mapping, which applies to every status sharing the name.
#[derive(Debug, Clone, Serialize)]
pub struct StatusMappingResult {
    pub name: String,
    pub mapped_to: Option<String>,
    pub affected_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoMapStatusesReport {
    pub mapped: u64,
    pub already_mapped: u64,
    pub not_found: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedMember {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoMapMembersReport {
    pub mapped: u64,
    pub already_mapped: u64,
    pub not_found: Vec<UnmatchedMember>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FastTrackProjectsReport {
    pub created: u64,
    pub already_mapped: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FastTrackStatusesReport {
    pub created: u64,
    pub unique_names_processed: u64,
}

// ── Explicit mapping ───────────────────────────────────────────────

/// Link a board to a local project, or clear the link with `None`.
pub async fn map_board(db: &Database, board_id: i64, project_id: Option<i64>) -> Result<()> {
    db.writer()
        .call(move |conn| {
            if repository::get_board(conn, board_id)?.is_none() {
                return Ok(Err(Error::NotFound(format!("board {board_id}"))));
            }
            if let Some(pid) = project_id {
                if local::get_project(conn, pid)?.is_none() {
                    return Ok(Err(Error::NotFound(format!("project {pid}"))));
                }
            }
            repository::set_board_mapping(conn, board_id, project_id)?;
            Ok::<_, rusqlite::Error>(Ok(()))
        })
        .await??;
    log::info!("Board {board_id} mapped to project {project_id:?}");
    Ok(())
}

/// Link a status to a local status. The mapping is applied to every mirrored
/// status with the same name, on any board.
pub async fn map_status(
    db: &Database,
    status_id: i64,
    local_status_id: Option<i64>,
) -> Result<StatusMappingResult> {
    let result = db
        .writer()
        .call(move |conn| {
            let Some(status) = repository::get_status(conn, status_id)? else {
                return Ok(Err(Error::NotFound(format!("status {status_id}"))));
            };
            let mapped_to = match local_status_id {
                Some(id) => match local::get_task_status(conn, id)? {
                    Some(s) => Some(s.name),
                    None => return Ok(Err(Error::NotFound(format!("local status {id}")))),
                },
                None => None,
            };
            let affected_count =
                repository::set_status_mapping_by_name(conn, &status.name, local_status_id)?;
            Ok::<_, rusqlite::Error>(Ok(StatusMappingResult {
                name: status.name,
                mapped_to,
                affected_count,
            }))
        })
        .await??;
    log::info!(
        "Status {:?} mapped to {:?} ({} rows)",
        result.name,
        result.mapped_to,
        result.affected_count
    );
    Ok(result)
}

/// Link a remote member to a local member, or clear the link with `None`.
pub async fn map_member(db: &Database, member_id: i64, local_member_id: Option<i64>) -> Result<()> {
    db.writer()
        .call(move |conn| {
            if repository::get_member(conn, member_id)?.is_none() {
                return Ok(Err(Error::NotFound(format!("member {member_id}"))));
            }
            if let Some(id) = local_member_id {
                if !local::member_exists(conn, id)? {
                    return Ok(Err(Error::NotFound(format!("local member {id}"))));
                }
            }
            repository::set_member_mapping(conn, member_id, local_member_id)?;
            Ok::<_, rusqlite::Error>(Ok(()))
        })
        .await??;
    log::info!("Member {member_id} mapped to {local_member_id:?}");
    Ok(())
}

// ── Heuristic mapping ──────────────────────────────────────────────

/// Map each unmapped status to the local status with the same name
/// (case-insensitive). Names with no local counterpart are reported once.
pub async fn auto_map_statuses(db: &Database) -> Result<AutoMapStatusesReport> {
    let report = db
        .writer()
        .call(|conn| {
            let tx = conn.transaction()?;
            let mut report = AutoMapStatusesReport::default();
            let mut missing = BTreeSet::new();
            for status in repository::list_statuses(&tx)? {
                if status.mapped_status_id.is_some() {
                    report.already_mapped += 1;
                    continue;
                }
                match local::find_task_status_by_name(&tx, &status.name)? {
                    Some(local_status) => {
                        repository::set_status_mapping(&tx, status.status_id, Some(local_status.status_id))?;
                        report.mapped += 1;
                    }
                    None => {
                        missing.insert(status.name.trim().to_string());
                    }
                }
            }
            tx.commit()?;
            report.not_found = missing.into_iter().collect();
            Ok::<_, rusqlite::Error>(report)
        })
        .await?;
    log::info!(
        "Auto-mapped {} statuses ({} already mapped, {} names unmatched)",
        report.mapped,
        report.already_mapped,
        report.not_found.len()
    );
    Ok(report)
}

/// Map each unmapped remote member using `matcher`.
pub async fn auto_map_members(
    db: &Database,
    matcher: std::sync::Arc<dyn MemberMatcher>,
) -> Result<AutoMapMembersReport> {
    let report = db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let candidates = local::list_members(&tx)?;
            let mut report = AutoMapMembersReport::default();
            for member in repository::list_members(&tx)? {
                if member.mapped_member_id.is_some() {
                    report.already_mapped += 1;
                    continue;
                }
                match matcher.find_match(&member, &candidates) {
                    Some(local_id) => {
                        repository::set_member_mapping(&tx, member.member_id, Some(local_id))?;
                        report.mapped += 1;
                    }
                    None => report.not_found.push(UnmatchedMember {
                        name: member.name,
                        email: member.email,
                    }),
                }
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(report)
        })
        .await?;
    log::info!(
        "Auto-mapped {} members ({} already mapped, {} unmatched)",
        report.mapped,
        report.already_mapped,
        report.not_found.len()
    );
    Ok(report)
}

// ── Fast-track ─────────────────────────────────────────────────────

/// Lowercase, collapse every run of non-alphanumerics to `-`, cap at 50 chars.
pub fn slugify(name: &str) -> String {
    let lower = name.to_lowercase();
    let slug = RE_NON_SLUG.replace_all(&lower, "-");
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "project" } else { slug };
    slug[..slug.len().min(SLUG_MAX)].trim_end_matches('-').to_string()
}

fn unique_slug(conn: &Connection, name: &str) -> std::result::Result<String, rusqlite::Error> {
    let base = slugify(name);
    let stem = base[..base.len().min(SLUG_STEM)].trim_end_matches('-').to_string();
    let mut slug = base;
    let mut counter = 1;
    while local::project_slug_exists(conn, &slug)? {
        slug = format!("{stem}-{counter}");
        counter += 1;
    }
    Ok(slug)
}

/// Create a local project named `name` with a free slug derived from it.
pub async fn create_project(db: &Database, name: &str) -> Result<local::LocalProject> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Other("project name must not be empty".into()));
    }
    let project = db
        .writer()
        .call(move |conn| {
            let slug = unique_slug(conn, &name)?;
            let project_id = local::insert_project(conn, &name, &slug, None)?;
            Ok::<_, rusqlite::Error>(local::LocalProject {
                project_id,
                name,
                slug,
            })
        })
        .await?;
    Ok(project)
}

/// Create a local project for every unmapped board and map it.
pub async fn fast_track_projects(db: &Database) -> Result<FastTrackProjectsReport> {
    let report = db
        .writer()
        .call(|conn| {
            let tx = conn.transaction()?;
            let mut report = FastTrackProjectsReport::default();
            for board in repository::list_boards(&tx)? {
                if board.mapped_project_id.is_some() {
                    report.already_mapped += 1;
                    continue;
                }
                let name = if board.name.trim().is_empty() {
                    board.external_id.clone()
                } else {
                    board.name.trim().to_string()
                };
                let slug = unique_slug(&tx, &name)?;
                let project_id = local::insert_project(&tx, &name, &slug, None)?;
                repository::set_board_mapping(&tx, board.board_id, Some(project_id))?;
                log::debug!("Created project {slug} for board {}", board.external_id);
                report.created += 1;
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(report)
        })
        .await?;
    log::info!(
        "Fast-tracked {} projects ({} boards already mapped)",
        report.created,
        report.already_mapped
    );
    Ok(report)
}

/// For each distinct unmapped status name, reuse or create a local status
/// and map every mirrored status with that name to it.
pub async fn fast_track_statuses(db: &Database) -> Result<FastTrackStatusesReport> {
    let report = db
        .writer()
        .call(|conn| {
            let tx = conn.transaction()?;
            let names = repository::list_unmapped_status_names(&tx)?;
            let mut report = FastTrackStatusesReport {
                unique_names_processed: names.len() as u64,
                ..Default::default()
            };
            for name in names {
                let clean = name.trim();
                let local_id = match local::find_task_status_by_name(&tx, clean)? {
                    Some(existing) => existing.status_id,
                    None => {
                        let sort_order = local::count_task_statuses(&tx)? + 1;
                        report.created += 1;
                        local::insert_task_status(&tx, clean, sort_order, false)?
                    }
                };
                repository::set_status_mapping_by_name(&tx, &name, Some(local_id))?;
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(report)
        })
        .await?;
    log::info!(
        "Fast-tracked {} statuses from {} unmapped names",
        report.created,
        report.unique_names_processed
    );
    Ok(report)
}
