pub mod parser;
pub mod payload;

use serde::Serialize;
use serde_json::Value;

use crate::client::{Page, RemoteSource};
use crate::error::Result;
use crate::storage::repository;
use crate::storage::Database;
use crate::sync::SyncProgress;

use parser::StoreOutcome;
use payload::{BoardRef, RawLogEntry};

/// Where one pull starts and how much it may take.
#[derive(Debug, Clone, Copy)]
pub struct PullWindow {
    /// Number of log entries to fetch in this pull.
    pub batch_size: u32,
    /// Absolute position in the remote log to start from.
    pub offset: u64,
    /// Page size used against the remote API.
    pub page_size: u32,
}

/// Result of walking one window of the remote log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub total_in_api: u64,
    pub batch_fetched: u64,
    /// Entries handled without error (parsed, ignored or already processed).
    pub processed: u64,
    /// Entries skipped because their log id was already marked processed.
    pub skipped: u64,
    /// Entries that carried no task payload.
    pub ignored: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub offset: u64,
    pub new_offset: u64,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl IngestReport {
    pub fn remaining(&self) -> u64 {
        self.total_in_api.saturating_sub(self.new_offset)
    }
}

enum EntryOutcome {
    AlreadyProcessed,
    Stored(StoreOutcome),
    Failed(String),
}

/// Pull one window of the remote activity log and parse every new entry.
///
/// The remote total is read first; then pages are fetched starting from the
/// page that contains `offset`, trimmed to exactly the window. Entries already
/// marked processed are skipped. A remote failure aborts the pull before any
/// offset is reported, so the caller retries from the same position.
pub async fn pull(
    db: &Database,
    source: &dyn RemoteSource,
    endpoint: &str,
    window: PullWindow,
    progress: &dyn SyncProgress,
) -> Result<IngestReport> {
    let page_size = window.page_size.max(1);
    let total = count_entries(source, endpoint).await?;

    let mut report = IngestReport {
        total_in_api: total,
        offset: window.offset,
        new_offset: window.offset,
        ..Default::default()
    };

    let wanted = u64::from(window.batch_size).min(total.saturating_sub(window.offset)) as usize;
    if wanted == 0 {
        log::info!("No new log entries (offset {} of {total})", window.offset);
        return Ok(report);
    }

    let entries = fetch_window(source, endpoint, window.offset, wanted, page_size).await?;
    report.batch_fetched = entries.len() as u64;
    progress.on_batch_fetched(entries.len(), total);

    let count = entries.len();
    for (i, entry) in entries.into_iter().enumerate() {
        progress.on_entry_progress(i + 1, count);
        match process_entry(db, entry).await? {
            EntryOutcome::AlreadyProcessed => {
                report.processed += 1;
                report.skipped += 1;
            }
            EntryOutcome::Stored(StoreOutcome::Created(_)) => {
                report.processed += 1;
                report.created += 1;
            }
            EntryOutcome::Stored(StoreOutcome::Updated(_)) => {
                report.processed += 1;
                report.updated += 1;
            }
            EntryOutcome::Stored(StoreOutcome::Ignored) => {
                report.processed += 1;
                report.ignored += 1;
            }
            EntryOutcome::Failed(message) => {
                log::warn!("{message}");
                report.failed += 1;
                report.errors.push(message);
            }
        }
    }

    report.new_offset = window.offset + report.batch_fetched;
    report.has_more = report.new_offset < total;
    log::info!(
        "Pulled {} log entries ({} created, {} updated, {} skipped, {} failed); offset {} -> {} of {total}",
        report.batch_fetched,
        report.created,
        report.updated,
        report.skipped,
        report.failed,
        report.offset,
        report.new_offset
    );
    Ok(report)
}

async fn count_entries(source: &dyn RemoteSource, endpoint: &str) -> Result<u64> {
    let params = [
        ("page".to_string(), "1".to_string()),
        ("page_size".to_string(), "1".to_string()),
    ];
    Ok(Page::from_value(source.fetch_page(endpoint, &params).await?)?.count)
}

/// Fetch exactly `wanted` entries starting at absolute position `offset`,
/// or fewer if the remote runs out first.
async fn fetch_window(
    source: &dyn RemoteSource,
    endpoint: &str,
    offset: u64,
    wanted: usize,
    page_size: u32,
) -> Result<Vec<Value>> {
    let mut page = offset / u64::from(page_size) + 1;
    let mut skip = (offset % u64::from(page_size)) as usize;
    let mut collected: Vec<Value> = Vec::with_capacity(wanted);

    while collected.len() < wanted {
        let params = [
            ("page".to_string(), page.to_string()),
            ("page_size".to_string(), page_size.to_string()),
        ];
        let results = Page::from_value(source.fetch_page(endpoint, &params).await?)?.results;
        let short = results.len() < page_size as usize;
        let take = wanted - collected.len();
        collected.extend(results.into_iter().skip(skip).take(take));
        log::debug!("Page {page}: batch so far {}/{wanted}", collected.len());
        if short {
            break;
        }
        skip = 0;
        page += 1;
    }
    Ok(collected)
}

/// Parse one raw entry inside a single transaction: marker check, side
/// entities, snapshot upsert and marker insert commit together.
async fn process_entry(db: &Database, entry: Value) -> Result<EntryOutcome> {
    let raw: RawLogEntry = match serde_json::from_value(entry) {
        Ok(raw) => raw,
        Err(e) => return Ok(EntryOutcome::Failed(format!("Malformed log entry: {e}"))),
    };

    let outcome = db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            if let Some(id) = raw.id {
                if repository::is_log_entry_processed(&tx, id)? {
                    return Ok(EntryOutcome::AlreadyProcessed);
                }
            }
            let body = match raw.body() {
                Ok(body) => body,
                Err(e) => {
                    return Ok(EntryOutcome::Failed(format!(
                        "Log entry {:?} has an undecodable body: {e}",
                        raw.id
                    )))
                }
            };
            let stored = parser::store_entry(&tx, raw.id, &body)?;
            // Non-task entries are left unmarked so a later parser can pick them up.
            if let (Some(id), StoreOutcome::Created(_) | StoreOutcome::Updated(_)) = (raw.id, stored) {
                repository::mark_log_entry_processed(&tx, id)?;
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(EntryOutcome::Stored(stored))
        })
        .await?;
    Ok(outcome)
}

/// Result of an explicit board pull.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BoardPullReport {
    pub fetched: u64,
    pub created: u64,
    pub failed: u64,
}

/// Walk the remote boards collection and get-or-create every board in it.
pub async fn pull_boards(
    db: &Database,
    source: &dyn RemoteSource,
    endpoint: &str,
    page_size: u32,
    max_pages: u32,
) -> Result<BoardPullReport> {
    let items = source
        .fetch_all_pages(endpoint, &[], page_size.max(1), max_pages)
        .await?;

    let mut boards = Vec::with_capacity(items.len());
    let mut failed = 0;
    for item in items.iter() {
        match serde_json::from_value::<BoardRef>(item.clone()) {
            Ok(board) if board.id.is_some() => boards.push(board),
            Ok(_) | Err(_) => {
                log::warn!("Skipping board without an id: {item}");
                failed += 1;
            }
        }
    }

    let fetched = items.len() as u64;
    let created = db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let before = repository::mirror_counts(&tx)?.boards;
            for board in &boards {
                if let Some(id) = board.id.as_deref() {
                    repository::get_or_create_board(
                        &tx,
                        id,
                        board.name.as_deref().unwrap_or_default(),
                        board.url.as_deref().filter(|u| !u.is_empty()),
                    )?;
                }
            }
            let after = repository::mirror_counts(&tx)?.boards;
            tx.commit()?;
            Ok::<_, rusqlite::Error>((after - before) as u64)
        })
        .await?;

    Ok(BoardPullReport {
        fetched,
        created,
        failed,
    })
}
