use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use boardsync::storage::{local, repository};

#[derive(Parser)]
#[command(name = "boardsync", about = "Mirror a remote task board into the local project store")]
struct Cli {
    /// Database path (default: ~/.boardsync/boardsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Page size for remote API requests (default: 100)
    #[arg(long)]
    page_size: Option<u32>,

    /// Local status for tasks whose remote snapshot has no status
    #[arg(long)]
    default_status: Option<String>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl boardsync::SyncProgress for StderrProgress {
    fn on_batch_fetched(&self, fetched: usize, total_in_api: u64) {
        eprintln!("  Fetched {fetched} log entries ({total_in_api} in remote log)");
    }

    fn on_entry_progress(&self, current: usize, total: usize) {
        if current == total {
            eprint!("\r  Processing entries: {current}/{total}   \n");
        } else {
            eprint!("\r  Processing entries: {current}/{total}   ");
        }
    }

    fn on_reconcile_progress(&self, current: usize, total: usize) {
        if current == total {
            eprint!("\r  Reconciling: {current}/{total}   \n");
        } else {
            eprint!("\r  Reconciling: {current}/{total}   ");
        }
    }

    fn on_run_complete(&self, kind: boardsync::RunKind, counts: &repository::RunCounts) {
        eprintln!(
            "  Done ({}): {} processed, {} failed",
            kind.as_str(),
            counts.processed,
            counts.failed
        );
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Pull the next batch of the remote webhook log
    Pull {
        /// Entries to fetch (default: configured batch size)
        #[arg(long)]
        batch_size: Option<u32>,
        /// Start from this offset instead of the stored cursor
        #[arg(long)]
        offset: Option<u64>,
        /// Reconcile mapped snapshots after ingesting
        #[arg(long)]
        auto_sync: bool,
    },
    /// Pull the board list from the boards endpoint
    PullBoards,
    /// Map a mirrored entity to a local record (omit the target to clear)
    Map {
        #[command(subcommand)]
        target: MapTarget,
    },
    /// Map unmapped entities by name or e-mail
    Automap {
        #[command(subcommand)]
        target: AutomapTarget,
    },
    /// Create local records for every unmapped entity and map them
    FastTrack {
        #[command(subcommand)]
        target: FastTrackTarget,
    },
    /// Reconcile snapshots into local tasks
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },
    /// Recompute assignees of every synced task
    ResyncAssignees,
    /// Copy remote URLs onto linked local tasks
    BackfillLinks,
    /// Show mapping coverage, snapshot counts and recent runs
    Stats,
    /// Delete the whole mirror (local tasks are kept)
    Reset {
        /// Required to actually delete anything
        #[arg(long)]
        confirm: bool,
    },
    /// List mirrored entities
    List {
        #[command(subcommand)]
        target: ListTarget,
    },
    /// Manage local projects, statuses and members
    Local {
        #[command(subcommand)]
        target: LocalTarget,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum MapTarget {
    /// Map a board to a local project
    Board { board_id: i64, project_id: Option<i64> },
    /// Map a status (and every status with the same name) to a local status
    Status { status_id: i64, local_status_id: Option<i64> },
    /// Map a remote member to a local member
    Member { member_id: i64, local_member_id: Option<i64> },
}

#[derive(Subcommand)]
enum AutomapTarget {
    Statuses,
    Members,
}

#[derive(Subcommand)]
enum FastTrackTarget {
    Projects,
    Statuses,
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Reconcile one snapshot
    Task { snapshot_id: i64 },
    /// Reconcile every mapped, unsynced snapshot
    All,
}

#[derive(Subcommand)]
enum ListTarget {
    Boards,
    Statuses,
    Members,
    Snapshots {
        /// Only synced snapshots
        #[arg(long, conflicts_with = "unsynced")]
        synced: bool,
        /// Only unsynced snapshots
        #[arg(long)]
        unsynced: bool,
        /// Filter by board id
        #[arg(long)]
        board: Option<i64>,
        /// Filter by trigger type (e.g. task_updated)
        #[arg(long)]
        trigger_type: Option<String>,
        /// Maximum results
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum LocalTarget {
    Project {
        #[command(subcommand)]
        action: LocalProjectAction,
    },
    Status {
        #[command(subcommand)]
        action: LocalStatusAction,
    },
    Member {
        #[command(subcommand)]
        action: LocalMemberAction,
    },
}

#[derive(Subcommand)]
enum LocalProjectAction {
    Add { name: String },
    List,
}

#[derive(Subcommand)]
enum LocalStatusAction {
    Add {
        name: String,
        /// Use as the fallback for snapshots without a status
        #[arg(long)]
        default: bool,
    },
    List,
}

#[derive(Subcommand)]
enum LocalMemberAction {
    Add {
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => boardsync::Database::open_at(path).await?,
        None => boardsync::Database::open().await?,
    };

    let mut config = boardsync::SyncConfig::load(&db).await?;
    if let Some(ps) = cli.page_size {
        anyhow::ensure!(ps > 0, "--page-size must be a positive integer");
        config.page_size = ps;
    }
    if let Some(name) = cli.default_status.filter(|n| !n.trim().is_empty()) {
        config.default_status = Some(name.trim().to_string());
    }
    let json = cli.json;

    match cli.command {
        Commands::Pull {
            batch_size,
            offset,
            auto_sync,
        } => {
            anyhow::ensure!(batch_size != Some(0), "--batch-size must be a positive integer");
            let engine = with_client(db, config)?;
            let report = engine
                .pull(batch_size, offset, auto_sync, &StderrProgress)
                .await?;
            if json {
                print_json(&report)?;
            } else {
                print_pull_report(&report);
            }
        }
        Commands::PullBoards => {
            let engine = with_client(db, config)?;
            let report = engine.pull_boards().await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Boards: {} fetched, {} new, {} failed",
                    report.fetched, report.created, report.failed
                );
            }
        }
        Commands::Map { target } => {
            let engine = boardsync::BoardSync::new(db, config);
            handle_map(&engine, target, json).await?;
        }
        Commands::Automap { target } => {
            let engine = boardsync::BoardSync::new(db, config);
            handle_automap(&engine, target, json).await?;
        }
        Commands::FastTrack { target } => {
            let engine = boardsync::BoardSync::new(db, config);
            handle_fast_track(&engine, target, json).await?;
        }
        Commands::Sync { target } => {
            let engine = boardsync::BoardSync::new(db, config);
            handle_sync(&engine, target, json).await?;
        }
        Commands::ResyncAssignees => {
            let engine = boardsync::BoardSync::new(db, config);
            let report = engine.resync_assignees().await?;
            if json {
                print_json(&report)?;
            } else {
                println!("Assignees resynced: {} updated, {} failed", report.updated, report.failed);
            }
        }
        Commands::BackfillLinks => {
            let engine = boardsync::BoardSync::new(db, config);
            let updated = engine.backfill_links().await?;
            if json {
                print_json(&serde_json::json!({ "updated": updated }))?;
            } else {
                println!("Links backfilled: {updated} tasks updated");
            }
        }
        Commands::Stats => {
            let engine = boardsync::BoardSync::new(db, config);
            let stats = engine.stats().await?;
            if json {
                print_json(&stats)?;
            } else {
                print_stats(&stats);
            }
        }
        Commands::Reset { confirm } => {
            let engine = boardsync::BoardSync::new(db, config);
            match engine.reset(confirm).await {
                Ok(report) => {
                    if json {
                        print_json(&report)?;
                    } else {
                        let d = report.deleted;
                        println!("Mirror deleted:");
                        println!("  Snapshots: {}", d.tasks);
                        println!("  Boards:    {}", d.boards);
                        println!("  Sections:  {}", d.sections);
                        println!("  Statuses:  {}", d.statuses);
                        println!("  Members:   {}", d.members);
                        println!("  Runs:      {}", d.sync_logs);
                        println!("  Markers:   {}", d.processed_markers);
                    }
                }
                Err(boardsync::Error::ConfirmationRequired(warning)) => {
                    println!("{warning}");
                    println!("Re-run with --confirm to proceed.");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::List { target } => {
            handle_list(&db, target, json).await?;
        }
        Commands::Local { target } => {
            handle_local(&db, target, json).await?;
        }
        Commands::Config { action } => {
            handle_config(&db, action).await?;
        }
    }

    Ok(())
}

/// Engine wired to the HTTP client. Only pulls need a token.
fn with_client(
    db: boardsync::Database,
    config: boardsync::SyncConfig,
) -> anyhow::Result<boardsync::BoardSync> {
    let client = boardsync::ApiClient::new(config.base_url.as_deref(), config.token()?, config.timeout)?;
    Ok(boardsync::BoardSync::new(db, config).with_source(Arc::new(client)))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_pull_report(report: &boardsync::PullReport) {
    println!("Pull #{}", report.run_id);
    println!(
        "  Window:    {} -> {} of {}",
        report.offset, report.new_offset, report.total_in_api
    );
    println!("  Fetched:   {}", report.batch_fetched);
    println!(
        "  Processed: {} ({} created, {} updated)",
        report.processed, report.created, report.updated
    );
    println!("  Skipped:   {}", report.skipped);
    println!("  Ignored:   {}", report.ignored);
    println!("  Failed:    {}", report.failed);
    if report.auto_synced > 0 || report.auto_sync_failed > 0 {
        println!(
            "  Auto-sync: {} synced, {} failed",
            report.auto_synced, report.auto_sync_failed
        );
    }
    if report.has_more {
        println!("  {} entries remaining. Run 'boardsync pull' again.", report.remaining);
    } else {
        println!("  Log fully consumed.");
    }
}

fn print_stats(stats: &boardsync::StatsReport) {
    println!("Mirror Status");
    println!("  Boards:    {}/{} mapped", stats.boards.mapped, stats.boards.total);
    println!("  Statuses:  {}/{} mapped", stats.statuses.mapped, stats.statuses.total);
    println!("  Members:   {}/{} mapped", stats.members.mapped, stats.members.total);
    println!(
        "  Snapshots: {} ({} synced, {} unsynced)",
        stats.tasks.total, stats.tasks.synced, stats.tasks.unsynced
    );
    println!("  Local tasks: {}", stats.local_tasks);
    println!(
        "  Log:       {} processed, offset {} of {}",
        stats.logs.processed, stats.logs.offset, stats.logs.total_in_api
    );
    if stats.recent_runs.is_empty() {
        println!("  Last run:  never");
    } else {
        println!("  Recent runs:");
        for run in &stats.recent_runs {
            println!(
                "    #{} {} {} ({} processed, {} failed) {}",
                run.id,
                run.run_kind,
                run.status,
                run.items_processed,
                run.items_failed,
                run.completed_at.as_deref().unwrap_or(&run.started_at)
            );
        }
    }
}

async fn handle_map(engine: &boardsync::BoardSync, target: MapTarget, json: bool) -> anyhow::Result<()> {
    match target {
        MapTarget::Board { board_id, project_id } => {
            engine.map_board(board_id, project_id).await?;
            match project_id {
                Some(p) => println!("Board {board_id} mapped to project {p}"),
                None => println!("Board {board_id} unmapped"),
            }
        }
        MapTarget::Status {
            status_id,
            local_status_id,
        } => {
            let result = engine.map_status(status_id, local_status_id).await?;
            if json {
                print_json(&result)?;
            } else {
                match &result.mapped_to {
                    Some(to) => println!(
                        "Status \"{}\" mapped to \"{to}\" ({} statuses updated)",
                        result.name, result.affected_count
                    ),
                    None => println!(
                        "Status \"{}\" unmapped ({} statuses updated)",
                        result.name, result.affected_count
                    ),
                }
            }
        }
        MapTarget::Member {
            member_id,
            local_member_id,
        } => {
            engine.map_member(member_id, local_member_id).await?;
            match local_member_id {
                Some(m) => println!("Member {member_id} mapped to local member {m}"),
                None => println!("Member {member_id} unmapped"),
            }
        }
    }
    Ok(())
}

async fn handle_automap(
    engine: &boardsync::BoardSync,
    target: AutomapTarget,
    json: bool,
) -> anyhow::Result<()> {
    match target {
        AutomapTarget::Statuses => {
            let report = engine.auto_map_statuses().await?;
            if json {
                return print_json(&report);
            }
            println!(
                "Statuses: {} mapped, {} already mapped",
                report.mapped, report.already_mapped
            );
            for name in &report.not_found {
                println!("  No local status named \"{name}\"");
            }
        }
        AutomapTarget::Members => {
            let report = engine.auto_map_members().await?;
            if json {
                return print_json(&report);
            }
            println!(
                "Members: {} mapped, {} already mapped",
                report.mapped, report.already_mapped
            );
            for m in &report.not_found {
                println!("  No local match for {} <{}>", m.name, m.email);
            }
        }
    }
    Ok(())
}

async fn handle_fast_track(
    engine: &boardsync::BoardSync,
    target: FastTrackTarget,
    json: bool,
) -> anyhow::Result<()> {
    match target {
        FastTrackTarget::Projects => {
            let report = engine.fast_track_projects().await?;
            if json {
                return print_json(&report);
            }
            println!(
                "Projects: {} created, {} boards already mapped",
                report.created, report.already_mapped
            );
        }
        FastTrackTarget::Statuses => {
            let report = engine.fast_track_statuses().await?;
            if json {
                return print_json(&report);
            }
            println!(
                "Statuses: {} created from {} unmapped names",
                report.created, report.unique_names_processed
            );
        }
    }
    Ok(())
}

async fn handle_sync(engine: &boardsync::BoardSync, target: SyncTarget, json: bool) -> anyhow::Result<()> {
    match target {
        SyncTarget::Task { snapshot_id } => {
            let outcome = engine.sync_task(snapshot_id).await?;
            if json {
                print_json(&outcome)?;
            } else if outcome.created {
                println!("Snapshot {snapshot_id} created task {}", outcome.task_id);
            } else {
                println!("Snapshot {snapshot_id} updated task {}", outcome.task_id);
            }
        }
        SyncTarget::All => {
            let report = engine.bulk_reconcile(&StderrProgress).await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "Sync #{}: {} of {} synced, {} failed",
                    report.run_id, report.synced, report.total, report.failed
                );
                for e in &report.errors {
                    println!("  {e}");
                }
            }
        }
    }
    Ok(())
}

async fn handle_list(db: &boardsync::Database, target: ListTarget, json: bool) -> anyhow::Result<()> {
    match target {
        ListTarget::Boards => {
            let boards = db.reader().call(|conn| repository::list_boards(conn)).await?;
            if json {
                return print_json(&boards);
            }
            for b in &boards {
                println!(
                    "{:>5}  {:<30} {} -> {}",
                    b.board_id,
                    b.name,
                    b.external_id,
                    mapped_label(b.mapped_project_id)
                );
            }
        }
        ListTarget::Statuses => {
            let statuses = db.reader().call(|conn| repository::list_statuses(conn)).await?;
            if json {
                return print_json(&statuses);
            }
            for s in &statuses {
                println!(
                    "{:>5}  {:<30} board {} -> {}",
                    s.status_id,
                    s.name,
                    mapped_label(s.board_id),
                    mapped_label(s.mapped_status_id)
                );
            }
        }
        ListTarget::Members => {
            let members = db.reader().call(|conn| repository::list_members(conn)).await?;
            if json {
                return print_json(&members);
            }
            for m in &members {
                println!(
                    "{:>5}  {:<30} {:<30} -> {}",
                    m.member_id,
                    m.name,
                    m.email,
                    mapped_label(m.mapped_member_id)
                );
            }
        }
        ListTarget::Snapshots {
            synced,
            unsynced,
            board,
            trigger_type,
            limit,
        } => {
            let filter = repository::SnapshotFilter {
                is_synced: match (synced, unsynced) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                board_id: board,
                trigger_type,
                limit: Some(limit),
            };
            let snapshots = db
                .reader()
                .call(move |conn| repository::list_snapshots(conn, &filter))
                .await?;
            if json {
                return print_json(&snapshots);
            }
            for s in &snapshots {
                let state = if s.is_synced {
                    format!("task {}", mapped_label(s.synced_task_id))
                } else if !s.sync_error.is_empty() {
                    format!("error: {}", s.sync_error)
                } else {
                    "pending".to_string()
                };
                println!("{:>5}  {:<40} {state}", s.snapshot_id, s.title);
            }
        }
    }
    Ok(())
}

fn mapped_label(id: Option<i64>) -> String {
    id.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string())
}

async fn handle_local(db: &boardsync::Database, target: LocalTarget, json: bool) -> anyhow::Result<()> {
    match target {
        LocalTarget::Project { action } => match action {
            LocalProjectAction::Add { name } => {
                let project = boardsync::mapping::create_project(db, &name).await?;
                println!("Created project {} ({})", project.project_id, project.slug);
            }
            LocalProjectAction::List => {
                let projects = db.reader().call(|conn| local::list_projects(conn)).await?;
                if json {
                    return print_json(&projects);
                }
                for p in &projects {
                    println!("{:>5}  {:<30} {}", p.project_id, p.name, p.slug);
                }
            }
        },
        LocalTarget::Status { action } => match action {
            LocalStatusAction::Add { name, default } => {
                let id = db
                    .writer()
                    .call(move |conn| {
                        let sort_order = local::count_task_statuses(conn)? + 1;
                        local::insert_task_status(conn, name.trim(), sort_order, default)
                    })
                    .await?;
                println!("Created status {id}");
            }
            LocalStatusAction::List => {
                let statuses = db.reader().call(|conn| local::list_task_statuses(conn)).await?;
                if json {
                    return print_json(&statuses);
                }
                for s in &statuses {
                    let flag = if s.is_default { " (default)" } else { "" };
                    println!("{:>5}  {}{flag}", s.status_id, s.name);
                }
            }
        },
        LocalTarget::Member { action } => match action {
            LocalMemberAction::Add {
                first_name,
                last_name,
                email,
            } => {
                if first_name.is_none() && last_name.is_none() && email.is_none() {
                    anyhow::bail!("Give at least one of --first-name, --last-name, --email");
                }
                let id = db
                    .writer()
                    .call(move |conn| {
                        local::insert_member(
                            conn,
                            first_name.as_deref(),
                            last_name.as_deref(),
                            email.as_deref(),
                        )
                    })
                    .await?;
                println!("Created member {id}");
            }
            LocalMemberAction::List => {
                let members = db.reader().call(|conn| local::list_members(conn)).await?;
                if json {
                    return print_json(&members);
                }
                for m in &members {
                    println!(
                        "{:>5}  {:<30} {}",
                        m.member_id,
                        m.full_name(),
                        m.email.as_deref().unwrap_or("")
                    );
                }
            }
        },
    }
    Ok(())
}

async fn handle_config(db: &boardsync::Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let val: Option<String> = db
                .reader()
                .call({
                    let key = key.clone();
                    move |conn| repository::get_config(conn, &key)
                })
                .await?;
            match val {
                Some(v) => println!("{key} = {v}"),
                None => println!("{key} is not set"),
            }
        }
        ConfigAction::Set { key, value } => {
            if key == boardsync::config::KEY_PAGE_SIZE || key == boardsync::config::KEY_BATCH_SIZE {
                boardsync::config::parse_positive(&key, &value)?;
            }
            db.writer()
                .call(move |conn| {
                    repository::set_config(conn, &key, &value)?;
                    Ok::<(), rusqlite::Error>(())
                })
                .await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items: Vec<(String, String)> =
                db.reader().call(|conn| repository::list_config(conn)).await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}
