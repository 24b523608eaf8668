//! examsync CLI - inspect and drive the offline sync engine
//!
//! Operator tooling for the local attempt store: inspect pending state,
//! force a sync pass, purge finished attempts, and run a scripted attempt
//! against an in-memory remote.

use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::Generator;
use clap_complete::{generate, shells};
use examsync_core::config::EngineConfig;
use examsync_core::controller::ExamClient;
use examsync_core::db::StoreService;
use examsync_core::models::{SyncStatus, ViolationKind};
use examsync_core::remote::{Connectivity, HttpRemoteStore, MemoryRemote, SharedRemote};
use examsync_core::session::{SessionConfig, SessionEvent};
use examsync_core::sync::SyncEvent;
use examsync_core::SessionId;
use serde::Serialize;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "examsync")]
#[command(about = "Inspect and drive the local attempt store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to the local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what is waiting to be synced
    Status {
        /// Limit the report to one attempt
        #[arg(long, value_name = "SESSION_ID")]
        session: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync pass against the configured remote
    Sync,
    /// Delete all local records of one attempt
    Purge {
        /// Attempt to purge
        session: String,
    },
    /// Run a scripted attempt against an in-memory remote
    Simulate {
        /// Attempt duration in (simulated) seconds
        #[arg(long, default_value = "10")]
        duration: u32,
        /// Number of answer fields to fill in
        #[arg(long, default_value = "3")]
        fields: usize,
        /// Real milliseconds per simulated second
        #[arg(long, default_value = "50")]
        tick_ms: u64,
        /// Fail this many remote calls before recovering
        #[arg(long, default_value = "0")]
        flaky: u32,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] examsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
    #[error(
        "Sync is not configured. Set EXAMSYNC_API_URL (and optionally EXAMSYNC_API_TOKEN) to enable `examsync sync`."
    )]
    SyncNotConfigured,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("examsync=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Status { session, json } => {
            run_status(session.as_deref(), json, &db_path).await?;
        }
        Commands::Sync => run_sync(&db_path).await?,
        Commands::Purge { session } => run_purge(&session, &db_path).await?,
        Commands::Simulate {
            duration,
            fields,
            tick_ms,
            flaky,
        } => run_simulate(duration, fields, tick_ms, flaky).await?,
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    durable: bool,
    pending_drafts: usize,
    queued_mutations: usize,
    queue: Vec<QueueItem>,
    session: Option<SessionReport>,
}

#[derive(Debug, Serialize)]
struct QueueItem {
    id: i64,
    collection: String,
    retries: u32,
    last_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionReport {
    session_id: String,
    drafts: Vec<DraftLine>,
    elapsed_seconds: Option<u32>,
    synced_elapsed_seconds: Option<u32>,
    tab_switches: u32,
    paste_attempts: u32,
}

#[derive(Debug, Serialize)]
struct DraftLine {
    field_id: String,
    status: SyncStatus,
    blank: bool,
}

async fn run_status(
    session: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = StoreService::open(db_path)?;
    let session_id = session.map(parse_session_id).transpose()?;
    let report = status_report(&store, session_id).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_status_lines(&report) {
            println!("{line}");
        }
    }

    Ok(())
}

async fn status_report(
    store: &StoreService,
    session_id: Option<SessionId>,
) -> Result<StatusReport, CliError> {
    let pending = store.drafts_needing_sync().await?;
    let queue = store.list_queue().await?;

    let session = match session_id {
        None => None,
        Some(session_id) => {
            let drafts = store
                .drafts_by_session(session_id)
                .await?
                .into_iter()
                .map(|record| DraftLine {
                    field_id: record.key.field_id.to_string(),
                    status: record.status,
                    blank: record.payload.is_blank(),
                })
                .collect();
            let checkpoint = store.get_checkpoint(session_id).await?;
            let counts = examsync_core::models::ViolationCounts::from_events(
                &store.list_violations(session_id).await?,
            );
            Some(SessionReport {
                session_id: session_id.to_string(),
                drafts,
                elapsed_seconds: checkpoint.as_ref().map(|c| c.elapsed_seconds),
                synced_elapsed_seconds: checkpoint.as_ref().map(|c| c.synced_elapsed_seconds),
                tab_switches: counts.tab_switches,
                paste_attempts: counts.paste_attempts,
            })
        }
    };

    Ok(StatusReport {
        durable: store.is_durable().await,
        pending_drafts: pending.len(),
        queued_mutations: queue.len(),
        queue: queue
            .into_iter()
            .map(|item| QueueItem {
                id: item.id,
                collection: item.payload.collection().to_string(),
                retries: item.retries,
                last_error: item.last_error,
            })
            .collect(),
        session,
    })
}

fn format_status_lines(report: &StatusReport) -> Vec<String> {
    let mut lines = vec![
        format!(
            "store: {}",
            if report.durable { "durable" } else { "in-memory" }
        ),
        format!("pending drafts: {}", report.pending_drafts),
        format!("queued mutations: {}", report.queued_mutations),
    ];

    for item in &report.queue {
        let error = item.last_error.as_deref().unwrap_or("-");
        lines.push(format!(
            "  #{} {} retries={} last_error={}",
            item.id, item.collection, item.retries, error
        ));
    }

    if let Some(session) = &report.session {
        lines.push(format!("attempt {}", session.session_id));
        if let Some(elapsed) = session.elapsed_seconds {
            let synced = session.synced_elapsed_seconds.unwrap_or(0);
            lines.push(format!("  elapsed: {elapsed}s (synced through {synced}s)"));
        }
        lines.push(format!(
            "  violations: {} tab switches, {} paste attempts",
            session.tab_switches, session.paste_attempts
        ));
        for draft in &session.drafts {
            let blank = if draft.blank { " (blank)" } else { "" };
            lines.push(format!(
                "  field {} {:?}{blank}",
                draft.field_id, draft.status
            ));
        }
    }

    lines
}

async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let remote = remote_from_env()?;
    let store = StoreService::open(db_path)?;
    tracing::info!(db = %db_path.display(), "running manual sync pass");
    let client = ExamClient::new(
        store,
        remote,
        Connectivity::new(true),
        EngineConfig::default(),
    );

    let mut events = client.engine().subscribe();
    let summary = client.engine().sync().await?;

    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::DraftFailed { key, error } => {
                eprintln!("draft {}/{} failed: {error}", key.session_id, key.field_id);
            }
            SyncEvent::DeadLettered {
                id,
                collection,
                attempts,
            } => {
                eprintln!("dropped queue item #{id} ({collection}) after {attempts} attempts");
            }
            _ => {}
        }
    }

    println!(
        "synced {} drafts, applied {} mutations ({} failed, {} dropped)",
        summary.drafts_synced,
        summary.mutations_applied,
        summary.drafts_failed + summary.mutations_failed,
        summary.dead_lettered
    );
    Ok(())
}

async fn run_purge(session: &str, db_path: &Path) -> Result<(), CliError> {
    let session_id = parse_session_id(session)?;
    let store = StoreService::open(db_path)?;
    store.purge_session(session_id).await?;
    println!("{session_id}");
    Ok(())
}

/// A scripted attempt: fill in every field, switch tabs once halfway
/// through, and let the clock run out into an auto-submit.
async fn run_simulate(
    duration: u32,
    fields: usize,
    tick_ms: u64,
    flaky: u32,
) -> Result<(), CliError> {
    let remote = Arc::new(MemoryRemote::new());
    if flaky > 0 {
        remote.fail_next(flaky);
    }

    let store = StoreService::in_memory()?;
    let config = EngineConfig::default()
        .with_debounce(Duration::from_millis(tick_ms))
        .with_sync_interval(Duration::from_millis(tick_ms * 4));
    let client = ExamClient::new(
        store,
        Arc::clone(&remote) as SharedRemote,
        Connectivity::new(true),
        config,
    );
    client.start();

    let session_id = SessionId::new();
    for index in 0..fields {
        let key = examsync_core::DraftKey::new(session_id, examsync_core::FieldId::new());
        client
            .writer()
            .write(
                key,
                examsync_core::AnswerPayload::text(format!("simulated answer {index}")),
            )?;
    }

    let session_config =
        SessionConfig::new(session_id, "simulated-exam", Duration::from_secs(u64::from(duration)))
            .with_tick(Duration::from_millis(tick_ms));
    let handle = client.begin_session(session_config).await?;
    let mut events = handle.subscribe();

    let violation_at = duration / 2;
    loop {
        match events.recv().await {
            Ok(SessionEvent::Tick {
                elapsed_seconds,
                remaining_seconds,
            }) => {
                println!("tick {elapsed_seconds}s elapsed, {remaining_seconds}s remaining");
                if elapsed_seconds == violation_at {
                    handle.record_violation(ViolationKind::TabSwitch).await;
                }
            }
            Ok(SessionEvent::Started { remaining_seconds }) => {
                println!("attempt started, {remaining_seconds}s on the clock");
            }
            Ok(SessionEvent::CheckpointFlushed { elapsed_seconds }) => {
                println!("checkpoint flushed at {elapsed_seconds}s");
            }
            Ok(SessionEvent::ViolationRecorded { kind, counts }) => {
                println!("violation recorded: {kind:?} (total {})", counts.total());
            }
            Ok(SessionEvent::AutoSubmitStarted) => {
                println!("time expired, auto-submitting");
            }
            Ok(SessionEvent::Submitted) => {
                println!("attempt submitted");
                break;
            }
            Ok(SessionEvent::SubmitFailed { error }) => {
                eprintln!("submit failed: {error}");
                break;
            }
            // A long simulation can outpace the event buffer; skip the gap
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    handle.wait().await;
    client.stop();

    println!(
        "remote saw {} finalize call(s), finalized: {}",
        remote.finalize_calls(),
        remote.is_finalized(session_id)
    );
    Ok(())
}

fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();

    match shell {
        CompletionShell::Bash => generate_for_shell(shells::Bash, &mut command, &mut buffer),
        CompletionShell::Zsh => generate_for_shell(shells::Zsh, &mut command, &mut buffer),
        CompletionShell::Fish => generate_for_shell(shells::Fish, &mut command, &mut buffer),
    }

    if let Some(path) = output_path {
        std::fs::write(path, &buffer)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&buffer)?;
    }

    Ok(())
}

fn generate_for_shell<G: Generator>(
    generator: G,
    command: &mut clap::Command,
    buffer: &mut Vec<u8>,
) {
    generate(generator, command, "examsync", buffer);
}

fn parse_session_id(raw: &str) -> Result<SessionId, CliError> {
    raw.trim()
        .parse::<SessionId>()
        .map_err(|_| CliError::InvalidSessionId(raw.to_string()))
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("EXAMSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("examsync")
        .join("examsync.db")
}

fn remote_from_env() -> Result<SharedRemote, CliError> {
    let url = env::var("EXAMSYNC_API_URL").map_err(|_| CliError::SyncNotConfigured)?;
    if url.is_empty() {
        return Err(CliError::SyncNotConfigured);
    }

    let mut remote = HttpRemoteStore::new(url)?;
    if let Ok(token) = env::var("EXAMSYNC_API_TOKEN") {
        if !token.is_empty() {
            remote = remote.with_auth_token(token);
        }
    }

    Ok(Arc::new(remote))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use examsync_core::db::StoreService;
    use examsync_core::models::{
        AnswerPayload, DraftKey, FieldId, MutationPayload, OperationKind, ProgressDoc, SessionId,
        SyncStatus,
    };
    use pretty_assertions::assert_eq;

    use super::{
        format_status_lines, parse_session_id, resolve_db_path, run_purge, status_report,
        CliError,
    };

    #[test]
    fn parse_session_id_accepts_uuid_and_trims() {
        let id = SessionId::new();
        let parsed = parse_session_id(&format!("  {id} ")).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_session_id_rejects_garbage() {
        assert!(matches!(
            parse_session_id("not-a-uuid"),
            Err(CliError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn explicit_db_path_wins() {
        let explicit = PathBuf::from("/tmp/custom.db");
        assert_eq!(resolve_db_path(Some(explicit.clone())), explicit);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_report_counts_pending_work() {
        let store = StoreService::in_memory().unwrap();
        let session_id = SessionId::new();
        let key = DraftKey::new(session_id, FieldId::new());

        store
            .put_draft(key, &AnswerPayload::text("hello"))
            .await
            .unwrap();
        store
            .enqueue_mutation(
                OperationKind::Update,
                &MutationPayload::Progress(ProgressDoc {
                    session_id,
                    exam_id: "exam-1".into(),
                    elapsed_seconds: 30,
                    updated_at: 0,
                }),
            )
            .await
            .unwrap();

        let report = status_report(&store, Some(session_id)).await.unwrap();
        assert_eq!(report.pending_drafts, 1);
        assert_eq!(report.queued_mutations, 1);
        assert_eq!(report.queue[0].collection, "progress");

        let session = report.session.as_ref().unwrap();
        assert_eq!(session.drafts.len(), 1);
        assert_eq!(session.drafts[0].status, SyncStatus::Pending);
        assert!(!session.drafts[0].blank);

        // Readable without panicking on any field combination
        assert!(!format_status_lines(&report).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn purge_removes_the_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cli-test.db");

        let session_id = SessionId::new();
        let key = DraftKey::new(session_id, FieldId::new());
        {
            let store = StoreService::open(&db_path).unwrap();
            store
                .put_draft(key, &AnswerPayload::text("gone soon"))
                .await
                .unwrap();
        }

        run_purge(&session_id.to_string(), &db_path).await.unwrap();

        let store = StoreService::open(&db_path).unwrap();
        assert!(store.get_draft(key).await.unwrap().is_none());
    }
}
