//! Checkup Sync - offline-first clinical record client
//!
//! Wires the local store, remote API client and sync engine together and
//! exposes the command-line front end.

pub mod config;
pub mod db;
pub mod sync;
pub mod transfer;

use clap::{Parser, Subcommand, ValueEnum};
use config::{ClientConfig, ConfigError};
use db::{Database, DbError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sync::{
    archive, ArchiveError, BackgroundScheduler, CollectionCounts, ConnectivityMonitor, EntityKind,
    RemoteApiClient, RemoteError, RemoteStore, SchedulerError, SyncContext, SyncError, SyncManager,
    SyncReport, DEFAULT_PROBE_TIMEOUT,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use transfer::{ReceiverSession, SenderSession, SignalMessage, SignalType, TransferError};

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Remote API error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Usage(String),
}

/// Everything a running client needs, sharing one store and one online flag
#[derive(Clone)]
pub struct SyncEngine {
    ctx: SyncContext,
    manager: SyncManager,
    scheduler: BackgroundScheduler,
    monitor: ConnectivityMonitor,
}

impl SyncEngine {
    pub async fn open(config: &ClientConfig) -> Result<Self, EngineError> {
        config.ensure_data_dir()?;
        log::info!("Database path: {:?}", config.db_path);

        let db = Arc::new(Database::new(config.db_path.clone())?);
        let remote = RemoteApiClient::new(&config.api_url, config.http_timeout, config.probe_timeout)?;
        Self::assemble(db, Arc::new(remote), config.probe_timeout).await
    }

    pub async fn from_parts(db: Arc<Database>, remote: Arc<dyn RemoteStore>) -> Result<Self, EngineError> {
        Self::assemble(db, remote, DEFAULT_PROBE_TIMEOUT).await
    }

    async fn assemble(
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        probe_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let ctx = SyncContext::open(db, remote).await?;
        let manager = SyncManager::new(ctx.clone())?.with_probe_timeout(probe_timeout);

        Ok(Self {
            scheduler: BackgroundScheduler::new(manager.clone()),
            monitor: ConnectivityMonitor::new(manager.clone()),
            ctx,
            manager,
        })
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn db(&self) -> Arc<Database> {
        self.ctx.db().clone()
    }

    /// Startup sync when reachable, then the periodic timer and link watcher
    pub async fn start(&self) -> Option<SyncReport> {
        let report = match self.manager.sync_if_reachable().await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Startup sync failed: {}", e);
                None
            }
        };

        if self.ctx.settings().await.periodic_sync_active() {
            if let Err(e) = self.scheduler.start().await {
                log::warn!("Background scheduler not started: {}", e);
            }
        }
        self.monitor.start();

        report
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.monitor.stop().await;
        if self.scheduler.is_running() {
            self.scheduler.stop().await?;
        }
        self.ctx.shutdown()?;
        log::info!("Sync engine shut down");
        Ok(())
    }
}

// ============================================================================
// Command Line
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "checkup-sync",
    version,
    about = "Offline-first sync client for clinic checkup records"
)]
pub struct Cli {
    // No subcommand runs `status`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run one full sync cycle if the server is reachable
    Sync,
    /// Sync at startup, then keep syncing in the background until Ctrl-C
    Daemon,
    /// Show connectivity, pending changes and sync settings
    Status,
    /// Upload pending local changes without downloading
    Upload,
    /// Refresh every collection from the server without uploading
    Download,
    /// Upload pending changes, then refresh every collection
    Force,
    /// Reset records stalled on an unsynced parent so they are retried
    RetryStalled,
    /// Re-arm queued requests that used up their retries
    RetryFailed,
    /// Set the background sync interval
    Interval {
        /// Seconds between cycles (10-3600)
        secs: u64,
    },
    /// Turn automatic sync on or off
    AutoSync {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Turn local caching on or off; off also stops periodic sync
    Cache {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Write every local record to a JSON file
    Export {
        /// Destination file
        path: PathBuf,
    },
    /// Add records from an exported file; records already present are kept
    Import {
        /// Exported file to read
        path: PathBuf,
    },
    /// Delete every local record, unsynced changes included
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Send all local records to a peer device
    Send,
    /// Receive records from a peer device
    Receive,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn enabled(self) -> bool {
        self == Toggle::On
    }
}

fn print_report(report: &SyncReport) {
    println!("{}", report.summary());
    for stalled in &report.stalled {
        println!(
            "  stalled: {} {} waiting for {} ({} attempts)",
            stalled.kind, stalled.key, stalled.waiting_for, stalled.attempts
        );
    }
    for error in &report.errors {
        println!("  error: {}", error);
    }
}

fn print_counts(label: &str, counts: &CollectionCounts) {
    println!(
        "{} {} records ({} patients, {} checkups, {} types, {} items)",
        label,
        counts.total(),
        counts.patients,
        counts.checkups,
        counts.checkup_types,
        counts.checkup_items
    );
}

/// Manual modes need the server; say so instead of failing record by record
async fn require_reachable(engine: &SyncEngine) -> bool {
    let reachable = engine.manager().probe().await;
    if !reachable {
        println!("Remote API unreachable; pending changes stay queued locally");
    }
    reachable
}

async fn read_signal(expected: SignalType) -> Result<SignalMessage, EngineError> {
    eprintln!("Paste the {} and press Enter:", expected);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| EngineError::Usage(format!("no {} received on stdin", expected)))?;
    Ok(SignalMessage::parse(&line, expected)?)
}

pub async fn execute(engine: &SyncEngine, command: Commands) -> Result<(), EngineError> {
    match command {
        Commands::Sync => match engine.manager().sync_if_reachable().await? {
            Some(report) => print_report(&report),
            None => println!("Remote API unreachable; pending changes stay queued locally"),
        },

        Commands::Daemon => {
            if let Some(report) = engine.start().await {
                print_report(&report);
            }
            log::info!("Running until Ctrl-C");
            tokio::signal::ctrl_c().await?;
        }

        Commands::Status => {
            let pending = engine.manager().pending_summary()?;
            let queue = engine.manager().queue_stats()?;
            let settings = engine.context().settings().await;
            let online = engine.monitor().verify().await;

            println!("online:        {}", online);
            println!(
                "pending:       {} patients, {} checkups, {} items",
                pending.patients, pending.checkups, pending.checkup_items
            );
            println!(
                "queued calls:  {} pending, {} failed ({} exhausted)",
                queue.pending_count, queue.failed_count, queue.exhausted_count
            );
            println!("auto sync:     {}", settings.auto_sync_enabled);
            println!("interval:      {}s", settings.sync_interval_secs);
            println!("local cache:   {}", settings.local_cache_enabled);
            println!("last run:      {}", settings.last_run.as_deref().unwrap_or("never"));
        }

        Commands::Upload => {
            if require_reachable(engine).await {
                let report = engine.manager().upload_pending().await?;
                print_report(&report);
            }
        }

        Commands::Download => {
            if require_reachable(engine).await {
                let report = engine.manager().download_all().await?;
                print_report(&report);
            }
        }

        Commands::Force => {
            if require_reachable(engine).await {
                println!("Upload:");
                print_report(&engine.manager().upload_pending().await?);
                println!("Download:");
                print_report(&engine.manager().download_all().await?);
            }
        }

        Commands::RetryStalled => {
            let count = engine.manager().retry_stalled()?;
            println!("{} stalled records will be retried on the next cycle", count);
        }

        Commands::RetryFailed => {
            let count = engine.manager().retry_failed_requests()?;
            println!("{} failed requests re-queued", count);
        }

        Commands::Interval { secs } => {
            engine.scheduler().update_interval(secs).await?;
            println!("Sync interval set to {}s", secs);
        }

        Commands::AutoSync { state } => {
            engine.scheduler().set_auto_sync(state.enabled()).await?;
            println!("Auto sync {}", if state.enabled() { "enabled" } else { "disabled" });
        }

        Commands::Cache { state } => {
            if state.enabled() {
                engine.monitor().verify().await;
            }
            engine.scheduler().set_local_cache(state.enabled()).await?;
            println!("Local cache {}", if state.enabled() { "enabled" } else { "disabled" });
        }

        Commands::Export { path } => {
            let counts = archive::export_to(&engine.db(), &path)?;
            print_counts(&format!("Exported to {}:", path.display()), &counts);
        }

        Commands::Import { path } => {
            let report = archive::import_from(&engine.db(), &path)?;
            println!(
                "Imported: {} added, {} already present, {} rejected",
                report.total_added(),
                report.total_skipped(),
                report.total_errors()
            );
            for kind in EntityKind::DOWNLOAD_ORDER {
                let stats = report.stats(kind);
                println!(
                    "  {}: +{} ({} skipped, {} errors)",
                    kind, stats.added, stats.skipped, stats.errors
                );
            }
        }

        Commands::Clear { yes } => {
            let (counts, pending) = archive::local_counts(&engine.db())?;
            if !yes {
                print_counts("Would delete", &counts);
                if pending > 0 {
                    println!("WARNING: {} of them are not synced and cannot be recovered", pending);
                }
                return Err(EngineError::Usage("re-run with --yes to delete local data".to_string()));
            }

            let removed = archive::clear_local(&engine.db())?;
            print_counts("Deleted", &removed);
            if pending > 0 {
                println!("{} unsynced changes were discarded", pending);
            }
        }

        Commands::Send => {
            let mut session = SenderSession::new(engine.db());
            let offer = session.create_offer().await?;
            println!("{}", offer.to_json()?);

            let answer = read_signal(SignalType::Answer).await?;
            let summary = session.send(&answer).await?;
            println!(
                "Sent {} records ({} bytes in {} chunks)",
                summary.records, summary.bytes, summary.chunks
            );
        }

        Commands::Receive => {
            let mut session = ReceiverSession::new(engine.db());
            let offer = read_signal(SignalType::Offer).await?;
            let answer = session.create_answer(&offer)?;
            println!("{}", answer.to_json()?);

            let report = session.receive().await?;
            println!(
                "Received: {} added, {} already present (patients +{}, checkups +{}, items +{}, types +{})",
                report.total_added(),
                report.total_skipped(),
                report.patients.added,
                report.checkups.added,
                report.checkup_items.added,
                report.checkup_types.added
            );
        }
    }

    Ok(())
}

// ============================================================================
// Application Entry Point
// ============================================================================

pub fn run() {
    dotenvy::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Status);

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let engine = SyncEngine::open(&config).await?;
        let outcome = execute(&engine, command).await;
        engine.shutdown().await?;
        outcome
    });

    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::FakeRemote;
    use crate::sync::{CheckupFields, PatientFields, RecordKey};
    use serde_json::json;

    fn parse(args: &[&str]) -> Result<Option<Commands>, clap::Error> {
        Cli::try_parse_from(std::iter::once("checkup-sync").chain(args.iter().copied())).map(|cli| cli.command)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse(&["sync"]).unwrap(), Some(Commands::Sync));
        assert_eq!(parse(&[]).unwrap(), None);
        assert_eq!(parse(&["interval", "60"]).unwrap(), Some(Commands::Interval { secs: 60 }));
        assert_eq!(
            parse(&["auto-sync", "off"]).unwrap(),
            Some(Commands::AutoSync { state: Toggle::Off })
        );
        assert_eq!(parse(&["cache", "on"]).unwrap(), Some(Commands::Cache { state: Toggle::On }));
        assert_eq!(parse(&["retry-stalled"]).unwrap(), Some(Commands::RetryStalled));
        assert_eq!(parse(&["clear", "--yes"]).unwrap(), Some(Commands::Clear { yes: true }));
        assert_eq!(
            parse(&["export", "out.json"]).unwrap(),
            Some(Commands::Export { path: PathBuf::from("out.json") })
        );
        assert_eq!(parse(&["receive"]).unwrap(), Some(Commands::Receive));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        use clap::error::ErrorKind;

        assert!(parse(&["interval", "soon"]).is_err());
        assert_eq!(parse(&["interval"]).unwrap_err().kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(parse(&["cache", "maybe"]).unwrap_err().kind(), ErrorKind::InvalidValue);
        assert_eq!(parse(&["frobnicate"]).unwrap_err().kind(), ErrorKind::InvalidSubcommand);
        assert_eq!(parse(&["--help"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    async fn engine(remote: Arc<FakeRemote>) -> SyncEngine {
        let db = Arc::new(Database::in_memory().unwrap());
        SyncEngine::from_parts(db, remote).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_applies_configured_health_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            api_url: "http://127.0.0.1:1/api".to_string(),
            db_path: dir.path().join("data").join("store.db"),
            http_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
        };

        let engine = SyncEngine::open(&config).await.unwrap();
        assert_eq!(engine.manager().probe_timeout(), Duration::from_secs(2));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_runs_startup_sync_and_timers() {
        let remote = Arc::new(FakeRemote::new());
        let engine = engine(remote.clone()).await;

        engine
            .manager()
            .tracker()
            .record_create(PatientFields {
                name: "Startup".to_string(),
                ..PatientFields::default()
            })
            .unwrap();

        let report = engine.start().await.expect("startup sync should run");
        assert_eq!(report.patients.created, 1);
        assert!(engine.scheduler().is_running());
        assert!(engine.monitor().is_running());

        engine.shutdown().await.unwrap();
        assert!(!engine.scheduler().is_running());
        assert!(!engine.monitor().is_running());
        assert!(!engine.context().is_online());
    }

    #[tokio::test]
    async fn test_start_offline_skips_startup_sync() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_reachable(false);
        let engine = engine(remote).await;

        assert!(engine.start().await.is_none());
        assert!(!engine.context().is_online());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_settings_commands() {
        let engine = engine(Arc::new(FakeRemote::new())).await;

        execute(&engine, Commands::Interval { secs: 120 }).await.unwrap();
        assert_eq!(engine.context().settings().await.sync_interval_secs, 120);

        assert!(execute(&engine, Commands::Interval { secs: 5 }).await.is_err());
        assert_eq!(engine.context().settings().await.sync_interval_secs, 120);

        execute(&engine, Commands::Cache { state: Toggle::Off }).await.unwrap();
        assert!(!engine.context().settings().await.local_cache_enabled);
        assert!(!engine.scheduler().is_running());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_modes() {
        let remote = Arc::new(FakeRemote::new());
        let engine = engine(remote.clone()).await;
        engine
            .manager()
            .tracker()
            .record_create(PatientFields {
                name: "Manual".to_string(),
                ..PatientFields::default()
            })
            .unwrap();
        let server_id = remote.seed(EntityKind::Checkup, json!({"patient_id": 99, "checkup_no": "CHK9"}));

        // Upload only: the server copy is not pulled down
        execute(&engine, Commands::Upload).await.unwrap();
        assert_eq!(remote.rows(EntityKind::Patient).len(), 1);
        assert!(engine.db().get_all::<CheckupFields>().unwrap().is_empty());

        execute(&engine, Commands::Download).await.unwrap();
        let checkups = engine.db().get_all::<CheckupFields>().unwrap();
        assert_eq!(checkups.len(), 1);
        assert_eq!(checkups[0].id, RecordKey::Remote(server_id));

        execute(&engine, Commands::Force).await.unwrap();
        assert_eq!(engine.manager().pending_summary().unwrap().total(), 0);

        // Offline: nothing is attempted
        remote.set_reachable(false);
        engine
            .manager()
            .tracker()
            .record_create(PatientFields::default())
            .unwrap();
        execute(&engine, Commands::Upload).await.unwrap();
        assert_eq!(remote.create_calls(), 1);
        assert_eq!(engine.manager().pending_summary().unwrap().patients, 1);
    }

    #[tokio::test]
    async fn test_export_import_and_clear_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");
        let engine = engine(Arc::new(FakeRemote::new())).await;
        engine
            .manager()
            .tracker()
            .record_create(PatientFields {
                name: "Kept".to_string(),
                ..PatientFields::default()
            })
            .unwrap();

        execute(&engine, Commands::Export { path: path.clone() }).await.unwrap();

        // Refused without confirmation
        assert!(matches!(
            execute(&engine, Commands::Clear { yes: false }).await,
            Err(EngineError::Usage(_))
        ));
        assert_eq!(engine.db().get_all::<PatientFields>().unwrap().len(), 1);

        execute(&engine, Commands::Clear { yes: true }).await.unwrap();
        assert!(engine.db().get_all::<PatientFields>().unwrap().is_empty());

        execute(&engine, Commands::Import { path }).await.unwrap();
        let restored = engine.db().get_all::<PatientFields>().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].fields.name, "Kept");
        assert!(restored[0].is_pending());
    }

    #[tokio::test]
    async fn test_retry_commands() {
        let engine = engine(Arc::new(FakeRemote::new())).await;
        execute(&engine, Commands::RetryStalled).await.unwrap();
        execute(&engine, Commands::RetryFailed).await.unwrap();
        engine.shutdown().await.unwrap();
    }
}
