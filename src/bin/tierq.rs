//! tierq CLI: operator interface to the work-queue engine.

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tierq::config::Config;
use tierq::engine::{ProcessorRegistry, WorkQueueProcessor};
use tierq::filesystem;
use tierq::model::{
    Filesystem, FilesystemKey, NewQueueEntry, NewStorageLocation, QueueEntryId, QueueStatus,
    QueueStudyState, QueueType, StudyStorageKey,
};
use tierq::stats::StatisticsAggregator;
use tierq::storage::{QueueCriteria, Storage, StorageLocationUpdate};
use tierq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "tierq", about = "Move studies between storage tiers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the work-queue processor
    Serve {
        /// Maximum entries processed at once (overrides settings)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Queue entry operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Storage filesystem operations
    Fs {
        #[command(subcommand)]
        action: FsAction,
    },
    /// Study storage operations
    Study {
        #[command(subcommand)]
        action: StudyAction,
    },
    /// Show recent operator alerts
    Alerts {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Schedule a tier migration for a study
    Migrate {
        /// Study storage key
        study: StudyStorageKey,
        /// Seconds from now until the entry is due
        #[arg(long, default_value_t = 0)]
        delay: i64,
    },
    /// List queue entries
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<QueueStatus>,
        /// Filter by queue type
        #[arg(long, name = "type")]
        queue_type: Option<QueueType>,
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show a queue entry
    Show {
        /// Entry ID (full UUID or prefix)
        id: String,
    },
    /// Delete completed and failed entries past their expiration
    Purge,
}

#[derive(Subcommand)]
enum FsAction {
    /// Register a filesystem
    Add {
        /// Root directory
        root: PathBuf,
        /// Tier rank; larger is a lower tier
        #[arg(long)]
        tier: i32,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        read_only: bool,
        /// Usage percentage above which no studies are placed here
        #[arg(long, default_value_t = 90.0)]
        high_watermark: f64,
    },
    /// List filesystems
    List,
    /// Measure every filesystem root and store its capacity
    Refresh,
}

#[derive(Subcommand)]
enum StudyAction {
    /// Register a study's storage location
    Add {
        /// Study instance UID
        #[arg(long)]
        uid: String,
        #[arg(long)]
        partition: String,
        /// Study folder, usually the study date
        #[arg(long)]
        folder: String,
        /// Filesystem key the study lives on
        #[arg(long)]
        filesystem: FilesystemKey,
    },
    /// Show a study's storage location
    Show { key: StudyStorageKey },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { max_concurrent } => cmd_serve(config, max_concurrent).await,
        Command::Queue { action } => {
            let storage = Storage::open(&config.database_path)?;
            match action {
                QueueAction::Migrate { study, delay } => cmd_queue_migrate(&storage, study, delay),
                QueueAction::List {
                    status,
                    queue_type,
                    limit,
                } => cmd_queue_list(&storage, status, queue_type, limit),
                QueueAction::Show { id } => cmd_queue_show(&storage, &id),
                QueueAction::Purge => {
                    let purged = storage.broker().purge_expired(Utc::now())?;
                    println!("Purged {purged} entr{}", if purged == 1 { "y" } else { "ies" });
                    Ok(())
                }
            }
        }
        Command::Fs { action } => {
            let storage = Storage::open(&config.database_path)?;
            match action {
                FsAction::Add {
                    root,
                    tier,
                    description,
                    read_only,
                    high_watermark,
                } => {
                    let description =
                        description.unwrap_or_else(|| root.display().to_string());
                    let mut fs = Filesystem::new(description, root, tier);
                    fs.read_only = read_only;
                    fs.high_watermark = high_watermark;
                    storage.broker().insert_filesystem(&fs)?;
                    filesystem::refresh_usage(&storage.broker())?;
                    println!("Added filesystem {} (tier {})", fs.key, fs.tier);
                    Ok(())
                }
                FsAction::List => cmd_fs_list(&storage),
                FsAction::Refresh => {
                    let updated = filesystem::refresh_usage(&storage.broker())?;
                    println!("Refreshed {updated} filesystem(s)");
                    Ok(())
                }
            }
        }
        Command::Study { action } => {
            let storage = Storage::open(&config.database_path)?;
            match action {
                StudyAction::Add {
                    uid,
                    partition,
                    folder,
                    filesystem,
                } => {
                    let key = storage.broker().insert_storage_location(&NewStorageLocation {
                        study_instance_uid: uid,
                        partition_folder: partition,
                        study_folder: folder,
                        filesystem_key: filesystem,
                    })?;
                    println!("Added study storage {key}");
                    Ok(())
                }
                StudyAction::Show { key } => cmd_study_show(&storage, key),
            }
        }
        Command::Alerts { limit } => {
            let storage = Storage::open(&config.database_path)?;
            for alert in storage.broker().list_alerts(limit)? {
                println!(
                    "{}  {:<13}  {:<12}  {:>5}  {}",
                    alert.raised_at.format("%Y-%m-%d %H:%M:%S"),
                    alert.level.as_str(),
                    alert.source,
                    alert.code,
                    alert.message
                );
            }
            Ok(())
        }
    }
}

async fn cmd_serve(config: Config, max_concurrent: Option<usize>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "tierq"))?;

    let mut settings = config.engine_settings()?;
    if let Some(n) = max_concurrent {
        settings.max_concurrent = n;
    }

    let storage = Storage::open(&config.database_path)?;
    let statistics = StatisticsAggregator::shared(settings.statistics_log_every);
    let processor = Arc::new(WorkQueueProcessor::new(
        &storage,
        ProcessorRegistry::with_defaults(),
        settings,
        Arc::clone(&statistics),
        config.processor_id.clone(),
    ));

    let ctrl = Arc::clone(&processor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    processor.serve().await?;

    let totals = statistics
        .lock()
        .map(|s| s.totals())
        .unwrap_or_default();
    tracing::info!(
        operations = totals.operations,
        bytes = totals.bytes,
        files = totals.files,
        "tierq stopped"
    );
    Ok(())
}

fn cmd_queue_migrate(storage: &Storage, study: StudyStorageKey, delay: i64) -> anyhow::Result<()> {
    let entry = storage.with_transaction(|broker| {
        let entry = broker.insert_queue_entry(
            &NewQueueEntry::new(QueueType::TierMigrate, study)
                .scheduled_at(Utc::now() + Duration::seconds(delay)),
        )?;
        broker.update_storage_location(
            study,
            &StorageLocationUpdate {
                queue_study_state: Some(QueueStudyState::MigrationScheduled),
                ..StorageLocationUpdate::default()
            },
        )?;
        Ok(entry)
    })?;
    println!("Created: {} (status: {})", entry.id, entry.status);
    Ok(())
}

fn cmd_queue_list(
    storage: &Storage,
    status: Option<QueueStatus>,
    queue_type: Option<QueueType>,
    limit: u32,
) -> anyhow::Result<()> {
    let entries = storage.broker().find_queue_entries(&QueueCriteria {
        statuses: status.into_iter().collect(),
        types: queue_type.into_iter().collect(),
        limit: Some(limit),
        ..QueueCriteria::default()
    })?;

    if entries.is_empty() {
        println!("No queue entries found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<14}  {:<11}  {:<5}  {:<16}  DESCRIPTION",
        "ID", "TYPE", "STATUS", "FAILS", "SCHEDULED"
    );
    println!("{}", "-".repeat(100));

    for entry in &entries {
        let short_id = &entry.id.to_string()[..8];
        let description = entry.failure_description.as_deref().unwrap_or("-");
        let description: String = description.chars().take(40).collect();
        println!(
            "{:<8}  {:<14}  {:<11}  {:<5}  {:<16}  {}",
            short_id,
            entry.queue_type,
            entry.status,
            entry.failure_count,
            entry.scheduled_time.format("%Y-%m-%d %H:%M"),
            description
        );
    }

    println!("\n{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
    Ok(())
}

fn cmd_queue_show(storage: &Storage, id_str: &str) -> anyhow::Result<()> {
    let broker = storage.broker();
    let id = if id_str.len() < 36 {
        let entries = broker.find_queue_entries(&QueueCriteria::default())?;
        let matches: Vec<_> = entries
            .iter()
            .filter(|e| e.id.to_string().starts_with(id_str))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no queue entry matching prefix '{id_str}'"),
            1 => matches[0].id,
            n => anyhow::bail!("{n} queue entries match prefix '{id_str}', be more specific"),
        }
    } else {
        id_str.parse::<QueueEntryId>()?
    };

    let entry = broker.get_queue_entry(id)?;

    println!("ID:          {}", entry.id);
    println!("Type:        {}", entry.queue_type);
    println!("Status:      {}", entry.status);
    println!("Study:       {}", entry.study_storage_key);
    println!("Processor:   {}", entry.processor_id.as_deref().unwrap_or("-"));
    println!("Scheduled:   {}", entry.scheduled_time);
    println!(
        "Expires:     {}",
        entry
            .expiration_time
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Failures:    {}", entry.failure_count);
    println!(
        "Description: {}",
        entry.failure_description.as_deref().unwrap_or("-")
    );
    println!("Data:        {}", entry.data.as_deref().unwrap_or("-"));
    println!("Created:     {}", entry.created_at);
    println!("Updated:     {}", entry.updated_at);
    Ok(())
}

fn cmd_fs_list(storage: &Storage) -> anyhow::Result<()> {
    let filesystems = storage.broker().list_filesystems()?;
    if filesystems.is_empty() {
        println!("No filesystems registered.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<4}  {:<6}  {:>10}  {:<20}  ROOT",
        "KEY", "TIER", "MODE", "FREE (GB)", "DESCRIPTION"
    );
    for fs in &filesystems {
        let mode = match (fs.enabled, fs.read_only) {
            (false, _) => "off",
            (true, true) => "ro",
            (true, false) => "rw",
        };
        println!(
            "{:<36}  {:<4}  {:<6}  {:>10.1}  {:<20}  {}",
            fs.key,
            fs.tier,
            mode,
            fs.free_bytes() as f64 / 1024.0 / 1024.0 / 1024.0,
            fs.description,
            fs.root.display()
        );
    }
    Ok(())
}

fn cmd_study_show(storage: &Storage, key: StudyStorageKey) -> anyhow::Result<()> {
    let Some(location) = storage.broker().get_storage_location(key)? else {
        anyhow::bail!("no study storage {key}");
    };
    println!("Key:         {}", location.key);
    println!("Study UID:   {}", location.study_instance_uid);
    println!("Filesystem:  {} (tier {})", location.filesystem_key, location.filesystem_tier);
    println!("Path:        {}", location.study_path().display());
    println!("Queue state: {}", location.queue_study_state.as_str());
    Ok(())
}
