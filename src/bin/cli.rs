//! Marksync CLI
//!
//! One-shot backup/restore commands and a `watch` daemon that runs the
//! backup scheduler against the local data directory.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marksync::error::{Result, SyncError};
use marksync::sync::{BackupOutcome, BackupWorker, SyncOutcome};
use marksync::types::*;
use marksync::SyncService;

#[derive(Parser)]
#[command(name = "marksync")]
#[command(about = "Bookmark backup & sync over WebDAV")]
#[command(version)]
struct Cli {
    /// Data directory holding bookmarks.json and settings.json
    #[arg(long, env = "MARKSYNC_DATA_DIR")]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a snapshot of the local bookmarks
    Backup {
        /// Backup reason (user, scheduled, mutation)
        #[arg(short, long, default_value = "user")]
        source: String,
    },
    /// List remote snapshots
    List,
    /// Restore a remote snapshot over local data
    Restore {
        /// Snapshot file name
        name: String,
    },
    /// Check whether the remote holds newer data
    Check,
    /// Sync from a newer remote snapshot (defaults to the newest)
    Sync {
        /// Snapshot file name
        name: Option<String>,
    },
    /// Probe the configured (or given) WebDAV server
    TestConnection {
        #[arg(long)]
        url: Option<String>,
        #[arg(short, long)]
        username: Option<String>,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Show or change settings
    Config {
        #[arg(long)]
        url: Option<String>,
        #[arg(short, long)]
        username: Option<String>,
        #[arg(short, long)]
        password: Option<String>,
        /// Relay endpoint ("" to clear)
        #[arg(long)]
        relay_url: Option<String>,
        /// Enable or disable automatic backups
        #[arg(long)]
        enabled: Option<bool>,
        /// Hours between periodic backups
        #[arg(long)]
        frequency_hours: Option<f64>,
        /// Snapshots kept per client (0 = unlimited)
        #[arg(long)]
        max_snapshots: Option<usize>,
        /// Minutes between remote checks in watch mode (0 = off)
        #[arg(long)]
        remote_check_minutes: Option<u64>,
    },
    /// Run scheduled and mutation-triggered backups until interrupted
    Watch {
        /// Seconds between checks of the data directory
        #[arg(long, default_value = "2")]
        poll_secs: u64,
    },
}

fn data_dir(arg: Option<String>) -> PathBuf {
    match arg {
        Some(dir) => PathBuf::from(shellexpand::tilde(&dir).to_string()),
        None => dirs::data_dir()
            .map(|d| d.join("marksync"))
            .unwrap_or_else(|| PathBuf::from(shellexpand::tilde("~/.local/share/marksync").to_string())),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let service = SyncService::open(data_dir(cli.data_dir))?;

    match cli.command {
        Commands::Backup { source } => {
            let reason: BackupReason = source.parse()?;
            match service.backup(reason).await? {
                BackupOutcome::Uploaded { file, pruned } => {
                    println!("Uploaded {}", file);
                    for name in pruned {
                        println!("  rotated out {}", name);
                    }
                }
                BackupOutcome::Skipped { reason } => println!("Skipped: {:?}", reason),
            }
        }

        Commands::List => {
            let codec = service.orchestrator().codec();
            for file in service.list_snapshots().await? {
                let taken = codec
                    .decode_filename(&file.name)
                    .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "?".to_string());
                println!("{}  {:>9} B  {}", taken, file.size, file.name);
            }
        }

        Commands::Restore { name } => report_sync(service.restore(&name).await?)?,

        Commands::Check => match service.check_remote().await? {
            Some(check) => print_json(&check)?,
            None => println!("WebDAV is not configured"),
        },

        Commands::Sync { name } => {
            let name = match name {
                Some(name) => name,
                None => {
                    let check = service
                        .check_remote()
                        .await?
                        .ok_or_else(|| SyncError::Config("WebDAV URL is not configured".to_string()))?;
                    match (check.has_newer_data, check.file) {
                        (true, Some(file)) => file.name,
                        _ => {
                            println!("Local data is up to date");
                            return Ok(());
                        }
                    }
                }
            };
            report_sync(service.sync_from(&name).await?)?;
        }

        Commands::TestConnection {
            url,
            username,
            password,
        } => {
            let mut config = service.settings_store().load()?.webdav;
            if let Some(url) = url {
                config.url = url;
            }
            if let Some(username) = username {
                config.username = username;
            }
            if let Some(password) = password {
                config.password = password;
            }
            print_json(&service.test_connection(&config).await?)?;
        }

        Commands::Config {
            url,
            username,
            password,
            relay_url,
            enabled,
            frequency_hours,
            max_snapshots,
            remote_check_minutes,
        } => {
            let store = service.settings_store();
            let mut settings = store.load()?;
            let before = settings.clone();

            if let Some(url) = url {
                settings.webdav.url = url;
            }
            if let Some(username) = username {
                settings.webdav.username = username;
            }
            if let Some(password) = password {
                settings.webdav.password = password;
            }
            if let Some(relay) = relay_url {
                settings.webdav.relay_url = Some(relay).filter(|r| !r.trim().is_empty());
            }
            if let Some(enabled) = enabled {
                settings.backup.enabled = enabled;
            }
            if let Some(hours) = frequency_hours {
                settings.backup.frequency_hours = hours;
            }
            if let Some(max) = max_snapshots {
                settings.backup.max_snapshots = max;
            }
            if let Some(minutes) = remote_check_minutes {
                settings.backup.remote_check_minutes = Some(minutes).filter(|m| *m > 0);
            }

            if settings != before {
                store.save(&settings)?;
            }
            let mut shown = settings;
            if !shown.webdav.password.is_empty() {
                shown.webdav.password = "********".to_string();
            }
            print_json(&shown)?;
        }

        Commands::Watch { poll_secs } => {
            let worker = BackupWorker::start(
                service.scheduler(),
                service.orchestrator().clone(),
                service.settings_store().clone(),
                service.dataset_store().clone(),
                Duration::from_secs(poll_secs.max(1)),
            );
            let mut events = service.events().subscribe();
            let shutdown = tokio::signal::ctrl_c();
            tokio::pin!(shutdown);
            tracing::info!("Watching for bookmark changes");

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) if event.notify => print_json(&event)?,
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Event stream lagged");
                        }
                        Err(_) => break,
                    },
                    _ = &mut shutdown => break,
                }
            }

            worker.stop().await?;
        }
    }

    Ok(())
}

fn report_sync(outcome: SyncOutcome) -> Result<()> {
    match outcome {
        SyncOutcome::Completed(report) => {
            println!("Restored {} ({} bookmarks)", report.file, report.nodes);
            if let Some(safety) = &report.safety_backup {
                println!("Previous local data saved as {}", safety);
            }
            Ok(())
        }
        SyncOutcome::AlreadySyncing => {
            println!("Another sync is already running");
            Ok(())
        }
    }
}
