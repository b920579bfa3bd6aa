//! CLI entry point for the netdisk tool.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use netdisk_core::config::{
    load_default_file_config, load_file_config, resolve_default_database_path,
};
use netdisk_core::store::{KeyValueBackend, SqliteBackend};
use netdisk_core::{
    Authenticator, Database, DownloadEngine, DownloadRecord, EngineConfig, FileConfig,
    RecordStore, SessionCookies, media_type_for,
};
use tracing::{debug, info};

mod cli;
mod progress_ui;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = match &args.config {
        Some(path) => load_file_config(path)?,
        None => {
            let loaded = load_default_file_config()?;
            if let Some(path) = &loaded.path {
                debug!(path = %path.display(), found = loaded.config.is_some(), "config lookup");
            }
            loaded.config.unwrap_or_default()
        }
    };

    let mut config = EngineConfig::default().with_file_config(&file_config);
    if let Some(dir) = &args.download_dir {
        config.download_dir.clone_from(dir);
    }
    if let Some(mode) = args.mode {
        config.transfer_mode = mode;
    }

    let db_path = database_path(&args, &file_config)?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create state directory '{}'", parent.display())
        })?;
    }
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("Failed to open history database '{}'", db_path.display()))?;
    let backend: Arc<dyn KeyValueBackend> = Arc::new(SqliteBackend::new(db.clone()));

    let auth = Authenticator::new();
    auth.restore_session(backend.as_ref()).await;
    if let Some(cookie_file) = args.cookies.as_ref().or(file_config.cookie_file.as_ref()) {
        let loaded = auth
            .load_cookie_file(cookie_file)
            .with_context(|| format!("Failed to load cookies from '{}'", cookie_file.display()))?;
        info!(cookies = loaded, "loaded cookie file");
    }

    let result = run(args.command, config, auth, backend).await;
    db.close().await;
    result
}

fn database_path(args: &Args, file_config: &FileConfig) -> Result<PathBuf> {
    args.database
        .clone()
        .or_else(|| file_config.database_path.clone())
        .or_else(resolve_default_database_path)
        .context("Cannot determine a history database location; pass --database")
}

async fn run(
    command: Command,
    config: EngineConfig,
    auth: Authenticator,
    backend: Arc<dyn KeyValueBackend>,
) -> Result<()> {
    match command {
        Command::Login { cookie, url } => {
            let seeded = auth.seed_from_header(&url, &cookie)?;
            if seeded == 0 {
                bail!("No cookies found in the given header");
            }
            SessionCookies::new(url.as_str(), cookie)
                .save(backend.as_ref())
                .await?;
            info!(server = %url, cookies = seeded, "session saved");
            Ok(())
        }
        Command::Logout => {
            SessionCookies::clear(backend.as_ref()).await?;
            info!("session removed");
            Ok(())
        }
        command => {
            let store = RecordStore::open(Arc::clone(&backend)).await;
            let engine = DownloadEngine::builder(config)
                .store(store)
                .authenticator(auth)
                .build()
                .await?;
            let result = run_engine_command(&engine, command).await;
            engine.shutdown().await;
            result
        }
    }
}

async fn run_engine_command(engine: &DownloadEngine, command: Command) -> Result<()> {
    match command {
        Command::Get {
            url,
            filename,
            no_progress,
        } => {
            let events = engine.subscribe();
            let id = engine
                .submit(&url, filename.as_deref().unwrap_or_default())
                .await?;
            let show_bar = !no_progress && std::io::stderr().is_terminal();
            let outcome = progress_ui::follow_download(events, id, show_bar).await;

            match (outcome, engine.get(id).await) {
                (Some(outcome), _) if outcome.success => {
                    if let Some(path) = outcome.destination_path {
                        info!(media_type = media_type_for(&path), "saved");
                        println!("{}", path.display());
                    }
                    Ok(())
                }
                (_, Some(record)) => {
                    let reason = record.failure_reason.unwrap_or_else(|| "unknown error".into());
                    bail!("Download {id} failed: {reason}")
                }
                (_, None) => bail!("Download {id} ended without a record"),
            }
        }
        Command::List => {
            let records = engine.list_all().await;
            if records.is_empty() {
                info!("No downloads yet");
            }
            for record in &records {
                println!("{}", format_record(record));
            }
            Ok(())
        }
        Command::Remove { id } => {
            if engine.remove(id).await {
                info!(download_id = id, "download removed");
                Ok(())
            } else {
                bail!("No download with id {id}")
            }
        }
        Command::Clear => {
            engine.clear_history().await?;
            info!("download history cleared");
            Ok(())
        }
        // Handled in `run` before the engine is built.
        Command::Login { .. } | Command::Logout => Ok(()),
    }
}

fn format_record(record: &DownloadRecord) -> String {
    let size = if record.bytes_total > 0 {
        format!("{}/{}", record.bytes_downloaded, record.bytes_total)
    } else {
        record.bytes_downloaded.to_string()
    };
    let mut line = format!(
        "{:>5}  {:<11}  {:>3}%  {:>21}  {}  {}",
        record.id,
        record.status.as_str(),
        record.progress_percent,
        size,
        record.created_at.format("%Y-%m-%d %H:%M"),
        record.destination_path.display(),
    );
    if let Some(reason) = &record.failure_reason {
        line.push_str("  (");
        line.push_str(reason);
        line.push(')');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use netdisk_core::DownloadStatus;

    #[test]
    fn test_format_record_shows_status_and_reason() {
        let mut record = DownloadRecord::pending(7, "a.zip", "https://x/a.zip", "/d/a.zip");
        record.status = DownloadStatus::Failed;
        record.failure_reason = Some("HTTP 404".to_string());

        let line = format_record(&record);

        assert!(line.contains("FAILED"));
        assert!(line.contains("/d/a.zip"));
        assert!(line.ends_with("(HTTP 404)"));
    }

    #[test]
    fn test_format_record_shows_known_size() {
        let mut record = DownloadRecord::pending(8, "b.bin", "https://x/b", "/d/b.bin");
        record.bytes_downloaded = 250;
        record.bytes_total = 1000;

        assert!(format_record(&record).contains("250/1000"));
    }
}
