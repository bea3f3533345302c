mod remote;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client::config::ClientConfig;
use client::session::ClientSession;
use client::submit::FileSpec;
use client::task::{ReconciledTask, TaskStatus};
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use remote::HttpRemote;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Remote conversion client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit files as one conversion batch
    Submit {
        /// Files to convert
        files: Vec<PathBuf>,
        /// JSON file with the conversion parameter snapshot
        #[arg(long)]
        params_file: Option<PathBuf>,
    },
    /// Reconcile against the service and print all known tasks
    List,
    /// Periodically reconcile and sweep until interrupted
    Watch,
    /// Cancel a task by its current task id
    Cancel { task_id: String },
    /// Retry a failed task by its current task id
    Retry { task_id: String },
    /// Delete a task record by its local id
    Delete { local_id: String },
    /// Run one integrity sweep over downloaded outputs
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let cfg = ClientConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("Conversion client starting");
    info!("  Server: {}", cfg.server_url);
    info!("  Task state dir: {}", cfg.task_state_dir.display());

    let remote = Arc::new(
        HttpRemote::new(
            &cfg.server_url,
            Duration::from_secs(cfg.request_timeout_secs),
        )
        .context("Failed to build HTTP client")?,
    );
    let session = ClientSession::new(&cfg, remote.clone(), remote)
        .context("Failed to open client session")?;

    match args.command {
        Command::Submit { files, params_file } => submit(&session, files, params_file).await,
        Command::List => list(&session).await,
        Command::Watch => watch(&session, &cfg).await,
        Command::Cancel { task_id } => {
            session.cancel(&task_id).await?;
            println!("Cancelled {}", task_id);
            Ok(())
        }
        Command::Retry { task_id } => {
            session.retry(&task_id).await?;
            println!("Retry submitted for {}", task_id);
            Ok(())
        }
        Command::Delete { local_id } => {
            session.delete(&local_id).await?;
            println!("Deleted {}", local_id);
            Ok(())
        }
        Command::Sweep => {
            match session.sweep()? {
                Some(report) => {
                    println!("Sweep: {} checked, {} missing", report.checked, report.missing)
                }
                None => println!("Sweep already in flight, skipped"),
            }
            Ok(())
        }
    }
}

async fn submit(
    session: &ClientSession,
    files: Vec<PathBuf>,
    params_file: Option<PathBuf>,
) -> Result<()> {
    anyhow::ensure!(!files.is_empty(), "No files given");

    let params = match params_file {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read params file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse params file: {}", path.display()))?
        }
        None => serde_json::Value::Null,
    };

    let mut specs = Vec::with_capacity(files.len());
    for path in files {
        let metadata = fs::metadata(&path)
            .with_context(|| format!("Failed to stat file: {}", path.display()))?;
        let display_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("File has no usable name: {}", path.display()))?
            .to_string();
        specs.push(FileSpec {
            bytes: metadata.len(),
            display_name,
            path,
        });
    }

    // Echo every transition while the submission is in flight.
    let sub = session.subscribe(|notice| println!("{:?}", notice));
    let result = session.submit(specs, params).await;
    session.unsubscribe(sub);

    let local_ids = result?;
    println!("Submitted {} file(s):", local_ids.len());
    for local_id in &local_ids {
        let record = session.store().get(local_id)?;
        println!(
            "  {}  {}  {:?}",
            local_id, record.current_task_id, record.status
        );
    }
    Ok(())
}

fn status_tag(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "PEND",
        TaskStatus::Uploading => "UPLD",
        TaskStatus::Converting => "CONV",
        TaskStatus::Completed => "DONE",
        TaskStatus::Failed => "FAIL",
        TaskStatus::Cancelled => "CANC",
    }
}

fn print_views(mut views: Vec<ReconciledTask>) {
    // Newest first, like the tasks arrived.
    views.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    println!(
        "{:<6} {:<5} {:>10} {:<38} {}",
        "STATUS", "PROG", "SIZE", "TASK ID", "NAME"
    );
    for view in &views {
        let id = view
            .remote_id
            .as_deref()
            .or(view.local_id.as_deref())
            .unwrap_or("-");
        println!(
            "{:<6} {:>3}%  {:>10} {:<38} {}",
            status_tag(view.status),
            view.progress,
            format_size(view.source_bytes, DECIMAL),
            id,
            view.display_name
        );
        if let Some(error) = view.error_message.as_deref().or(view.local_error.as_deref()) {
            println!("       error: {}", error);
        }
    }

    let done = views
        .iter()
        .filter(|v| v.status == TaskStatus::Completed)
        .count();
    let failed = views
        .iter()
        .filter(|v| v.status == TaskStatus::Failed)
        .count();
    println!("{} task(s), {} completed, {} failed", views.len(), done, failed);
}

async fn list(session: &ClientSession) -> Result<()> {
    let views = session.list_all().await?;
    print_views(views);
    Ok(())
}

async fn watch(session: &ClientSession, cfg: &ClientConfig) -> Result<()> {
    loop {
        match session.reconcile_now().await {
            Ok(outcome) => {
                info!(
                    "Reconciled: {} remote task(s), {} orphaned local record(s)",
                    outcome.matches.len(),
                    outcome.orphans.len()
                );
            }
            Err(e) => warn!("Reconcile failed: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(cfg.reconcile_interval_secs)).await;
    }
}
