use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use followsnap::{
    extract_records, find_followup_table, header_texts, login, resolve_columns, wait_for_rows,
    ChromeSession, Credentials, FollowupRecord, PageSession, ScrapeError,
};
use tracing::{info, warn};

use crate::db::{persist_snapshot, SnapshotWriter};
use crate::utils::{init_logging, Args};

mod db;
mod utils;

// The dashboard keeps mounting widgets for a few seconds after login.
const PRE_SCAN_SETTLE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let args = Args::parse();
    info!(url = %args.dashboard_url, dry_run = args.dry_run, "starting follow-up snapshot");

    let credentials = Credentials::from_env()?;

    let writer = if args.dry_run {
        None
    } else {
        match &args.database_url {
            Some(url) => Some(SnapshotWriter::connect(url).await?),
            None => bail!("DATABASE_URL is not set; pass --dry-run to scrape without persisting"),
        }
    };

    tokio::fs::create_dir_all(&args.screenshot_dir)
        .await
        .with_context(|| format!("creating {}", args.screenshot_dir.display()))?;

    let session = ChromeSession::start(args.browser_config()).await?;

    let records = match scrape(&session, &args, &credentials).await {
        Ok(records) => records,
        Err(err) => {
            capture_failure_screenshot(&session, &args.screenshot_dir, &err).await;
            close_session(&session).await;
            return Err(err.into());
        }
    };
    close_session(&session).await;

    info!(records = records.len(), "extracted follow-up records");

    match writer {
        Some(writer) => {
            let report = persist_snapshot(&writer, Utc::now(), &records).await?;
            report.log_summary();
        }
        None => println!("{}", serde_json::to_string_pretty(&records)?),
    }

    Ok(())
}

/// Log in, wait out the table render, and pull the records.
async fn scrape(
    session: &dyn PageSession,
    args: &Args,
    credentials: &Credentials,
) -> Result<Vec<FollowupRecord>, ScrapeError> {
    login(session, &args.dashboard_url, credentials).await?;
    tokio::time::sleep(PRE_SCAN_SETTLE).await;

    let table = find_followup_table(session).await?;
    let rows = wait_for_rows(&table, &args.poll_settings()).await?;

    let headers = header_texts(&table).await?;
    let columns = resolve_columns(&headers)?;
    extract_records(&rows, &columns).await
}

/// Screenshot the page state that caused `err`, named so the common
/// failures are recognizable at a glance in the screenshot directory.
async fn capture_failure_screenshot(session: &dyn PageSession, dir: &Path, err: &ScrapeError) {
    let name = match err {
        ScrapeError::TableNotFound(_) => "no_table_found.png".to_string(),
        ScrapeError::TableNotPopulated { .. } => "empty_table_debug.png".to_string(),
        _ => format!("error_screenshot_{}.png", Local::now().format("%Y%m%d_%H%M%S")),
    };
    let path = dir.join(name);
    match session.save_screenshot(&path).await {
        Ok(()) => info!(path = %path.display(), "saved failure screenshot"),
        Err(shot_err) => warn!(error = %shot_err, "could not save failure screenshot"),
    }
}

async fn close_session(session: &dyn PageSession) {
    if let Err(err) = session.close().await {
        warn!(error = %err, "browser shutdown reported an error");
    }
}
