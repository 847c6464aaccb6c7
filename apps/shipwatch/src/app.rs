//! Wires the worklist engine to its realtime feed and snapshot endpoint and
//! runs the interactive console.

use std::sync::Arc;

use anyhow::{Context, Result};
use change_sync::{
    metrics, ChangeFeed, ConnectionStatus, DerivedView, ModelView, SnapshotSource, SyncEngine,
    Visibility,
};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::realtime::RealtimeFeed;
use crate::snapshot::HttpSnapshotSource;
use crate::worklist::{dubai_timestamp, WorklistModel, WorklistRow};

pub type WorklistEngine = SyncEngine<WorklistModel>;
pub type WorklistView = ModelView<WorklistModel>;

pub fn build_engine(config: &AppConfig) -> Result<WorklistEngine> {
    let feed: Arc<dyn ChangeFeed> = Arc::new(RealtimeFeed::new(config.realtime.clone()));
    let snapshots: Arc<dyn SnapshotSource<WorklistRow>> = Arc::new(
        HttpSnapshotSource::new(config.snapshot_url.as_str(), Some(config.api_key.clone()))
            .context("failed to build snapshot client")?,
    );
    Ok(engine_with(config, WorklistModel::new(), feed, snapshots))
}

pub fn engine_with(
    config: &AppConfig,
    model: WorklistModel,
    feed: Arc<dyn ChangeFeed>,
    snapshots: Arc<dyn SnapshotSource<WorklistRow>>,
) -> WorklistEngine {
    let store = DerivedView::empty(&model);
    SyncEngine::new(
        config.sync.clone(),
        model,
        store,
        config.channel.clone(),
        feed,
        snapshots,
    )
    .with_status_listener(Arc::new(|status: ConnectionStatus| {
        info!(target = "shipwatch", status = %status, "connection status");
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Hide,
    Show,
    Refresh,
    Status,
    Metrics,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "hide" => Some(Command::Hide),
            "show" => Some(Command::Show),
            "refresh" | "r" => Some(Command::Refresh),
            "status" | "s" => Some(Command::Status),
            "metrics" => Some(Command::Metrics),
            "quit" | "exit" | "q" => Some(Command::Quit),
            _ => None,
        }
    }
}

/// One-line rendering of the KPI strip.
pub fn kpi_strip(view: &WorklistView) -> String {
    let kpis = &view.summary;
    let refreshed = view
        .refreshed_at
        .map(dubai_timestamp)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "rows={} dri={:.2} red={} overdue={} zero={} recoverable_aed={:.2} refreshed={}",
        view.rows.len(),
        kpis.dri_avg,
        kpis.red_count,
        kpis.overdue_count,
        kpis.zero_stops,
        kpis.recoverable_aed,
        refreshed,
    )
}

/// Applies one console command. Returns `false` once the session should end.
pub async fn handle_command<W>(engine: &WorklistEngine, command: Command, out: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match command {
        Command::Hide => {
            engine.set_visibility(Visibility::Hidden);
        }
        Command::Show => {
            engine.set_visibility(Visibility::Visible);
        }
        Command::Refresh => {
            if let Err(err) = engine.refresh_now().await {
                warn!(target = "shipwatch", error = %err, "manual refresh failed");
            }
        }
        Command::Status => {
            let line = format!(
                "status={} visibility={:?} polling={} | {}\n",
                engine.current_status(),
                engine.visibility(),
                engine.is_polling(),
                kpi_strip(&engine.view().borrow()),
            );
            out.write_all(line.as_bytes()).await?;
        }
        Command::Metrics => {
            out.write_all(&metrics::gather()).await?;
        }
        Command::Quit => return Ok(false),
    }
    out.flush().await?;
    Ok(true)
}

pub async fn run(config: AppConfig) -> Result<()> {
    let engine = build_engine(&config)?;
    engine.start().await?;

    let mut views = engine.view();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!(target = "shipwatch", "interrupt received");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let strip = kpi_strip(&views.borrow_and_update());
                info!(target = "shipwatch", "{strip}");
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match Command::parse(&line) {
                    Some(command) => {
                        if !handle_command(&engine, command, &mut stdout).await? {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => {
                        stdout
                            .write_all(b"commands: hide | show | refresh | status | metrics | quit\n")
                            .await?;
                    }
                },
                None => stdin_open = false,
            },
        }
    }

    engine.shutdown().await;
    Ok(())
}
