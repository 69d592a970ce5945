// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use canary::{
    MappingHandler, ProcCgroupRuntime, TokioSleeper, TonicDialer, WorkspaceDispatch,
    WorkspaceEvent,
};
use clap::Parser;
use cliutil::{cli_main, handle_top_level_result, ConfigBuilder};
use idmapping::MapperConfig;
use nix::unistd::geteuid;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    signal::unix::{signal, SignalKind},
};
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes uid_map/gid_map for workspace containers on request of their
/// in-workspace agent.
#[derive(Parser, Debug)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long)]
    config: PathBuf,

    /// File to read workspace events from, one JSON object per line. `-`
    /// reads from stdin.
    #[arg(long, default_value = "-")]
    events: PathBuf,
}

/// Parses one line of the workspace event feed. Blank lines yield `None`.
fn parse_event(line: &str) -> Result<Option<WorkspaceEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str(line)
        .with_context(|| format!("Malformed workspace event: {line}"))?;
    Ok(Some(event))
}

async fn open_events(path: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    if path == Path::new("-") {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(file))
}

async fn serve_events(dispatch: &mut WorkspaceDispatch, events: &Path) -> Result<()> {
    let mut lines = BufReader::new(open_events(events).await?).lines();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to handle SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to handle SIGINT")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read workspace events")? else {
                    info!("Workspace event feed closed");
                    return Ok(());
                };
                match parse_event(&line) {
                    Ok(Some(event)) => dispatch.handle_event(event).await,
                    Ok(None) => {}
                    Err(e) => warn!("Ignoring workspace event: {:#}", e),
                }
            }
        }
    }
}

async fn run(args: Cli, config: Arc<MapperConfig>) -> Result<()> {
    let handler = MappingHandler::new(
        config.clone(),
        Arc::new(ProcCgroupRuntime::new(&config.proc_root)),
    );
    let mut dispatch = WorkspaceDispatch::new(
        handler,
        Arc::new(TonicDialer::new(config.agent_port, CONNECT_TIMEOUT)),
        Arc::new(TokioSleeper),
    );

    let result = serve_events(&mut dispatch, &args.events).await;
    dispatch.shutdown().await;
    result
}

fn do_main() -> Result<()> {
    let args = Cli::parse();
    let config = Arc::new(MapperConfig::load(&args.config)?);
    info!(
        proc_root = %config.proc_root.display(),
        max_requests = config.canary.max_requests,
        reconnect_delay_ms = config.canary.reconnect_delay_ms,
        "Loaded config"
    );

    if !geteuid().is_root() {
        warn!("Not running as root; writing ID maps of other processes will likely fail");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(run(args, config))
}

fn main() -> ExitCode {
    let config = match ConfigBuilder::new().build() {
        Ok(config) => config,
        Err(e) => return handle_top_level_result::<(), _>(Err(e)),
    };
    cli_main(do_main, config)
}
