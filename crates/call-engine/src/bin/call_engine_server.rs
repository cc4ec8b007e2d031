//! Call engine server
//!
//! Runs the routing engine and its queue/health loops against a SQLite
//! database. With `--stdio`, newline-delimited JSON events are read from
//! stdin and directives are written to stdout:
//!
//! ```text
//! {"event":"inbound","callerId":"+15551230000","calledNumber":"100"}
//! {"event":"status","sessionId":"call-…","status":"answered"}
//! {"event":"member_busy","numberId":3}
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crm_call_engine::logging::{log_welcome, setup_logging, LoggingConfig};
use crm_call_engine::orchestrator::{CallRouter, InboundCallEvent, StatusReport};
use crm_call_engine::server::CallEngineServerBuilder;
use crm_call_engine::CallEngineConfig;

#[derive(Parser, Debug)]
#[command(name = "call-engine-server")]
#[command(about = "CRM inbound call routing and queueing engine")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite url, overrides `database.url`
    #[arg(short, long)]
    database_url: Option<String>,

    /// Log level, overrides `logging.level`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Read JSON events from stdin and print directives to stdout
    #[arg(long)]
    stdio: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StdioEvent {
    Inbound(InboundCallEvent),
    Status(StatusReport),
    #[serde(rename_all = "camelCase")]
    MemberBusy { number_id: i64 },
    #[serde(rename_all = "camelCase")]
    MemberFree { number_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CallEngineConfig::from_file(path)?,
        None => CallEngineConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    setup_logging(LoggingConfig::from_config(&config.logging, env!("CARGO_PKG_NAME"))?)?;
    log_welcome(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut builder = CallEngineServerBuilder::new().with_config(config);
    if let Some(url) = args.database_url {
        builder = builder.with_database_url(url);
    }
    let mut server = builder.build().await.context("failed to build call engine")?;

    let mut drained = server.subscribe_directives();
    server.start().await?;

    if args.stdio {
        tokio::spawn(async move {
            while let Ok(directive) = drained.recv().await {
                match serde_json::to_string(&directive) {
                    Ok(line) => println!("{line}"),
                    Err(e) => error!("Cannot encode directive: {}", e),
                }
            }
        });
        let router = server.router().clone();
        tokio::select! {
            result = stdio_loop(router) => result?,
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
        }
    } else {
        info!("📞 Call engine running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    server.stop().await?;
    Ok(())
}

async fn stdio_loop(router: std::sync::Arc<CallRouter>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: StdioEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping malformed event: {}", e);
                continue;
            }
        };
        match event {
            StdioEvent::Inbound(call) => {
                let directive = router.route_or_error(call).await;
                println!("{}", serde_json::to_string(&directive)?);
            }
            StdioEvent::Status(report) => {
                let session_id = report.session_id.clone();
                if let Err(e) = router.report_status(report).await {
                    warn!("Status for {} rejected: {}", session_id, e);
                }
            }
            StdioEvent::MemberBusy { number_id } => router.mark_member_busy(number_id),
            StdioEvent::MemberFree { number_id } => router.mark_member_free(number_id),
        }
    }
    Ok(())
}
