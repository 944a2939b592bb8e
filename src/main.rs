//! mcp-proxy - aggregating MCP server
//!
//! Connects to every server listed in the config file and serves them as one
//! MCP server over stdio. Logs go to stderr since stdout carries the protocol.
//!
//! Usage:
//!   mcp-proxy --config servers.yaml
//!   mcp-proxy --config servers.yaml --check

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use mcp_proxy_core::{
    AggregatorHandler, FileDiscovery, McpAggregator, ProxyConfig, TransportConnector,
};
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mcp-proxy", version, about = "Serve many MCP servers as one")]
struct Args {
    /// Server configuration file (.yaml, .yml or .json)
    #[arg(short, long, env = "MCP_PROXY_CONFIG", default_value = "mcp-proxy.yaml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Connect to every server, print a health report and exit
    #[arg(long)]
    check: bool,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mcp_proxy=info,mcp_proxy_core=info".into());
    let (json_layer, text_layer) = if json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
            None,
        )
    } else {
        (
            None,
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!("Loading config from: {}", args.config.display());
    let config = ProxyConfig::from_file(&args.config)
        .await
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let aggregator = Arc::new(McpAggregator::new(
        Arc::new(FileDiscovery::new(&args.config)),
        Arc::new(TransportConnector::default()),
        config.aggregator.clone(),
    ));
    let cancel = CancellationToken::new();

    if args.check {
        let report = aggregator.validate(&cancel).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        aggregator.shutdown().await;
        if !report.is_healthy {
            anyhow::bail!(
                "{} of {} server(s) unhealthy",
                report.unhealthy_servers,
                report.servers.len()
            );
        }
        return Ok(());
    }

    // Connect eagerly so configuration problems show up at startup. A failure
    // here is retried on the first request.
    if let Err(e) = aggregator.initialize(&cancel).await {
        warn!("Initial aggregation failed: {}", e);
    } else {
        let status = aggregator.status();
        info!(
            servers = status.total_servers,
            tools = status.total_tools,
            prompts = status.total_prompts,
            resources = status.total_resources,
            "Serving {:?}",
            status.server_names
        );
    }

    let monitor = aggregator.spawn_health_monitor(cancel.child_token());

    let running = AggregatorHandler::new(Arc::clone(&aggregator))
        .serve(rmcp::transport::stdio())
        .await
        .context("failed to start MCP server on stdio")?;

    tokio::select! {
        quit = running.waiting() => match quit {
            Ok(reason) => info!("Client session ended: {:?}", reason),
            Err(e) => error!("MCP server task failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
    }

    cancel.cancel();
    let _ = monitor.await;
    aggregator.shutdown().await;
    info!("mcp-proxy stopped");
    Ok(())
}
