//! Shellgate - policy-enforcing shell execution gateway
//!
//! An LLM-driven client speaks JSON-RPC on stdio; each command is
//! classified, optionally gated on confirmation, and run under timeout and
//! output controls. Operators watch metrics, events, and audit journals on
//! a local HTTP listener.

use anyhow::{Context, Result};
use clap::Parser;
use shellgate::pipeline::RequestPipeline;
use shellgate::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shellgate", about = "Policy-enforcing shell execution gateway")]
struct Cli {
    /// Override the HTTP observability port (0 disables the listener).
    #[arg(long)]
    http_port: Option<u16>,

    /// Override the shell binary.
    #[arg(long)]
    shell: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(port) = cli.http_port {
        config.http_port = port;
    }
    if cli.shell.is_some() {
        config.shell_override = cli.shell;
    }

    info!(
        auth = config.auth_key.is_some(),
        http_port = config.http_port,
        overflow = ?config.overflow_strategy,
        "🚀 shellgate starting"
    );

    let pipeline = Arc::new(RequestPipeline::new(config).context("wiring the pipeline")?);

    if pipeline.config.http_port != 0 {
        let http_pipeline = pipeline.clone();
        let port = pipeline.config.http_port;
        tokio::spawn(async move {
            if let Err(e) = shellgate::api::serve(http_pipeline, port).await {
                warn!("observability listener failed: {e:#}");
            }
        });
    }

    // Expired rate buckets are evicted in the background.
    {
        let cleanup_pipeline = pipeline.clone();
        let period = Duration::from_millis(pipeline.config.rate_refill_ms.max(1_000) * 5);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                cleanup_pipeline.rate_limiter.cleanup();
            }
        });
    }

    let serve_pipeline = pipeline.clone();
    tokio::select! {
        result = shellgate::rpc::serve_stdio(serve_pipeline) => {
            result.context("stdio transport")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
    }

    pipeline.audit.close();
    info!("shutdown complete");
    Ok(())
}

/// Tracing goes to stderr: stdout belongs to the JSON-RPC frame stream.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shellgate=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
