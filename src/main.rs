use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use ingestion_gateway::config::GatewayConfig;
use ingestion_gateway::service::{self, Gateway};
use ingestion_gateway::staging::{Partition, PendingScan, StagingLog};
use ingestion_gateway::{logging, metrics};

#[derive(Parser)]
#[command(name = "ingestion_gateway")]
#[command(about = "Durable, idempotent event ingestion gateway")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (overrides INGESTION_GATEWAY_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP endpoint and the dispatcher (default)
    Serve,
    /// Print staging log counters without starting the server
    Status,
    /// List pending records in sequence order
    Pending {
        /// Maximum number of records to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Start after this sequence number
        #[arg(long, default_value_t = 0)]
        after: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Status => {
            logging::init_console_logging("warn");
            status(&config)
        }
        Commands::Pending { limit, after } => {
            logging::init_console_logging("warn");
            pending(&config, limit, after)
        }
    }
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let _guard = logging::init_logging(&config.logging);
    metrics::init_metrics(config.metrics.listen_addr.as_deref());

    let queue = service::downstream_from_config(&config).context("failed to build downstream queue")?;
    info!(queue = queue.name(), "downstream queue configured");
    let gateway = Gateway::build(config, queue).context("failed to open durable stores")?;
    gateway.run().await
}

fn status(config: &GatewayConfig) -> Result<()> {
    let log = service::open_staging_log(config).context("failed to open staging log")?;
    let stats = log.stats().context("failed to read staging stats")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn pending(config: &GatewayConfig, limit: usize, after: u64) -> Result<()> {
    let log = service::open_staging_log(config).context("failed to open staging log")?;
    let log: Arc<dyn StagingLog> = log;
    let scan = PendingScan::resume(log.as_ref(), Partition::ALL, limit.clamp(1, 500), after);
    for record in scan.take(limit) {
        let record = record.context("failed to read pending record")?;
        println!(
            "{}\t{}\t{}\t{}\tattempts={}{}",
            record.sequence_number,
            record.received_at.to_rfc3339(),
            record.envelope.workspace_slug,
            record.envelope.event_id,
            record.retry.attempts,
            record
                .retry
                .last_error
                .as_deref()
                .map(|e| format!("\tlast_error={e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
