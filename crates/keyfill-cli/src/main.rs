//! keyfill - batch backfill runner
//!
//! Copies one table into another in keyset-paginated batches, committing
//! each batch separately and recording a restart checkpoint after each one.
//!
//! # Usage
//!
//! ```bash
//! # Run a job
//! keyfill -c orders.yaml run
//!
//! # Continue an interrupted job from its checkpoint file
//! keyfill -c orders.yaml run --resume
//!
//! # Validate configuration
//! keyfill -c orders.yaml validate
//!
//! # Show the first probe and scan of every partition
//! keyfill -c orders.yaml plan
//!
//! # Inspect the checkpoint file
//! keyfill -c orders.yaml checkpoint show
//! ```

mod checkpoint;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyfill::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use checkpoint::{CheckpointFile, FileCheckpointSink};
use config::JobConfig;

#[derive(Parser)]
#[command(name = "keyfill")]
#[command(version, about = "Keyset-paginated batch backfill between database tables")]
struct Cli {
    /// Path to job configuration file
    #[arg(short, long, default_value = "keyfill.yaml", env = "KEYFILL_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transfer (default)
    Run {
        /// Continue after the checkpoint in the configured checkpoint file
        #[arg(long)]
        resume: bool,
    },
    /// Validate configuration file
    Validate,
    /// Connect and print the first probe and scan of every partition
    Plan,
    /// Inspect or reset the checkpoint file
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored checkpoint
    Show,
    /// Delete the checkpoint file
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = JobConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run { resume: false }) {
        Commands::Run { resume } => run(config, resume).await,
        Commands::Validate => validate_config(&config),
        Commands::Plan => show_plan(config).await,
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show => show_checkpoint(&config),
            CheckpointAction::Clear => checkpoint::remove(config.checkpoint_path()?),
        },
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn connect(config: &JobConfig) -> Result<(Arc<dyn Source>, Arc<dyn Destination>)> {
    let source = SqlEndpoint::connect(&config.source.connection_config()?)
        .await
        .context("Failed to connect to source")?;
    let destination = SqlEndpoint::connect(&config.destination.connection_config()?)
        .await
        .context("Failed to connect to destination")?;
    Ok((Arc::new(source), Arc::new(destination)))
}

async fn run(config: JobConfig, resume: bool) -> Result<()> {
    let mut request = config.request()?;

    if resume {
        let path = config.checkpoint_path()?;
        match CheckpointFile::load(path)? {
            Some(file) => {
                file.ensure_matches(&request.source_table, &request.destination_table)?;
                info!(
                    checkpoint = %file.checkpoint,
                    written = %file.updated_at,
                    "resuming transfer"
                );
                request = request.with_restart(Some(file.checkpoint));
            }
            None => warn!(path = %path.display(), "no checkpoint file, starting from the beginning"),
        }
    }

    let (source, destination) = connect(&config).await?;

    let sink: Arc<dyn CheckpointSink> = match &config.checkpoint.path {
        Some(path) => Arc::new(FileCheckpointSink::new(
            path,
            &request.source_table,
            &request.destination_table,
        )),
        None => Arc::new(TracingCheckpointSink),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C), stopping after the current batch");
            on_signal.cancel();
        }
    });

    let pump = BackfillPump::new(source, destination)
        .with_sink(sink)
        .with_cancellation(cancel);

    match pump.run(&request).await {
        Ok(counters) => {
            println!("✓ Transfer complete");
            print_counters(&counters);
            if let Some(path) = &config.checkpoint.path {
                checkpoint::remove(path)?;
            }
            Ok(())
        }
        Err(failure) => {
            error!(error = %failure.error, retriable = failure.is_retriable(), "transfer stopped");
            println!("✗ Transfer stopped: {}", failure.error);
            print_counters(&failure.counters);
            match &failure.last_checkpoint {
                Some(cp) => println!("  Last checkpoint: {}", cp),
                None => println!("  No batch committed"),
            }
            Err(failure.into())
        }
    }
}

fn print_counters(counters: &TransferCounters) {
    println!("  Rows fetched:   {}", counters.rows_fetched);
    println!("  Rows inserted:  {}", counters.rows_inserted);
    println!("  Rows deleted:   {}", counters.rows_deleted);
    println!("  Batches:        {}", counters.batches_completed);
    println!("  Partitions:     {}", counters.partitions_completed);
}

fn validate_config(config: &JobConfig) -> Result<()> {
    let request = config.request()?;
    println!("✓ Configuration valid!\n");

    println!("Transfer:");
    println!("  Source:       {}", request.source_table);
    println!("  Destination:  {}", request.destination_table);
    println!("  Strategy:     {}", request.strategy);
    println!("  Batch size:   {}", request.batch_size);
    println!(
        "  Partitions:   {}",
        if request.partition_scoping {
            "scoped when possible"
        } else {
            "ignored"
        }
    );
    if let Some(start) = &request.start_keys {
        println!("  Start keys:   {}", start);
    }
    if let Some(end) = &request.end_keys {
        println!("  End keys:     {}", end);
    }
    if let Some(filter) = &request.filter {
        println!("  Filter:       {}", filter);
    }
    println!();

    println!("Endpoints:");
    println!("  Source:       {:?}", config.source);
    println!("  Destination:  {:?}", config.destination);
    println!();

    match &config.checkpoint.path {
        Some(path) => println!("Checkpoint file: {}", path.display()),
        None => println!("Checkpoint file: none (checkpoints are logged only)"),
    }
    Ok(())
}

async fn show_plan(config: JobConfig) -> Result<()> {
    let request = config.request()?;
    let (source, destination) = connect(&config).await?;
    let pump = BackfillPump::new(Arc::clone(&source), destination);
    let plan = pump.plan(&request).await?;

    println!("Key: {}", plan.fetch.key_columns().join(", "));
    println!("Columns: {}", plan.write.columns.join(", "));
    if let Some(staging) = &plan.write.staging {
        println!(
            "Staging: {}{}",
            staging.table,
            if staging.temporary { " (temporary)" } else { "" }
        );
    }
    println!();

    for info in &plan.partitions {
        let Some(boundary) = plan.boundary.enter_partition(info.number) else {
            println!("Partition {}: completed before restart\n", info.number);
            continue;
        };
        println!("Partition {} (~{} rows)", info.number, info.row_count);

        let probe = plan.fetch.limit_probe(&boundary)?;
        println!("  Probe:  {}", probe.sql);
        println!("  Params: {:?}", probe.params);

        match source.probe_limit(&probe).await? {
            Some(limit) => {
                let (upper, is_final) = boundary.clamp_limit(limit);
                let scan = plan.fetch.batch_scan(&boundary, &upper, is_final)?;
                println!("  Scan:   {}", scan.sql);
                println!("  Params: {:?}", scan.params);
            }
            None => println!("  No rows in range"),
        }
        println!();
    }
    Ok(())
}

fn show_checkpoint(config: &JobConfig) -> Result<()> {
    let path = config.checkpoint_path()?;
    match CheckpointFile::load(path)? {
        Some(file) => {
            println!("Checkpoint file: {}", path.display());
            println!("  Transfer:   {} -> {}", file.source_table, file.destination_table);
            println!("  Partition:  {}", file.checkpoint.partition);
            println!("  Last key:   {}", file.checkpoint.keys);
            println!("  Written:    {}", file.updated_at);
            print_counters(&file.counters);
        }
        None => println!("No checkpoint at {}", path.display()),
    }
    Ok(())
}
