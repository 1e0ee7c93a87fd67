use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jobhub_sync::{shutdown_on_ctrl_c, Pipeline, PipelineConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobhub")]
#[command(about = "Job market data hub: collect, merge, classify and serve postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pipeline cycle, or keep cycling with --watch.
    Run {
        #[arg(long, default_value = "all")]
        portal: String,
        #[arg(long)]
        watch: bool,
        /// Seconds between cycles in watch mode (minimum 30).
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Rebuild the cross-portal master table.
    Master,
    /// Fill missing taxonomy cells in every portal table.
    Backfill,
    /// Write the data quality report.
    Report,
    /// Serve the read-only jobs API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "jobhub=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        portal: "all".to_string(),
        watch: false,
        interval: None,
    }) {
        Commands::Run {
            portal,
            watch,
            interval,
        } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(config.watch_interval);
            let pipeline = Pipeline::from_config(config).await?;
            let shutdown = shutdown_on_ctrl_c();
            if watch {
                pipeline.watch(&portal, interval, shutdown).await?;
            } else {
                let summary = pipeline.run_cycle(&portal, &shutdown).await?;
                let inserted: usize = summary.portals.iter().map(|p| p.inserted).sum();
                let updated: usize = summary.portals.iter().map(|p| p.updated).sum();
                println!(
                    "cycle complete: cycle_id={} portals={} failed={} inserted={} updated={} master_rows={} interrupted={}",
                    summary.cycle_id,
                    summary.portals.len(),
                    summary.failed_portals.len(),
                    inserted,
                    updated,
                    summary.master.map_or(0, |m| m.output_rows),
                    summary.interrupted
                );
            }
        }
        Commands::Master => {
            let pipeline = Pipeline::from_config(config).await?;
            let stats = pipeline.write_master().await?;
            println!(
                "master built: input_rows={} output_rows={} duplicates_dropped={} taxonomy_filled={}",
                stats.input_rows, stats.output_rows, stats.duplicates_dropped, stats.taxonomy_filled
            );
        }
        Commands::Backfill => {
            let pipeline = Pipeline::from_config(config).await?;
            for (portal, counts) in pipeline.backfill_portals().await {
                println!(
                    "backfill {portal}: updated={} changed={}",
                    counts.updated, counts.changed
                );
            }
        }
        Commands::Report => {
            let pipeline = Pipeline::from_config(config).await?;
            let report = pipeline.write_quality_report().await?;
            for table in &report.tables {
                println!(
                    "{}: rows={} overall={:.2}% core={:.2}% sparse_columns={}",
                    table.table,
                    table.rows,
                    table.overall_sparsity_pct,
                    table.core_sparsity_pct,
                    table.sparse_columns
                );
            }
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            jobhub_web::serve(jobhub_web::AppState::from_config(&config), port).await?;
        }
    }

    Ok(())
}
