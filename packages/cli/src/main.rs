#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `spill_chips`: satellite image chips for oil spill observations.
//!
//! ```text
//! spill_chips download-spills --out detected_spills
//! spill_chips plan spills.csv --evalscript-preset true-color
//! spill_chips fetch spills.csv --evalscript-preset true-color
//! spill_chips reconcile spills.csv --evalscript-preset true-color
//! ```
//!
//! `reconcile` rebuilds the same requests from the same records and
//! configuration, so it can repair a tree left behind by an interrupted
//! `fetch`.

mod config;

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use spill_chips_cli_utils::{DEFAULT_LOG_FILTER, IndicatifProgress, MultiProgress};
use spill_chips_dispatch::sentinel_hub::SentinelHubClient;
use spill_chips_dispatch::{DispatchReport, dispatch};
use spill_chips_reconcile::{FsRenamer, ReconcileReport, reconcile};
use spill_chips_request::{RequestBuilder, RequestPlan, build_plan};
use spill_chips_spill::helcom::{self, HelcomQuery};
use spill_chips_spill::records::load_records;

use crate::config::{FetchConfig, Overrides};

#[derive(Parser)]
#[command(
    name = "spill_chips",
    about = "Download and label satellite image chips for oil spill records"
)]
struct Cli {
    /// Config file (default: `spill_chips.toml` if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless `RUST_LOG` is set
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download HELCOM oil spill observations, one JSON file per spill
    DownloadSpills {
        /// Output directory
        #[arg(long, default_value = helcom::DEFAULT_OUTPUT_DIR)]
        out: PathBuf,
        /// `ArcGIS` where clause
        #[arg(long = "where")]
        where_clause: Option<String>,
    },
    /// Build requests and print them without contacting the service
    Plan {
        /// CSV file of spill records
        records: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Build requests, download every chip, and rename chips to record ids
    Fetch {
        /// CSV file of spill records
        records: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
        /// Leave downloaded chips under their download name
        #[arg(long)]
        no_reconcile: bool,
    },
    /// Rename already downloaded chips to record ids
    Reconcile {
        /// CSV file of spill records
        records: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let multi =
        spill_chips_cli_utils::init_logger(if cli.verbose { "debug" } else { DEFAULT_LOG_FILTER });
    let start = Instant::now();

    match cli.command {
        Commands::DownloadSpills { out, where_clause } => {
            let mut query = HelcomQuery::default();
            if let Some(where_clause) = where_clause {
                query.where_clause = where_clause;
            }
            let written = helcom::download_spills(&query, &out).await?;
            println!("Downloaded {} spill(s) to {}", written.len(), out.display());
        }
        Commands::Plan { records, overrides } => {
            let (_, plan) = prepare(cli.config.as_deref(), &overrides, &records)?;
            print_plan(&plan);
        }
        Commands::Fetch {
            records,
            overrides,
            no_reconcile,
        } => {
            let (config, plan) = prepare(cli.config.as_deref(), &overrides, &records)?;
            let report = download(&config, &plan, &multi).await?;

            // Rename whatever did download before reporting failures.
            if !no_reconcile {
                run_reconcile(&config, plan).await?;
            }
            report.into_result()?;
        }
        Commands::Reconcile { records, overrides } => {
            let (config, plan) = prepare(cli.config.as_deref(), &overrides, &records)?;
            run_reconcile(&config, plan).await?;
        }
    }

    log::info!("Done in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Loads config and records and builds the request plan.
fn prepare(
    config_path: Option<&Path>,
    overrides: &Overrides,
    records_path: &Path,
) -> Result<(FetchConfig, RequestPlan), Box<dyn std::error::Error>> {
    let mut config = FetchConfig::load(config_path)?;
    config.apply(overrides);

    let builder = RequestBuilder::new(config.request_config()?)?;
    let records = load_records(records_path, &config.records)?;
    let plan = build_plan(&builder, &records)?;

    Ok((config, plan))
}

fn print_plan(plan: &RequestPlan) {
    println!(
        "{:<20} {:<32} {:<44} TIME RANGE",
        "RECORD", "FOLDER", "BBOX (min_lon, min_lat, max_lon, max_lat)"
    );
    println!("{}", "-".repeat(140));
    for request in &plan.requests {
        let identifier = plan
            .index
            .identifier_for_token(&request.correlation)
            .unwrap_or("?");
        let [min_lon, min_lat, max_lon, max_lat] = request.geo.bbox();
        println!(
            "{identifier:<20} {:<32} ({min_lon:.4}, {min_lat:.4}, {max_lon:.4}, {max_lat:.4}) {}x{}  {} / {}",
            request.folder_name(),
            request.geo.width(),
            request.geo.height(),
            request.time.start.format("%Y-%m-%d"),
            request.time.end.format("%Y-%m-%d"),
        );
    }
    for rejected in &plan.rejected {
        println!("rejected {}: {}", rejected.identifier, rejected.reason);
    }
    for collision in &plan.collisions {
        println!(
            "collision {}: same box as {}",
            collision.shadowed, collision.kept
        );
    }
}

async fn download(
    config: &FetchConfig,
    plan: &RequestPlan,
    multi: &MultiProgress,
) -> Result<DispatchReport, Box<dyn std::error::Error>> {
    let client = SentinelHubClient::new(config.sentinel_hub()?)?;
    let progress = IndicatifProgress::downloads_bar(multi, "Downloading chips");

    let report = dispatch(
        &client,
        &plan.requests,
        &config.dispatch_options(),
        &progress,
    )
    .await?;

    for failure in &report.failures {
        log::error!("{}: {}", failure.folder, failure.error);
    }
    Ok(report)
}

async fn run_reconcile(
    config: &FetchConfig,
    plan: RequestPlan,
) -> Result<ReconcileReport, Box<dyn std::error::Error>> {
    let target_dir = config.target_dir.clone();
    let options = config.reconcile_options();
    let policy = options.unmatched;
    let index = plan.index;

    let report = tokio::task::spawn_blocking(move || {
        reconcile(&target_dir, &index, &options, &FsRenamer)
    })
    .await??;

    println!(
        "Renamed {} chip(s); {} unmatched, {} bad manifest(s), {} rename failure(s)",
        report.renamed.len(),
        report.unmatched.len(),
        report.manifest_errors.len(),
        report.rename_failures.len(),
    );
    Ok(report.check(policy)?)
}
