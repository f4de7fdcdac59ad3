use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use dpt_core::Signal;
use dpt_source::FixturePuzzleSource;
use dpt_sync::{today_now, ReconcileAction, SyncConfig, SyncPipeline};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dpt-cli")]
#[command(about = "Daily puzzle tracker: fetch, reconcile and archive the daily puzzle answer")]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct PathArgs {
    /// Current state file (env DPT_DATA_PATH).
    #[arg(long, global = true)]
    data_path: Option<PathBuf>,

    /// History file (env DPT_HISTORY_PATH).
    #[arg(long, global = true)]
    history_path: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch today's puzzle and reconcile it with stored state (default).
    Run(RunArgs),
    /// Print the stored current state.
    Show,
    /// Print the newest archived entries.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, Args, Default)]
struct RunArgs {
    /// Override today's date (YYYY-MM-DD) instead of the US Eastern calendar date.
    #[arg(long)]
    today: Option<NaiveDate>,

    /// Reconcile a saved payload instead of calling the API.
    #[arg(long)]
    payload_file: Option<PathBuf>,

    /// API endpoint (env DPT_API_URL).
    #[arg(long)]
    api_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.paths.data_path {
        config.data_path = path;
    }
    if let Some(path) = cli.paths.history_path {
        config.history_path = path;
    }

    let result = match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, args).await,
        Commands::Show => show(&config).await,
        Commands::History { limit } => history(&config, limit).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            println!("outcome={}", Signal::CriticalUnexpected);
            ExitCode::from(Signal::CriticalUnexpected.exit_code())
        }
    }
}

async fn run(mut config: SyncConfig, args: RunArgs) -> Result<ExitCode> {
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }
    let pipeline = match args.payload_file {
        Some(path) => SyncPipeline::with_source(config, Box::new(FixturePuzzleSource::new(path))),
        None => SyncPipeline::new(config)?,
    };
    let today = args.today.unwrap_or_else(today_now);

    let signal = match pipeline.run_once(today).await {
        Ok(summary) => {
            let signal = summary.signal();
            let archived = match &summary.action {
                ReconcileAction::Updated { archived, .. } => format!(" archived={archived:?}"),
                _ => String::new(),
            };
            println!(
                "outcome={} disposition={} today={} date={} solution={:?} run_id={}{}",
                signal,
                signal.disposition().as_str(),
                summary.today,
                summary.fetched.date,
                summary.fetched.solution,
                summary.run_id,
                archived
            );
            signal
        }
        Err(err) => {
            let signal = err.signal();
            error!(error = %err, outcome = %signal, "run failed");
            println!(
                "outcome={} disposition={} today={} error={:?}",
                signal,
                err.disposition().as_str(),
                today,
                err.to_string()
            );
            signal
        }
    };
    Ok(ExitCode::from(signal.exit_code()))
}

async fn show(config: &SyncConfig) -> Result<ExitCode> {
    let state = config.store().load_current().await;
    let json = serde_json::to_string_pretty(&state).context("serializing current state")?;
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

async fn history(config: &SyncConfig, limit: usize) -> Result<ExitCode> {
    let log = config.store().load_history().await;
    let newest = &log.entries()[..limit.min(log.len())];
    let json = serde_json::to_string_pretty(newest).context("serializing history")?;
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}
