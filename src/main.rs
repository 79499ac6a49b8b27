use anyhow::{Context, Result};
use bulk_courier::config::Settings;
use bulk_courier::recipients::{load_recipients, Attachment};
use bulk_courier::runner::{BatchRunner, RunConfig};
use bulk_courier::session::ChromeBootstrap;
use clap::Parser;
use dotenvy::dotenv;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Send one message (and optionally one attachment) to every recipient in a table.
#[derive(Debug, Parser)]
#[command(name = "bulk-courier", version, about)]
struct Cli {
    /// JSON array of rows with a contact column and an optional `Message` column
    recipients: PathBuf,

    /// File sent to every recipient; the message becomes its caption
    #[arg(short, long)]
    attachment: Option<PathBuf>,

    /// Validate input and exit without opening a browser
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let settings = init_settings();
    init_logging(&settings)?;

    info!("Starting bulk courier...");

    let loaded = load_recipients(&cli.recipients)
        .with_context(|| format!("Failed to load recipients from {}", cli.recipients.display()))?;
    info!(
        count = loaded.recipients.len(),
        dropped = loaded.dropped,
        column = %loaded.contact_column,
        "Recipients loaded"
    );

    let attachment = cli
        .attachment
        .as_deref()
        .map(|path| Attachment::from_path(path, settings.max_file_size))
        .transpose()
        .context("Attachment rejected")?;

    if cli.dry_run {
        println!(
            "{} valid recipients ({} dropped), contact column '{}'{}",
            loaded.recipients.len(),
            loaded.dropped,
            loaded.contact_column,
            attachment
                .as_ref()
                .map(|a| format!(", attachment {} ({:?})", a.path.display(), a.kind))
                .unwrap_or_default()
        );
        return Ok(());
    }

    let bootstrap = Arc::new(ChromeBootstrap::new(settings.webdriver_config()));
    let runner = BatchRunner::new(bootstrap, RunConfig::from_settings(&settings));
    let mut handle = runner.start(loaded.recipients, attachment)?;

    let mut printed = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let summary = loop {
        tokio::select! {
            joined = &mut handle => break joined.context("Run worker crashed")?,
            _ = tokio::signal::ctrl_c() => {
                if runner.stop() {
                    info!("Stop requested, waiting for the current recipient to finish");
                }
            }
            _ = ticker.tick() => printed = print_new_lines(&runner, printed),
        }
    };
    print_new_lines(&runner, printed);

    println!(
        "Done: {} delivered, {} failed, {} skipped{}",
        summary.success,
        summary.failure,
        summary.skipped,
        if summary.cancelled { " (stopped early)" } else { "" }
    );
    if summary.bootstrap_failed {
        anyhow::bail!("Could not open a logged-in browser session");
    }
    Ok(())
}

/// Print run-log lines not yet shown, followed by a counter line when something changed.
fn print_new_lines(runner: &BatchRunner, printed: usize) -> usize {
    let state = runner.progress();
    if state.log.len() == printed {
        return printed;
    }
    for entry in state.log.iter().skip(printed) {
        println!("{entry}");
    }
    println!(
        "  -- {}/{} | sent {} | failed {}",
        state.current_index, state.total, state.success_count, state.failure_count
    );
    state.log.len()
}

fn init_settings() -> Settings {
    match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    }
}

fn init_logging(settings: &Settings) -> Result<()> {
    if let Some(path) = &settings.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .init();
    } else {
        // The run log is already printed to stdout
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,bulk_courier::run_log=off"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    info!("Configuration loaded successfully.");
    if !settings.has_persistent_profile() {
        warn!("No Chrome user data directory configured; a QR code scan will be required");
    }
    Ok(())
}
