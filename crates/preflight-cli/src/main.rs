//! katago-preflight - smoke tests for a local KataGo HTTP server
//!
//! Checks the local installation, optionally launches the server, waits for
//! it to answer and exercises its inference endpoints.
//!
//! ## Variants
//!
//! - `attached`: test a server that is already running on port 2718
//! - `managed`: check files and deps, launch the Eigen server on port 2818,
//!   test it and shut it down
//!
//! Exit code is 0 when every stage and every contract case passed, 1 otherwise.

mod report;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use preflight_core::{HarnessConfig, Orchestrator, Variant};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, Level};

#[derive(Parser, Debug)]
#[command(name = "katago-preflight")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Preflight checks and smoke tests for a KataGo HTTP server", long_about = None)]
struct Cli {
    /// Server base URL (default depends on the variant)
    #[arg(env = "KATAGO_PREFLIGHT_URL")]
    base_url: Option<String>,

    /// Built-in configuration to start from
    #[arg(long, value_enum, default_value_t = VariantArg::Attached)]
    variant: VariantArg,

    /// TOML file layered over the selected variant
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum time to wait for the server, in seconds
    #[arg(long)]
    max_wait: Option<u64>,

    /// Delay between readiness probes, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Do not launch the server; it must already be running
    #[arg(long)]
    no_launch: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum VariantArg {
    Attached,
    Managed,
}

impl From<VariantArg> for Variant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Attached => Variant::Attached,
            VariantArg::Managed => Variant::Managed,
        }
    }
}

/// Resolve the run configuration: variant preset, then file, then flags.
fn build_config(cli: &Cli) -> Result<HarnessConfig> {
    let variant = Variant::from(cli.variant);

    let mut config = match &cli.config {
        Some(path) => HarnessConfig::from_file(variant, path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => HarnessConfig::for_variant(variant),
    };

    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url.clone());
    }
    if let Some(max_wait) = cli.max_wait {
        config.poll.max_wait_secs = max_wait;
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.poll.interval_ms = interval;
    }
    if cli.no_launch {
        config = config.without_launch();
    }

    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli)?;
    debug!(
        config = %serde_json::to_string(&config).unwrap_or_default(),
        "Resolved configuration"
    );

    let orchestrator = Orchestrator::new(config).context("Invalid preflight configuration")?;
    let report = orchestrator.run().await;

    println!("{}", report::render_report(&report));

    Ok(ExitCode::from(report.exit_code() as u8))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    preflight_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
