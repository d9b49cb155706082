use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stage_builder::config::{self, BuildConfig};
use stage_builder::error::{self, ConfigError};
use stage_builder::pipeline::compress_maps;
use stage_builder::{preflight, run_target, SystemRunner, TargetKind};
use tracing_subscriber::EnvFilter;

/// Build distribution stages, live media, package bundles and snapshots.
#[derive(Parser)]
#[command(name = "stage-builder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (default: /etc/stage-builder/stage-builder.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Build spec file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Override a value, e.g. -C version_stamp=2024.1
    #[arg(short = 'C', long = "cli", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Debug output
    #[arg(short, long)]
    debug: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Remove the previous chroot or scratch tree before building
    #[arg(long)]
    purge: bool,

    /// Skip the root privilege check
    #[arg(long)]
    no_root_check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Outcome::Usage(e)) => {
            report(&e);
            ExitCode::from(2)
        }
        Err(Outcome::Build(e)) => {
            report(&e);
            ExitCode::from(1)
        }
    }
}

/// Configuration, privilege and host-tool failures exit with 2, build
/// failures with 1.
enum Outcome {
    Usage(anyhow::Error),
    Build(anyhow::Error),
}

fn init_logging(cli: &Cli) {
    let default = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose || cli.debug)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn report(err: &anyhow::Error) {
    tracing::error!("{}", err);
    for cause in err.chain().skip(1) {
        tracing::error!("  caused by: {}", cause);
    }
}

fn usage<E: Into<anyhow::Error>>(e: E) -> Outcome {
    Outcome::Usage(e.into())
}

fn run(cli: Cli) -> Result<(), Outcome> {
    if cli.file.is_none() && cli.overrides.is_empty() {
        return Err(usage(anyhow::anyhow!(
            "nothing to build: pass a spec file with -f or values with -C"
        )));
    }

    let mut config = config::load(cli.config.as_deref(), cli.file.as_deref(), &cli.overrides)
        .context("loading configuration")
        .map_err(usage)?;
    if cli.purge {
        config.add_option("purge");
    }

    let kind = target_kind(&config).map_err(usage)?;
    if !cli.no_root_check {
        preflight::check_root().map_err(usage)?;
    }
    check_tools(kind, &config).map_err(usage)?;

    run_target(config, Arc::new(SystemRunner)).map_err(|e| {
        if error::is_config_error(&e) {
            Outcome::Usage(e)
        } else {
            Outcome::Build(e)
        }
    })
}

fn target_kind(config: &BuildConfig) -> Result<TargetKind> {
    let name = config
        .get_str("target")
        .ok_or_else(|| ConfigError::MissingKey("target".to_string()))?;
    Ok(name.parse()?)
}

fn check_tools(kind: TargetKind, config: &BuildConfig) -> Result<()> {
    let base = match kind {
        TargetKind::Snapshot => preflight::SNAPSHOT_TOOLS,
        _ => preflight::CHROOT_TOOLS,
    };
    let (compressor, decompressor) = compress_maps(config, Arc::new(SystemRunner))?;
    let mut extra = compressor.tools(compressor.default_mode());
    extra.extend(decompressor.tools(decompressor.default_mode()));
    preflight::check_host_tools(base, &extra)
}
