mod config;
mod daemon;
mod layout;
mod locator;
mod retention;
mod role;
mod runner;
mod session;
mod signals;
mod status;
mod timestamp;
mod upload;

use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use config::{ConfigError, Identity, ProfilerConfig, Settings};
use daemon::{Daemon, SystemClock};
use layout::OutputLayout;
use role::ComponentRole;
use runner::SystemRunner;
use std::path::PathBuf;
use std::sync::Arc;
use upload::S3Uploader;

/// Continuous profiling daemon: find the target process, sample it with an
/// external profiler, upload the trace, prune old traces, and repeat.
#[derive(Parser, Debug)]
#[command(name = "flamewatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "PROFILER_CONFIG", default_value = "profiler.toml")]
    config: PathBuf,

    /// Profiling is enabled (without this the daemon exits immediately)
    #[arg(
        long,
        env = "PROFILER_ENABLED",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value = "false",
        default_missing_value = "true",
        value_parser = FalseyValueParser::new()
    )]
    enabled: bool,

    /// Component role to profile (scheduler, worker, webserver)
    #[arg(long, env = "PROFILER_COMPONENT")]
    component: Option<ComponentRole>,

    /// Home directory; traces go under {home}/profiler/{env}/{component}
    #[arg(long, env = "PROFILER_HOME")]
    home: Option<PathBuf>,

    /// Environment name used in the output path and remote key
    #[arg(long, env = "PROFILER_ENV_NAME", default_value = "Unknown")]
    env_name: String,

    /// Bucket to upload traces to (overrides config)
    #[arg(long, env = "PROFILER_S3_BUCKET")]
    bucket: Option<String>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (process listings, state transitions)
    #[arg(short, long)]
    verbose: bool,
}

/// Exit code for a daemon that must not start, or None to proceed.
fn startup_exit_code(cli: &Cli) -> Option<i32> {
    if cli.enabled {
        None
    } else {
        Some(1)
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Merge the config file with CLI/environment identity.
fn resolve_settings(cli: &Cli) -> Result<Settings, ConfigError> {
    let mut config = ProfilerConfig::load(&cli.config)?;
    if let Some(bucket) = &cli.bucket {
        config.storage.bucket = Some(bucket.clone());
    }

    let component = cli.component.clone().ok_or_else(|| {
        ConfigError::Invalid("component role is required (--component or PROFILER_COMPONENT)".into())
    })?;
    let home = match &cli.home {
        Some(home) => home.clone(),
        None => std::env::current_dir().map_err(|e| ConfigError::Read {
            path: PathBuf::from("."),
            source: e,
        })?,
    };

    Ok(Settings {
        identity: Identity {
            component,
            home,
            env_name: cli.env_name.clone(),
        },
        config,
    })
}

fn print_settings(settings: &Settings) {
    let layout = OutputLayout::from_identity(&settings.identity);
    let config = &settings.config;
    println!("flamewatch v{}", env!("CARGO_PKG_VERSION"));
    println!("component:        {}", settings.identity.component);
    println!("output directory: {}", layout.output_dir().display());
    println!("remote prefix:    {}", layout.relative_dir().display());
    println!(
        "bucket:           {}",
        settings.bucket().unwrap_or("(none, uploads disabled)")
    );
    println!(
        "session:          {}s, sleep {}s, retention {}m",
        config.schedule.session_duration_secs,
        config.schedule.sleep_secs,
        config.schedule.retention_mins
    );
    println!(
        "sampler:          {} {}",
        config.sampler.command,
        config.sampler.args.join(" ")
    );
    println!(
        "locator:          {} {}",
        config.locator.command,
        config.locator.args.join(" ")
    );
}

async fn run(cli: &Cli, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let storage = &settings.config.storage;
    let uploader =
        S3Uploader::new_with_default_config(storage.endpoint.clone(), storage.path_style).await;
    let component = settings.identity.component.clone();

    let mut daemon = Daemon::new(
        settings,
        Arc::new(SystemRunner),
        Arc::new(uploader),
        Arc::new(SystemClock),
    );
    let _lock = daemon.layout().acquire_lock()?;
    let mut shutdown = signals::install()?;

    tracing::info!(
        component = %component,
        dir = %daemon.layout().output_dir().display(),
        "profiler starting"
    );

    if cli.once {
        daemon.run_cycle(&mut shutdown).await.log(1);
    } else {
        daemon.run(shutdown).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    if let Some(code) = startup_exit_code(&cli) {
        tracing::info!("profiler is not enabled, exiting");
        std::process::exit(code);
    }

    let settings = match resolve_settings(&cli) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    if cli.dry_run {
        print_settings(&settings);
        return;
    }

    if let Err(e) = run(&cli, settings).await {
        tracing::error!(error = %e, "profiler failed to start");
        std::process::exit(2);
    }
}
