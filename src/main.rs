use std::{process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use rondo::{
    acquire::Acquirer,
    catalog::{self, Catalog, CatalogService},
    config::{Config, Credentials},
    error::{ErrorKind, Result},
    resolver::Resolver,
    search::{FallbackSearch, RelaySearch},
    session::Registry,
    sink::LocalSinkFactory,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Session key used by the CLI. The library supports many concurrent
/// sessions; the CLI drives exactly one.
const CLI_SESSION: u64 = 0;

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// What to play
    ///
    /// A playlist link, a direct URL, or free text to search for.
    input: String,

    /// Secrets file
    ///
    /// TOML file with the catalog API credentials. Only needed for
    /// playlist links; queries and direct URLs work without it.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Requester label shown next to queued tracks
    #[arg(short, long)]
    requester: Option<String>,

    /// Playlist window size
    ///
    /// How many upcoming playlist tracks to keep materialized.
    #[arg(short, long, default_value_t = 10)]
    window: usize,

    /// Playback volume from 0.0 to 1.0
    #[arg(long, default_value_t = 0.8)]
    volume: f32,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("rondo", level);
    }

    logger.init();
}

/// Main application loop.
///
/// Builds the registry with the local audio sink, submits the input to one
/// session, then runs until playback winds down or Ctrl-C arrives.
///
/// # Errors
///
/// Returns an error when the collaborators cannot be built or the input is
/// rejected outright (unknown playlist, destroyed session). Failures of
/// individual tracks are handled internally by skipping.
async fn run(args: Args) -> Result<()> {
    let mut config = Config::default();
    config.queue_window = args.window;
    config.volume = args.volume.clamp(0.0, 1.0);

    match Credentials::from_file(&args.secrets_file) {
        Ok(credentials) => config.credentials = Some(credentials),
        Err(e) if e.kind == ErrorKind::NotFound => {
            info!(
                "no secrets file at {}; playlist links are disabled",
                args.secrets_file
            );
        }
        Err(e) => return Err(e),
    }

    let catalog: Arc<dyn CatalogService> = if config.credentials.is_some() {
        Arc::new(Catalog::new(&config)?)
    } else {
        Arc::new(catalog::Unconfigured)
    };

    let resolver = Arc::new(Resolver::new(
        &config,
        Arc::new(RelaySearch::new(&config)?),
        Arc::new(FallbackSearch::new(&config)?),
        catalog,
    ));
    let acquirer = Arc::new(Acquirer::new(&config)?);
    let registry = Registry::new(config, resolver, acquirer, Arc::new(LocalSinkFactory));

    let player = registry.get_or_create(CLI_SESSION)?;
    player.play(&args.input, args.requester.as_deref()).await?;

    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                registry.shutdown().await;
                break Ok(());
            }

            _ = poll.tick() => {
                // The session removes itself after the inactivity timeout.
                if registry.is_empty() {
                    info!("session wound down");
                    break Ok(());
                }
            }
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
