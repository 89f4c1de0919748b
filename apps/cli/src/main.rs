//! rescache CLI - fetch, inspect and manage a resource cache
//!
//! Every command opens the cache, restores its index, does its work and
//! shuts the registry down so the index is flushed before exit.

mod commands;
mod config;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rescache_core::Registry;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// rescache - resource fetch-and-cache coordinator
#[derive(Parser)]
#[command(name = "rescache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Cache directory, overrides the configured one
    #[arg(long, env = "RESCACHE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory holding settings.json
    #[arg(long, env = "RESCACHE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Max concurrent downloads, overrides the configured value
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download resources into the cache and wait for all of them
    Fetch {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// Fetch again even when already cached
        #[arg(short, long)]
        force: bool,
    },

    /// Print or write the cached bytes of a resource
    Get {
        url: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store a file's contents as the cached bytes of a resource
    Seed {
        url: String,

        /// File to read
        file: PathBuf,
    },

    /// Remove a resource's cached bytes
    Remove { url: String },

    /// List known resources
    List {
        /// Filter by status (not_downloaded, in_progress, downloaded)
        #[arg(short, long)]
        status: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show resource info
    Info { url: String },

    /// Evict every expired resource
    Sweep,

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all config
    Show,

    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value, `none` clears optional keys
        value: String,
    },

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings_path = config::settings_path(cli.config_dir.as_deref());

    // Commands that never touch the cache
    match &cli.command {
        Commands::Config { action } => {
            return commands::config_action(&settings_path, action.as_ref(), cli.output).await;
        }
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "rescache",
                &mut std::io::stdout(),
            );
            return Ok(());
        }
        _ => {}
    }

    let mut settings = config::load_settings(&settings_path).await?;
    if let Some(cache_dir) = cli.cache_dir {
        settings.cache_dir = cache_dir;
    }
    if let Some(max) = cli.max_concurrent {
        settings.max_concurrent_downloads = max;
    }

    let registry = Registry::open(settings).await?;

    let result = match cli.command {
        Commands::Fetch { urls, force } => {
            commands::fetch(&registry, urls, force, cli.output).await
        }
        Commands::Get { url, output } => commands::get(&registry, &url, output).await,
        Commands::Seed { url, file } => commands::seed(&registry, &url, file, cli.output).await,
        Commands::Remove { url } => commands::remove(&registry, &url, cli.output),
        Commands::List { status, all } => commands::list(&registry, status, all, cli.output),
        Commands::Info { url } => commands::info(&registry, &url, cli.output),
        Commands::Sweep => commands::sweep(&registry, cli.output),
        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    };

    registry.shutdown().await?;
    result
}
