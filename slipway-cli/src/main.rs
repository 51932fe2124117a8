use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use slipway_core::{Config, SlipwayError, StorePaths};
use std::net::IpAddr;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "slipway")]
#[command(about = "Build and launch single-process dashboard images", long_about = None)]
struct Cli {
    /// Data directory (defaults to $SLIPWAY_DATA_DIR or ~/.slipway)
    #[arg(long, global = true, env = "SLIPWAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a dashboard project
    Build {
        /// Build context directory
        #[arg(default_value = ".")]
        context: PathBuf,

        /// Image tag (name[:tag]), defaults to the context directory name
        #[arg(short, long)]
        tag: Option<String>,

        /// Recipe file relative to the context
        #[arg(short = 'f', long)]
        file: Option<String>,

        /// Build arguments (KEY=VALUE)
        #[arg(long = "build-arg")]
        build_args: Vec<String>,

        /// Execute every step, ignoring the layer cache
        #[arg(long)]
        no_cache: bool,

        /// RUN step isolation: auto, chroot or host
        #[arg(long)]
        isolation: Option<String>,
    },

    /// Launch an image as a single foreground process
    Run {
        /// Image reference (name[:tag])
        image: String,

        /// Port the dashboard binds
        #[arg(short, long)]
        port: Option<u16>,

        /// Address the dashboard binds
        #[arg(long)]
        address: Option<IpAddr>,

        /// Isolation: auto, chroot or host
        #[arg(long)]
        isolation: Option<String>,
    },

    /// List images
    Images,

    /// Remove image tags
    Rmi {
        /// Image references
        #[arg(required = true)]
        images: Vec<String>,
    },

    /// Write the default dashboard recipe into a project
    Init {
        /// Project directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Overwrite an existing Dockerfile
        #[arg(long)]
        force: bool,
    },

    /// Manage the layer cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache usage
    Info,

    /// Drop all cache entries
    Prune,

    /// Remove untagged images and unreferenced layer blobs
    Gc,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            e.downcast_ref::<SlipwayError>().map_or(1, SlipwayError::exit_code)
        }
    };

    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let paths = cli.data_dir.map(StorePaths::new).unwrap_or_else(StorePaths::from_env);
    let config = Config::load(&paths).context("Failed to load configuration")?;

    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    if let Err(e) = slipway_core::init_observability(level) {
        eprintln!("{} failed to initialize logging: {}", "warning:".yellow(), e);
    }
    tracing::debug!(data_dir = %paths.root().display(), "Using data directory");

    match cli.command {
        Commands::Build { context, tag, file, build_args, no_cache, isolation } => {
            let args = commands::build::BuildArgs {
                context,
                tag,
                file,
                build_args: commands::parse_key_values(&build_args)?,
                no_cache,
                isolation: isolation.as_deref().map(commands::parse_isolation).transpose()?,
            };
            commands::build::build(args, &config, &paths).await?;
            Ok(0)
        }

        Commands::Run { image, port, address, isolation } => {
            let isolation = isolation.as_deref().map(commands::parse_isolation).transpose()?;
            commands::run::run(&image, port, address, isolation, &config, &paths).await
        }

        Commands::Images => {
            commands::images::images(&paths)?;
            Ok(0)
        }

        Commands::Rmi { images } => {
            commands::images::rmi(&images, &paths)?;
            Ok(0)
        }

        Commands::Init { dir, force } => {
            commands::init::init(&dir, force, &config)?;
            Ok(0)
        }

        Commands::Cache(cache_cmd) => {
            match cache_cmd {
                CacheCommands::Info => commands::cache::info(&config, &paths)?,
                CacheCommands::Prune => commands::cache::prune(&config, &paths)?,
                CacheCommands::Gc => commands::cache::gc(&config, &paths)?,
            }
            Ok(0)
        }
    }
}
