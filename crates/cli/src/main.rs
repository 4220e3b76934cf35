mod commands;

use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use s3ql_core::{Config, FsResult};

#[derive(Parser)]
#[command(name = "s3ql")]
#[command(about = "Deduplicating, encrypting file system for object stores", long_about = None)]
struct Cli {
    #[arg(short = 'c', long = "config", global = true, help = "Config file path")]
    config_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Cache directory (overrides config)")]
    cachedir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new file system
    Mkfs {
        /// Storage URL (e.g. local:///path/to/bucket)
        storage_url: String,
        #[arg(long, default_value = "", help = "File system label")]
        label: String,
        #[arg(
            long = "block-size",
            default_value_t = s3ql_core::config::DEFAULT_BLOCK_SIZE,
            help = "Data block size in bytes"
        )]
        block_size: u64,
        #[arg(long, help = "Overwrite an existing file system")]
        force: bool,
    },
    /// Mount a file system
    Mount {
        storage_url: String,
        mountpoint: String,
    },
    /// Unmount a mounted file system
    Umount { mountpoint: String },
    /// Check and repair a file system
    Fsck {
        storage_url: String,
        #[arg(long, help = "Download and verify every object")]
        deep: bool,
    },
    /// Administration commands
    Adm {
        #[command(subcommand)]
        cmd: commands::adm::AdmCommand,
    },
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut builder = ::config::Config::builder();
    if let Some(config_file) = &cli.config_file {
        builder = builder.add_source(::config::File::from(config_file.clone()).required(true));
    }
    let mut cfg: Config = builder
        .add_source(::config::Environment::with_prefix("S3QL"))
        .build()?
        .try_deserialize()
        .unwrap_or_default();

    if let Some(cachedir) = &cli.cachedir {
        cfg.cachedir = cachedir.clone();
    }
    Ok(cfg)
}

fn main() {
    let third_party_filter = "sqlx=warn,fuse3=warn";
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .map(|filter| {
                    format!("{filter},{third_party_filter}")
                        .parse()
                        .unwrap_or(filter)
                })
                .unwrap_or_else(|_| format!("info,{third_party_filter}").into()),
        )
        .with({
            let is_terminal = std::io::stdout().is_terminal();
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_ansi(is_terminal)
                .with_target(false)
        })
        .init();

    let cli = Cli::parse();
    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result: FsResult<()> = rt.block_on(async {
        match cli.command {
            Commands::Mkfs {
                storage_url,
                label,
                block_size,
                force,
            } => commands::mkfs::execute(&cfg, &storage_url, label, block_size, force).await,
            Commands::Mount {
                storage_url,
                mountpoint,
            } => commands::mount::execute(cfg.clone(), &storage_url, &mountpoint).await,
            Commands::Umount { mountpoint } => commands::umount::execute(&mountpoint).await,
            Commands::Fsck { storage_url, deep } => {
                commands::fsck::execute(&cfg, &storage_url, deep).await
            }
            Commands::Adm { cmd } => commands::adm::execute(&cfg, cmd).await,
        }
    });

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(e.exit_code());
    }
}
