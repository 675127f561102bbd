// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stowage CLI
//!
//! One front end for every registered storage: browse, transfer, archive.

mod commands;
mod config;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use stow_engine::{ArchiveFormat, ConflictPolicy};

#[derive(Parser)]
#[command(name = "stow")]
#[command(author, version, about = "Stowage - one interface for every storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(long, global = true, env = "STOW_CONFIG")]
    config: Option<PathBuf>,

    /// Permit loopback and private addresses as endpoints for this run
    #[arg(long, global = true)]
    allow_local_ips: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered storages
    #[command(subcommand)]
    Storage(StorageCommand),

    /// List directory contents
    #[command(alias = "dir")]
    Ls {
        /// `storage:path`, `stow://storage/path` or a path on the default storage
        #[arg(default_value = "/")]
        path: String,

        /// Long format with details
        #[arg(short, long)]
        long: bool,

        /// Show all files including hidden
        #[arg(short, long)]
        all: bool,

        /// Human-readable sizes
        #[arg(short = 'H', long)]
        human: bool,
    },

    /// Show file or directory information
    Stat {
        path: String,
    },

    /// Copy files or directories into a directory
    Cp {
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Move files or directories into a directory
    Mv {
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Remove files or directories
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Create a directory and any missing parents
    Mkdir {
        path: String,
    },

    /// Upload a local file to an exact storage path
    Upload {
        local: PathBuf,
        dest: String,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Download a file to a local path, or to stdout with `-`
    Download {
        source: String,

        #[arg(default_value = "-")]
        local: String,
    },

    /// Pack files and directories into an archive
    Compress {
        #[arg(required = true)]
        sources: Vec<String>,

        /// Archive to create
        #[arg(short, long)]
        to: String,

        #[command(flatten)]
        archive: ArchiveArgs,
    },

    /// Unpack an archive into a directory
    Extract {
        archive: String,

        dest: String,

        #[command(flatten)]
        archive_args: ArchiveArgs,
    },

    /// Show the endpoint policy or check an endpoint against it
    Policy {
        /// Host, `host:port` or URL to check
        endpoint: Option<String>,
    },
}

#[derive(Subcommand)]
enum StorageCommand {
    /// List registered storages
    List,

    /// Register a storage
    Add {
        id: String,

        /// local, object-store, webdav, ftp, sftp, cloud-drive, network-share or memory
        #[arg(short, long)]
        kind: String,

        /// Display name (defaults to the id)
        #[arg(short, long)]
        name: Option<String>,

        /// Config entries as key=value; values may be `env:VAR`
        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        config: Vec<String>,

        #[arg(long)]
        icon: Option<String>,

        /// Make this the default storage
        #[arg(long)]
        default: bool,
    },

    /// Unregister a storage
    Remove {
        id: String,
    },

    /// Make a storage the default
    Default {
        id: String,
    },

    /// Connect to a registered storage and run its health check
    Test {
        id: String,
    },

    /// Show a storage's descriptor with secrets masked
    Show {
        id: String,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// What to do when a destination exists: fail, overwrite or skip
    #[arg(long, default_value = "fail")]
    conflict: ConflictPolicy,
}

#[derive(Args)]
struct ArchiveArgs {
    /// zip, tar or tar.gz; inferred from the archive name when omitted
    #[arg(short, long)]
    format: Option<ArchiveFormat>,

    /// What to do when a destination exists: fail, overwrite or skip
    #[arg(long, default_value = "fail")]
    conflict: ConflictPolicy,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "stow=debug" } else { "stow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = run(cli).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> stow_core::StowResult<()> {
    let mut config = config::Config::load(cli.config.as_deref())?;
    if cli.allow_local_ips {
        config.security.allow_local_ips = true;
    }
    let app = commands::App::open(&config).await?;

    match cli.command {
        Commands::Storage(command) => match command {
            StorageCommand::List => app.storage_list().await,
            StorageCommand::Add {
                id,
                kind,
                name,
                config,
                icon,
                default,
            } => app.storage_add(id, &kind, name, &config, icon, default).await,
            StorageCommand::Remove { id } => app.storage_remove(&id).await,
            StorageCommand::Default { id } => app.storage_default(&id).await,
            StorageCommand::Test { id } => app.storage_test(&id).await,
            StorageCommand::Show { id } => app.storage_show(&id),
        },
        Commands::Ls {
            path,
            long,
            all,
            human,
        } => app.ls(&path, long, all, human).await,
        Commands::Stat { path } => app.stat(&path).await,
        Commands::Cp { mut paths, transfer } => {
            let dest = paths.pop().unwrap_or_default();
            app.copy(&paths, &dest, transfer.conflict, false).await
        }
        Commands::Mv { mut paths, transfer } => {
            let dest = paths.pop().unwrap_or_default();
            app.copy(&paths, &dest, transfer.conflict, true).await
        }
        Commands::Rm { paths } => app.rm(&paths).await,
        Commands::Mkdir { path } => app.mkdir(&path).await,
        Commands::Upload {
            local,
            dest,
            transfer,
        } => app.upload(&local, &dest, transfer.conflict).await,
        Commands::Download { source, local } => app.download(&source, &local).await,
        Commands::Compress {
            sources,
            to,
            archive,
        } => {
            app.compress(&sources, &to, archive.format, archive.conflict)
                .await
        }
        Commands::Extract {
            archive,
            dest,
            archive_args,
        } => {
            app.extract(&archive, &dest, archive_args.format, archive_args.conflict)
                .await
        }
        Commands::Policy { endpoint } => app.policy(endpoint.as_deref()).await,
    }
}
