//! pkgrelay CLI tool.

use clap::{Parser, Subcommand};
use pkgrelay_core::PackageType;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pkgrelay")]
#[command(about = "Build components in parallel and publish deb/rpm repositories", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "PKGRELAY_CONFIG", default_value = "pkgrelay.kdl")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "PKGRELAY_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every job and publish the results
    Run {
        /// Override the run working directory
        #[arg(long, env = "PKGRELAY_WORK_DIR")]
        work_dir: Option<PathBuf>,
        /// Record uploads in memory instead of sending them to the registry
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate the configuration and the job graph
    Validate,
    /// Show jobs, resolved commands and fan-in edges
    Plan,
    /// Resolve the version of a package file name
    Resolve {
        /// Package file name
        file: String,
        /// Version declared by the job
        #[arg(long)]
        declared: Option<String>,
    },
    /// Generate repository metadata for package files
    Index {
        /// Package type to index
        #[arg(long = "type")]
        package_type: PackageType,
        /// Repository root to write
        #[arg(long)]
        root: PathBuf,
        /// Version used for files without one in their name
        #[arg(long)]
        declared: Option<String>,
        /// Package files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run { work_dir, dry_run } => {
            commands::run::run(&cli.config, work_dir, dry_run, cli.json).await?;
        }
        Commands::Validate => {
            commands::validate(&cli.config)?;
        }
        Commands::Plan => {
            commands::plan(&cli.config)?;
        }
        Commands::Resolve { file, declared } => {
            commands::resolve(&file, declared.as_deref())?;
        }
        Commands::Index {
            package_type,
            root,
            declared,
            files,
        } => {
            commands::index(&cli.config, package_type, &root, declared.as_deref(), &files).await?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
