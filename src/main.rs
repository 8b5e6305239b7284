//! clusterform CLI
//!
//! Usage:
//!   clusterform plan [PATH] [--detailed-exitcode]   → show pending changes
//!   clusterform apply [PATH]                        → reconcile
//!   clusterform destroy                             → delete everything in state
//!   clusterform validate|graph|output [PATH]        → inspect declarations
//!   clusterform refresh|show|force-unlock           → inspect and repair state

use clap::{Parser, Subcommand};
use clusterform::{commands, logging, ClusterformConfig, Session};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "clusterform",
    version = env!("CARGO_PKG_VERSION"),
    about = "Declarative reconciliation for one managed Kubernetes cluster per region"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = "clusterform.toml")]
    config: PathBuf,

    /// State directory, overriding `[state] dir`
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Variable override, repeatable (value parsed as JSON when possible)
    #[arg(long = "var", value_name = "NAME=VALUE", global = true)]
    vars: Vec<String>,

    /// Maximum provider operations in flight
    #[arg(long, global = true)]
    concurrency: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check declarations without touching the provider
    Validate {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Show what apply would change
    Plan {
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Exit 2 when changes are pending, 0 when there are none
        #[arg(long, default_value_t = false)]
        detailed_exitcode: bool,
    },
    /// Make the provider match the declarations
    Apply {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Delete every object in state, dependents first
    Destroy,
    /// Print the resource graph in DOT format
    Graph {
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Write live provider state into the state store
    Refresh,
    /// List the state store
    Show {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print declared outputs
    Output {
        /// A single output, printed raw
        name: Option<String>,
        #[arg(long, default_value = ".")]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove a run lock left behind by a crashed run
    ForceUnlock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ClusterformConfig::load(&cli.config)?;
    let guard = logging::init(&config.log);
    if let Some(dir) = cli.state_dir {
        config.state.dir = dir;
    }
    if let Some(n) = cli.concurrency {
        config.executor.concurrency = n;
    }

    let session = Session::open(config, &cli.vars).await?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, letting in-flight operations finish");
                cancel.cancel();
            }
        });
    }

    let mut stdout = std::io::stdout();
    let out: &mut dyn std::io::Write = &mut stdout;
    let code = match cli.command {
        Commands::Validate { path } => commands::validate(&session, &path, out)?,
        Commands::Plan {
            path,
            detailed_exitcode,
        } => commands::plan(&session, &path, detailed_exitcode, out).await?,
        Commands::Apply { path } => commands::apply(&session, &path, cancel, out).await?,
        Commands::Destroy => commands::destroy(&session, cancel, out).await?,
        Commands::Graph { path } => commands::graph(&session, &path, out)?,
        Commands::Refresh => commands::refresh_state(&session, out).await?,
        Commands::Show { json } => commands::show(&session, json, out)?,
        Commands::Output { name, path, json } => {
            commands::output(&session, &path, name.as_deref(), json, out)?
        }
        Commands::ForceUnlock => commands::force_unlock(&session, out)?,
    };

    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
