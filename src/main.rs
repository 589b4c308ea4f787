use anyhow::Result;
use clap::{Parser, Subcommand};

use stagehand::commands;
use stagehand::core::config::Config;
use stagehand::utils::logging;

#[derive(Parser)]
#[clap(name = "stagehand")]
#[clap(about = "Keeps an installed application on the latest published build")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Log debug output to stderr
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a newer build is published
    Check,
    /// Download and install the newest build
    Install {
        /// Do not ask for confirmation
        #[clap(short, long)]
        yes: bool,
    },
    /// Stage a newer version of stagehand itself
    SelfUpdate,
    /// Move staged stagehand files into place
    ApplyStaged,
    /// Show the installed build and configured paths
    Status,
    /// Remove leftover extraction folders from the temp directory
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::load()
            .map(|config| config.log_level)
            .unwrap_or_else(|_| logging::DEFAULT_LOG_LEVEL.to_string())
    };
    logging::init(&level);

    let result = match cli.command {
        Commands::Check => commands::check::check_for_updates().map_err(|e| anyhow::anyhow!(e)),
        Commands::Install { yes } => {
            commands::install::install_update(yes).map_err(|e| anyhow::anyhow!(e))
        }
        Commands::SelfUpdate => commands::self_update::update_self().map_err(|e| anyhow::anyhow!(e)),
        Commands::ApplyStaged => {
            commands::apply_staged::apply_staged_update().map_err(|e| anyhow::anyhow!(e))
        }
        Commands::Status => commands::status::show_status().map_err(|e| anyhow::anyhow!(e)),
        Commands::Clean => commands::clean::clean_temp().map_err(|e| anyhow::anyhow!(e)),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    Ok(())
}
