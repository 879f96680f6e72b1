mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "smf",
    about = "Software upgrade campaign orchestrator",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the orchestrator config file
    #[arg(long, short, global = true, env = "SMF_CONFIG", default_value = "smf.yaml")]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, short, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a campaign, creating it from its description file if needed
    Run {
        /// Campaign DN, e.g. safSmfCampaign=upgrade-1
        campaign: String,
        /// Campaign description file (required the first time)
        #[arg(long, short)]
        file: Option<PathBuf>,
        /// Seconds to wait for the campaign to settle
        #[arg(long, default_value_t = 3600)]
        wait: u64,
    },

    /// Roll back an executed, suspended or faulted campaign
    Rollback {
        campaign: String,
        #[arg(long, default_value_t = 3600)]
        wait: u64,
    },

    /// Commit a completed execution or rollback
    Commit { campaign: String },

    /// Show campaign state (all campaigns when no DN is given)
    Status { campaign: Option<String> },

    /// Inspect the orchestrator config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.command {
        Commands::Run { .. } | Commands::Rollback { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            campaign,
            file,
            wait,
        } => cmd::run::run(&cli.config, &campaign, file.as_deref(), wait, cli.json),
        Commands::Rollback { campaign, wait } => {
            cmd::rollback::run(&cli.config, &campaign, wait, cli.json)
        }
        Commands::Commit { campaign } => cmd::commit::run(&cli.config, &campaign, cli.json),
        Commands::Status { campaign } => {
            cmd::status::run(&cli.config, campaign.as_deref(), cli.json)
        }
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
