use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use specbatch_sim::config::{Overrides, SimConfig};
use specbatch_sim::logging::{self, LogFormat};
use specbatch_sim::workload;

#[derive(Parser)]
#[command(name = "specbatch-sim", about = "Speculative decoding batch simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic workload and print statistics as JSON
    Run {
        /// Config file (defaults to ~/.config/specbatch/config.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log level used when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,

        /// Pretty-print the JSON report
        #[arg(long)]
        pretty: bool,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the resolved configuration as TOML
    Config {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also write the resolved configuration to this file
        #[arg(long)]
        save: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
}

fn resolve(path: Option<&std::path::Path>, overrides: &Overrides) -> anyhow::Result<SimConfig> {
    let (mut config, used) = SimConfig::load(path)?;
    if let Some(used) = used {
        eprintln!("Loaded config from: {}", used.display());
    }
    config.merge(overrides);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            log_level,
            pretty,
            overrides,
        } => {
            logging::init(log_level.as_deref(), LogFormat::from_env())?;
            let config = resolve(config.as_deref(), &overrides)?;
            info!(
                num_requests = config.workload.num_requests,
                speculative = ?config.speculative.as_ref().map(|s| s.method),
                "starting simulation"
            );
            let report = workload::run(&config).await?;
            let json = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{json}");
        }
        Command::Config {
            config,
            save,
            overrides,
        } => {
            let config = resolve(config.as_deref(), &overrides)?;
            if let Some(path) = save {
                config.save_to(&path)?;
                eprintln!("Saved config to: {}", path.display());
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
