use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::commands;

#[derive(Parser)]
#[command(
    name = "lpt",
    version,
    about = "Low-precision graph transformations",
    long_about = "Decompose FakeQuantize nodes and propagate dequantization through Concat, StridedSlice and MaxPool"
)]
struct Cli {
    /// Log every rewrite (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transform a built-in scenario and check it against the original graph.
    Run {
        #[arg(value_name = "SCENARIO")]
        scenario: String,

        /// YAML or TOML engine configuration; the scenario's own catalog otherwise.
        #[arg(short, long)]
        config: Option<String>,

        /// Input shape, `?` for a dynamic dimension.
        #[arg(short, long, default_value = "1,4,9,9")]
        shape: String,

        /// Pass limit; the config's `max_passes` otherwise.
        #[arg(long)]
        passes: Option<usize>,

        /// Random input batches for the numeric comparison.
        #[arg(long, default_value = "4")]
        samples: usize,

        /// Print every node of the transformed graph.
        #[arg(long)]
        dump: bool,
    },

    /// List the built-in scenarios.
    Scenarios,

    /// Parse and validate a configuration file.
    CheckConfig {
        #[arg(value_name = "CONFIG")]
        config_file: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "lpt_rs=debug" } else { "lpt_rs=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    println!("{}", format!("lpt v{}", lpt_rs::VERSION).bold().cyan());
    println!();

    match cli.command {
        Commands::Run {
            scenario,
            config,
            shape,
            passes,
            samples,
            dump,
        } => {
            commands::run(&scenario, config.as_deref(), &shape, passes, samples, dump)?;
        }
        Commands::Scenarios => {
            commands::scenarios();
        }
        Commands::CheckConfig { config_file } => {
            commands::check_config(&config_file)?;
        }
    }

    Ok(())
}
