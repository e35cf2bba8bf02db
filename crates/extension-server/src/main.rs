use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod bridge;
mod commands;
mod logging;

use logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "extension-server")]
#[command(about = "Chart-driven extension runtime for telephony modules")]
#[command(version)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a configuration and every chart it references
    Check {
        /// Runtime configuration file
        #[arg(long, short, env = "EXTENSION_CONFIG")]
        config: PathBuf,
    },
    /// Run the runtime, reading events as JSON lines from stdin
    Run {
        /// Runtime configuration file
        #[arg(long, short, env = "EXTENSION_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let result = match cli.command {
        Commands::Check { config } => commands::check(&config),
        Commands::Run { config } => commands::run(&config).await.map(|()| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
