mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging is best effort: a read-only home must not block `validate`.
    let _log_guard = match cli.global.logs_dir() {
        Ok(logs_dir) => boxforge::init_logging(&logs_dir, cli.global.log_level())
            .map_err(|e| eprintln!("Warning: file logging disabled: {}", e))
            .ok(),
        Err(_) => None,
    };

    let result = match cli.command {
        Commands::Build(args) => commands::build::execute(args, &cli.global).await,
        Commands::Validate(args) => commands::validate::execute(args, &cli.global).await,
        Commands::Pull(args) => commands::pull::execute(args, &cli.global).await,
        Commands::Inspect(args) => commands::inspect::execute(args, &cli.global).await,
        Commands::Unpack(args) => commands::unpack::execute(args, &cli.global).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
            ExitCode::FAILURE
        }
    }
}
