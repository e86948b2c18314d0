use std::process::ExitCode;

use clap::Parser;
use superbox::cli::Command;
use superbox::{logging::setup_logging, CliOpts};
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = CliOpts::parse();
    let default_level = match cli.command {
        Command::Serve(_) => "info",
        _ => "warn",
    };

    if let Err(err) = setup_logging(default_level) {
        eprintln!("Failed to initialize logging: {:?}", err);
        return ExitCode::FAILURE;
    };

    let result = match cli.command {
        Command::Serve(opts) => {
            info!(
                "Public URL: {} / Listening on {}",
                opts.public_url
                    .as_ref()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "from request headers".to_string()),
                &opts.listen
            );
            superbox::start_server(opts).await
        }
        Command::Login(opts) => superbox::client::run_login(opts).await,
        Command::Logout(opts) => superbox::client::run_logout(opts),
        Command::Status(opts) => superbox::client::run_status(opts).await,
        Command::Refresh(opts) => superbox::client::run_refresh(opts).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
