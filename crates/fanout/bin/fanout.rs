use std::process::ExitCode;

use fanout::{config::Config, supervisor};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config, config_path) = match Config::from_cli() {
        Ok(parsed) => parsed,
        Err(err) => {
            error!(%err, "bad configuration");
            return ExitCode::from(2);
        }
    };

    match supervisor::run(config, config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "relay failed");
            ExitCode::FAILURE
        }
    }
}
