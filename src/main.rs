use clap::Parser;
use tracing_subscriber::EnvFilter;

use cda_account::cli::{self, Cli};
use cda_account::config::CdaConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = CdaConfig::load_or_default(&cli.config);

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.account.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli::dispatch(cli.command, &config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
