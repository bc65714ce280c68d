//! atecu - automatic transmission controller
//!
//! Gear selection and learned torque-converter lockup over a CAN bus.

use atecu::cli;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    // Initialize logging (RUST_LOG overrides the configured level)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::run(cli).await
}
