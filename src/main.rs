use agrichart_sandbox::cli::CliArgs;
use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = CliArgs::parse();

    let default_filter = if args.verbose {
        "agrichart_sandbox=debug"
    } else {
        "agrichart_sandbox=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    agrichart_sandbox::run(args).await
}
