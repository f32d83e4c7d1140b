use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use zkg::cli::{run, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("ZKG_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
