use clap::Parser;
use ksniff::cli::{commands, Cli};
use std::process;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        process::exit(1);
    }

    debug!("kubectl-sniff v{}", ksniff::VERSION);

    if let Err(e) = commands::handle_command(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
