mod cli;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    info!(build = transfer_coordinator::BUILD_ID, "transfer-cli starting");

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Send(args) => cli::run_send(args).await.map(|report| {
            let location = report
                .location
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "(memory)".to_string());
            println!("{} -> {} ({} bytes)", report.file_name, location, report.bytes);
        }),
        Commands::Signal { json } => cli::run_signal(&json),
    };

    if let Err(err) = result {
        error!("transfer-cli failed: {err:#}");
        std::process::exit(1);
    }
}
