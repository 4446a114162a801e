use anyhow::Result;
use clap::Parser;

mod args;
mod health;
mod server;

use args::{Cli, Commands};
use health::run_health;
use server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    ironhold_common::init();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            ironhold_common::metrics::maybe_spawn_metrics_server();
            run_server(args).await
        }
        Commands::Health(args) => run_health(args).await,
    }
}
