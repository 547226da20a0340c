use anyhow::Result;
use berkshelf_api::cli::{init_tracing, run, Cli};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_level());
    tracing::info!("berkshelf-api startup: tracing initialised, environment loaded");

    let result = run(cli).await;
    match &result {
        Ok(_) => tracing::info!("berkshelf-api exited cleanly"),
        Err(e) => tracing::error!(error = %e, "berkshelf-api exited with error"),
    }
    result
}
