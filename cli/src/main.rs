use anyhow::Result;
use relaydrop_cli::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli().await
}
