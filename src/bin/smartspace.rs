use anyhow::Result;
use smartspace::cli;

// Main function
#[tokio::main]
async fn main() -> Result<()> {
    let action = cli::start()?;

    action.execute().await?;

    cli::telemetry::shutdown_tracer();

    Ok(())
}
