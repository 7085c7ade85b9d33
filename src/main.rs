use anyhow::Result;

/// Main entry point
#[tokio::main]
async fn main() -> Result<()> {
    hostlink::cli::run().await
}
