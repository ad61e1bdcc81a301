use std::io;

use eyre::Result;

use hvctl::cli;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    init()?;
    cli::run().await
}

fn init() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter("hvctl=info")
        .with_writer(io::stderr)
        .init();

    Ok(())
}
