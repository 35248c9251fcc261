use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

mod cli;
mod logging;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let config = cli.server_config()?;
	let addr = format!("{}:{}", cli.host, cli.port);
	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.with_context(|| format!("failed to bind {addr}"))?;

	info!(
		target = "browserd",
		addr = %addr,
		browser = %config.browser_path.display(),
		"browserd listening"
	);

	browserd_server::serve(config, listener)
		.await
		.context("server error")
}
