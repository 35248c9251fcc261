use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use browserd_server::ServerConfig;
use clap::Parser;

/// Candidate browser executables probed on PATH, most specific first.
const BROWSER_CANDIDATES: &[&str] = &[
	"google-chrome-stable",
	"google-chrome",
	"chromium",
	"chromium-browser",
];

#[cfg(target_os = "macos")]
const MACOS_BROWSER_PATH: &str = "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome";

#[derive(Parser, Debug)]
#[command(name = "browserd")]
#[command(about = "Remote browser automation server")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Interface to bind
	#[arg(long, default_value = "127.0.0.1")]
	pub host: String,

	/// Port for the REST and channel endpoints
	#[arg(short, long, default_value_t = 8081)]
	pub port: u16,

	/// Browser executable (discovered on PATH when omitted)
	#[arg(long, value_name = "PATH")]
	pub browser_path: Option<PathBuf>,

	/// Root directory for per-session browser profiles
	#[arg(long, value_name = "DIR")]
	pub profile_root: Option<PathBuf>,

	/// Agent extension directory loaded into every session
	#[arg(long, value_name = "DIR")]
	pub agent_extension: Option<PathBuf>,

	/// Delay before re-emitting a command after a transient not-found,
	/// in milliseconds
	#[arg(long, value_name = "MS")]
	pub retry_delay_ms: Option<u64>,
}

impl Cli {
	pub fn server_config(&self) -> Result<ServerConfig> {
		let browser_path = match &self.browser_path {
			Some(path) => path.clone(),
			None => discover_browser()
				.ok_or_else(|| anyhow!("no browser executable found; pass --browser-path"))?,
		};

		let mut config = ServerConfig::new(browser_path);
		if let Some(root) = &self.profile_root {
			config.profile_root = root.clone();
		}
		config.agent_extension = self.agent_extension.clone();
		if let Some(ms) = self.retry_delay_ms {
			config.retry_delay = Duration::from_millis(ms);
		}
		Ok(config)
	}
}

fn discover_browser() -> Option<PathBuf> {
	#[cfg(target_os = "macos")]
	{
		let path = PathBuf::from(MACOS_BROWSER_PATH);
		if path.exists() {
			return Some(path);
		}
	}

	BROWSER_CANDIDATES
		.iter()
		.find_map(|name| which::which(name).ok())
}
