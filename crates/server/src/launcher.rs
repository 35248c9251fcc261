//! Browser process lifecycle: spawn, terminate, profile cleanup.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use browserd_protocol::CreateSessionOptions;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};

/// Launch arguments common to every session.
const BASE_ARGS: &[&str] = &[
	"--no-default-browser-check",
	"--no-first-run",
	"--test-type",
	"--ignore-certificate-errors",
	"--disable-popup-blocking",
];

/// A spawned browser tied to one session.
///
/// The child is configured to be killed when the handle drops, so a purged
/// registry entry can never leak an OS process. Deliberate teardown goes
/// through [`BrowserLauncher::terminate`] instead, which also reaps.
#[derive(Debug)]
pub struct BrowserProcess {
	child: Child,
	pid: u32,
}

impl BrowserProcess {
	pub fn pid(&self) -> u32 {
		self.pid
	}
}

/// Spawns and reaps per-session browser processes.
pub struct BrowserLauncher {
	config: Arc<ServerConfig>,
}

impl BrowserLauncher {
	pub fn new(config: Arc<ServerConfig>) -> Self {
		Self { config }
	}

	/// Profile directory backing one session id.
	pub fn profile_dir(&self, session_id: &str) -> PathBuf {
		self.config.profile_root.join(session_id)
	}

	/// Spawn a browser with an isolated profile for the session.
	pub fn spawn(&self, session_id: &str, options: &CreateSessionOptions) -> Result<BrowserProcess> {
		let args = self.launch_args(session_id, options);
		debug!(
			session = session_id,
			browser = %self.config.browser_path.display(),
			"spawning browser"
		);
		let mut child = Command::new(&self.config.browser_path)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(ServerError::Launch)?;
		let pid = child.id().ok_or_else(|| {
			ServerError::Internal("spawned browser exited before its pid could be read".into())
		})?;
		Ok(BrowserProcess { child, pid })
	}

	fn launch_args(&self, session_id: &str, options: &CreateSessionOptions) -> Vec<String> {
		let mut args: Vec<String> = BASE_ARGS.iter().map(|arg| arg.to_string()).collect();
		args.push(format!(
			"--user-data-dir={}",
			self.profile_dir(session_id).display()
		));
		if let Some(extension) = &self.config.agent_extension {
			args.push("--extensions-on-chrome-urls".to_string());
			args.push(format!("--load-extension={}", extension.display()));
		}
		if options.auto_open_developer_tools {
			args.push("--auto-open-devtools-for-tabs".to_string());
		}
		if let Some(lang) = &options.lang {
			args.push(format!("--lang={lang}"));
		}
		args.push("about:blank".to_string());
		args
	}

	/// Signal the process and wait until the OS reports it exited.
	/// Graceful shutdown may lag the signal; the session must not be
	/// reported gone while the process still holds its profile.
	pub async fn terminate(&self, mut process: BrowserProcess) {
		if let Err(err) = process.child.start_kill() {
			// InvalidInput means the child already exited and was reaped
			if err.kind() != io::ErrorKind::InvalidInput {
				warn!(pid = process.pid, error = %err, "failed to signal browser process");
			}
		}
		match process.child.wait().await {
			Ok(status) => debug!(pid = process.pid, %status, "browser process exited"),
			Err(err) => warn!(pid = process.pid, error = %err, "failed waiting for browser exit"),
		}
	}
}

/// Recursive profile deletion with bounded retries.
///
/// The browser can hold profile files briefly after its process exits, so
/// failures back off and try again. A missing directory counts as success.
/// Exhaustion is reported as an error for the caller to surface; it never
/// panics and never takes the server down.
pub async fn delete_profile_dir(path: &Path, attempts: u32, backoff: Duration) -> io::Result<()> {
	let mut remaining = attempts.max(1);
	loop {
		match tokio::fs::remove_dir_all(path).await {
			Ok(()) => return Ok(()),
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
			Err(err) => {
				remaining -= 1;
				if remaining == 0 {
					return Err(err);
				}
				debug!(path = %path.display(), error = %err, "profile deletion failed, retrying");
				tokio::time::sleep(backoff).await;
			}
		}
	}
}
