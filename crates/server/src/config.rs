//! Server configuration.
//!
//! Retry and cleanup timings are policy knobs, not engine constants; the
//! defaults here match the production values.

use std::path::PathBuf;
use std::time::Duration;

/// Delay before re-emitting a command after a transient not-found reply.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Attempts when deleting a profile directory the browser may still hold.
pub const DEFAULT_PROFILE_DELETE_ATTEMPTS: u32 = 20;
/// Pause between profile-deletion attempts.
pub const DEFAULT_PROFILE_DELETE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// Browser executable launched for each session.
	pub browser_path: PathBuf,
	/// Root directory holding one profile directory per session id.
	pub profile_root: PathBuf,
	/// Agent extension directory loaded into every session, when present.
	pub agent_extension: Option<PathBuf>,
	pub retry_delay: Duration,
	pub profile_delete_attempts: u32,
	pub profile_delete_backoff: Duration,
}

impl ServerConfig {
	pub fn new(browser_path: impl Into<PathBuf>) -> Self {
		Self {
			browser_path: browser_path.into(),
			profile_root: std::env::temp_dir().join("browserd"),
			agent_extension: None,
			retry_delay: DEFAULT_RETRY_DELAY,
			profile_delete_attempts: DEFAULT_PROFILE_DELETE_ATTEMPTS,
			profile_delete_backoff: DEFAULT_PROFILE_DELETE_BACKOFF,
		}
	}
}
