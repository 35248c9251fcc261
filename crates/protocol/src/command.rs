//! Command records as they travel over the session channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id for one caller-visible operation.
///
/// Generated at ingress from a monotonic counter and never reused; retries
/// re-emit the same id, so an id denotes exactly one logical operation no
/// matter how many times its command crosses the wire.
pub type RequestId = u64;

/// Command names the gateway derives from the REST surface.
///
/// Document-scoped actions are open-ended (the query token is forwarded to
/// the agent verbatim), so [`Command::name`] is a plain string; the closed
/// set the gateway itself produces or inspects lives here.
pub mod cmd {
	pub const START: &str = "start";
	pub const KILL: &str = "kill";
	pub const SLEEP: &str = "sleep";
	pub const GET_URL: &str = "get_url";
	pub const SET_URL: &str = "set_url";
	pub const GET_VIEWS_INFO: &str = "get_views_info";
	pub const SET_VIEWS_INFO: &str = "set_views_info";
	pub const SET_ACTIVE_VIEW: &str = "set_active_view";
	pub const CLOSE_VIEW: &str = "close_view";
	pub const CLOSE_ACTIVE_VIEW: &str = "close_active_view";
	pub const GET_ERRORS: &str = "get_errors";
	pub const CLEAR_ERRORS: &str = "clear_errors";
	pub const GET_COOKIE: &str = "get_cookie";
	pub const SET_COOKIE: &str = "set_cookie";
	pub const REMOVE_COOKIE: &str = "remove_cookie";
	pub const CHECK_EXISTS: &str = "check_exists";
	pub const CHECK_VISIBLE: &str = "check_visible";
}

/// Probe commands answer `false` instead of erroring when their target
/// element never shows up within the request deadline.
pub fn is_probe(name: &str) -> bool {
	name == cmd::CHECK_EXISTS || name == cmd::CHECK_VISIBLE
}

/// A command as emitted to the remote agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
	pub request_id: RequestId,
	pub name: String,
	/// Target path within the session's document model, URI-decoded.
	/// Forwarded untouched; its inner syntax belongs to the agent.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub path: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
	/// Query tokens after the action, forwarded verbatim.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub params: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tab_id: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cookie_name: Option<String>,
	/// Per-request retry window in seconds; 0 disables retries.
	#[serde(default, skip_serializing_if = "is_zero")]
	pub timeout_in_sec: f64,
}

fn is_zero(value: &f64) -> bool {
	*value == 0.0
}

impl Command {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Self::default()
		}
	}
}
