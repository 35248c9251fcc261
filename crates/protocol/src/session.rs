//! REST body shapes for the session lifecycle endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only session type this server knows how to launch.
pub const SESSION_TYPE_CHROME: &str = "chrome";

/// Body of `PUT /{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionOptions {
	#[serde(default, rename = "type")]
	pub session_type: Option<String>,
	/// Locale passed to the browser as `--lang`.
	#[serde(default)]
	pub lang: Option<String>,
	#[serde(default)]
	pub auto_open_developer_tools: bool,
}

/// Body of `DELETE /{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSessionOptions {
	#[serde(default)]
	pub delete_session_data: bool,
}

/// Generic `{"value": ...}` payload envelope used by most command bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValueBody {
	#[serde(default)]
	pub value: Option<Value>,
}
