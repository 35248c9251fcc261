//! Channel envelope types exchanged between server and remote agent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{Command, RequestId};

/// Messages sent by the remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
	/// The in-browser agent finished booting and can accept commands.
	/// Triggers the creation handshake on the server side.
	Ready,
	Reply(CommandReply),
}

/// Messages sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
	Command(Command),
}

/// Reply to a single command, correlated by request id.
///
/// Success carries an optional `value` (void commands omit it); failure
/// carries `error_code` and `error_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandReply {
	#[serde(rename = "requestId")]
	pub request_id: RequestId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_code: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

impl CommandReply {
	pub fn value(request_id: RequestId, value: Value) -> Self {
		Self {
			request_id,
			value: Some(value),
			..Self::default()
		}
	}

	pub fn error(request_id: RequestId, code: u16, message: impl Into<String>) -> Self {
		Self {
			request_id,
			error_code: Some(code),
			error_message: Some(message.into()),
			..Self::default()
		}
	}

	/// Not-found-class errors are the only retryable kind.
	pub fn is_not_found(&self) -> bool {
		self.error_code == Some(404)
	}
}
