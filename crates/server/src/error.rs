//! Error taxonomy for the command gateway.
//!
//! Every variant maps to the HTTP status surfaced to the caller; remote
//! agent failures pass their status through verbatim. Asynchronous failure
//! paths never throw across the registry/channel boundary - they resolve
//! the waiting caller with one of these.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
	#[error("invalid session id: {0}")]
	InvalidSessionId(String),

	#[error("invalid view id: {0}")]
	InvalidViewId(String),

	#[error("invalid request body: {0}")]
	InvalidBody(String),

	#[error("no action provided in path {0}")]
	MissingCommand(String),

	#[error("unsupported browser type: {0}")]
	UnsupportedSessionType(String),

	#[error("browser {0} already running")]
	SessionExists(String),

	#[error("browser not found: {0}")]
	SessionNotFound(String),

	#[error("browser disconnected: {0}")]
	SessionDisconnected(String),

	/// Session torn down while the request was in flight.
	#[error("session closed: {0}")]
	SessionClosed(String),

	/// The remote agent reported a failure.
	#[error("{message}")]
	Remote { code: u16, message: String },

	#[error("browser launch failed: {0}")]
	Launch(#[source] std::io::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

impl ServerError {
	pub fn status(&self) -> StatusCode {
		match self {
			Self::InvalidSessionId(_)
			| Self::InvalidViewId(_)
			| Self::InvalidBody(_)
			| Self::MissingCommand(_) => StatusCode::BAD_REQUEST,
			Self::UnsupportedSessionType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
			Self::SessionExists(_) => StatusCode::CONFLICT,
			Self::SessionNotFound(_) | Self::SessionDisconnected(_) | Self::SessionClosed(_) => {
				StatusCode::NOT_FOUND
			}
			Self::Remote { code, .. } => {
				StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
			}
			Self::Launch(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for ServerError {
	fn into_response(self) -> Response {
		(self.status(), Json(self.to_string())).into_response()
	}
}
