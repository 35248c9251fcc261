//! Command gateway: the REST surface.
//!
//! Parses inbound requests into command records, enforces the session
//! preconditions, forwards commands over the session channel, and answers
//! the caller when the correlated reply arrives. Every path out of a
//! handler resolves its request exactly once, through the registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use browserd_protocol::{
	Command, CreateSessionOptions, DeleteSessionOptions, SESSION_TYPE_CHROME, ServerMessage,
	ValueBody, cmd,
};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::ServerContext;
use crate::channel;
use crate::error::{Result, ServerError};
use crate::launcher;
use crate::registry::{CommandOutcome, PendingRequest};

pub fn router(ctx: ServerContext) -> Router {
	Router::new()
		.route("/", get(list_sessions).delete(destroy_all))
		.route("/channel", get(channel::channel_handler))
		.route(
			"/{id}",
			put(create_session)
				.delete(destroy_session)
				.post(plain_command),
		)
		.route(
			"/{id}/",
			put(create_session)
				.delete(destroy_session)
				.post(plain_command),
		)
		.route("/{id}/url", get(url_command).put(url_command))
		.route(
			"/{id}/views",
			get(views_command).put(views_command).delete(views_command),
		)
		.route(
			"/{id}/views/{tab}",
			get(view_tab_command)
				.put(view_tab_command)
				.delete(view_tab_command),
		)
		.route("/{id}/errors", get(errors_command).delete(errors_command))
		.route(
			"/{id}/cookies",
			get(cookies_command)
				.put(cookies_command)
				.delete(cookies_command),
		)
		.route(
			"/{id}/cookies/{name}",
			get(named_cookie_command)
				.put(named_cookie_command)
				.delete(named_cookie_command),
		)
		.route(
			"/{id}/doc",
			get(doc_root_command)
				.put(doc_root_command)
				.post(doc_root_command),
		)
		.route(
			"/{id}/doc/{*path}",
			get(doc_command).put(doc_command).post(doc_command),
		)
		.layer(middleware::from_fn(common_headers))
		.with_state(ctx)
}

/// Cross-origin and no-cache headers on every response, the OPTIONS
/// preflight short-circuit, and the optional test-harness throttle.
async fn common_headers(request: Request, next: Next) -> Response {
	if request.method() == Method::OPTIONS {
		return with_common_headers(StatusCode::OK.into_response());
	}

	if let Some(delay) = header_millis(request.headers(), "x-throttle-requests-in-ms") {
		tokio::time::sleep(delay).await;
	}

	with_common_headers(next.run(request).await)
}

fn with_common_headers(mut response: Response) -> Response {
	let headers = response.headers_mut();
	headers.insert(
		header::ACCESS_CONTROL_ALLOW_ORIGIN,
		HeaderValue::from_static("*"),
	);
	headers.insert(
		header::ACCESS_CONTROL_ALLOW_HEADERS,
		HeaderValue::from_static(
			"Origin, X-Requested-With, Content-Type, Accept, x-timeout-in-sec, x-throttle-requests-in-ms",
		),
	);
	headers.insert(
		header::ACCESS_CONTROL_ALLOW_METHODS,
		HeaderValue::from_static("GET,PUT,POST,DELETE"),
	);
	headers.insert(
		header::CACHE_CONTROL,
		HeaderValue::from_static("private, no-cache, no-store, must-revalidate"),
	);
	headers.insert(header::EXPIRES, HeaderValue::from_static("-1"));
	headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
	response
}

async fn list_sessions(State(ctx): State<ServerContext>) -> Response {
	let sessions = ctx.registry.session_ids();
	info!(count = sessions.len(), "list sessions");
	Json(sessions).into_response()
}

/// Destroy every session, then delete the whole profile root. Succeeds
/// with 204 even when no session is active.
async fn destroy_all(State(ctx): State<ServerContext>) -> Response {
	for session_id in ctx.registry.session_ids() {
		info!(session = short_id(&session_id), cmd = cmd::KILL, "command");
		let process = ctx.registry.take_process(&session_id);
		channel::purge_and_resolve(&ctx.registry, &session_id);
		if let Some(process) = process {
			ctx.launcher.terminate(process).await;
		}
	}

	match launcher::delete_profile_dir(
		&ctx.config.profile_root,
		ctx.config.profile_delete_attempts,
		ctx.config.profile_delete_backoff,
	)
	.await
	{
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(err) => {
			warn!(error = %err, "failed to delete profile root");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}

async fn create_session(
	Path(id): Path<String>,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	let result = async {
		let options: CreateSessionOptions = parse_body(&body)?;
		create_session_inner(&ctx, &id, options).await
	}
	.await;
	respond(result)
}

async fn create_session_inner(
	ctx: &ServerContext,
	id: &str,
	options: CreateSessionOptions,
) -> Result<CommandOutcome> {
	validate_session_id(id)?;

	let session_type = options
		.session_type
		.clone()
		.unwrap_or_else(|| SESSION_TYPE_CHROME.to_string());
	if session_type != SESSION_TYPE_CHROME {
		return Err(ServerError::UnsupportedSessionType(session_type));
	}

	info!(session = short_id(id), cmd = cmd::START, "command");

	let request_id = ctx.registry.next_request_id();
	let (tx, rx) = oneshot::channel();
	let command = Command {
		request_id,
		..Command::new(cmd::START)
	};
	let pending = PendingRequest::new(id.to_string(), command, Instant::now(), tx);

	ctx.registry.begin_session(request_id, pending)?;

	// attach the process before the agent can possibly signal ready; the
	// creation request itself resolves in the channel handshake
	match ctx.launcher.spawn(id, &options) {
		Ok(process) => ctx.registry.set_process(id, process),
		Err(err) => {
			let _ = ctx.registry.take_pending(request_id);
			return Err(err);
		}
	}

	rx.await
		.map_err(|_| ServerError::Internal("request resolver dropped".into()))
}

async fn destroy_session(
	Path(id): Path<String>,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	let result = async {
		let options: DeleteSessionOptions = parse_body(&body)?;
		destroy_session_inner(&ctx, &id, options).await
	}
	.await;
	respond(result)
}

async fn destroy_session_inner(
	ctx: &ServerContext,
	id: &str,
	options: DeleteSessionOptions,
) -> Result<CommandOutcome> {
	validate_session_id(id)?;

	if !ctx.registry.has_channel(id) && !ctx.registry.has_process(id) {
		return Err(ServerError::SessionNotFound(id.to_string()));
	}

	info!(session = short_id(id), cmd = cmd::KILL, "command");

	// register the kill acknowledgement, then immediately pull it back out
	// so the purge below cannot cancel this very request
	let request_id = ctx.registry.next_request_id();
	let (tx, rx) = oneshot::channel();
	let command = Command {
		request_id,
		..Command::new(cmd::KILL)
	};
	ctx.registry.register_pending(
		request_id,
		PendingRequest::new(id.to_string(), command, Instant::now(), tx),
	);
	let Some(acknowledgement) = ctx.registry.take_pending(request_id) else {
		return Err(ServerError::Internal("kill acknowledgement vanished".into()));
	};

	let process = ctx.registry.take_process(id);
	channel::purge_and_resolve(&ctx.registry, id);

	let launcher = Arc::clone(&ctx.launcher);
	let config = Arc::clone(&ctx.config);
	let profile_dir = ctx.launcher.profile_dir(id);
	tokio::spawn(async move {
		if let Some(process) = process {
			launcher.terminate(process).await;
		}
		let outcome = if options.delete_session_data {
			match launcher::delete_profile_dir(
				&profile_dir,
				config.profile_delete_attempts,
				config.profile_delete_backoff,
			)
			.await
			{
				Ok(()) => CommandOutcome::Status(StatusCode::NO_CONTENT),
				Err(err) => {
					warn!(path = %profile_dir.display(), error = %err, "failed to delete profile");
					CommandOutcome::Status(StatusCode::INTERNAL_SERVER_ERROR)
				}
			}
		} else {
			CommandOutcome::Status(StatusCode::OK)
		};
		acknowledgement.resolve(outcome);
	});

	rx.await
		.map_err(|_| ServerError::Internal("request resolver dropped".into()))
}

/// `POST /{id}?{command}`: sleep, pause, and any other session-scoped
/// command expressed as a query token.
async fn plain_command(
	Path(id): Path<String>,
	RawQuery(query): RawQuery,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	let result = async {
		let (name, params) = parse_query_command(query.as_deref())
			.ok_or_else(|| ServerError::MissingCommand(format!("/{id}")))?;
		let command = Command {
			value: parse_value_body(&body)?,
			params,
			..Command::new(name)
		};
		forward_command(&ctx, &id, command, request_timeout(&headers)).await
	}
	.await;
	respond(result)
}

async fn url_command(
	Path(id): Path<String>,
	method: Method,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	let result = async {
		let name = if method == Method::GET {
			cmd::GET_URL
		} else {
			cmd::SET_URL
		};
		let command = Command {
			value: parse_value_body(&body)?,
			..Command::new(name)
		};
		forward_command(&ctx, &id, command, request_timeout(&headers)).await
	}
	.await;
	respond(result)
}

async fn views_command(
	Path(id): Path<String>,
	method: Method,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	let result = async {
		let (name, value) = if method == Method::GET {
			(cmd::GET_VIEWS_INFO, None)
		} else if method == Method::PUT {
			// bulk geometry update: the whole body is the payload
			(cmd::SET_VIEWS_INFO, parse_raw_body(&body)?)
		} else {
			(cmd::CLOSE_ACTIVE_VIEW, None)
		};
		let command = Command {
			value,
			..Command::new(name)
		};
		forward_command(&ctx, &id, command, request_timeout(&headers)).await
	}
	.await;
	respond(result)
}

async fn view_tab_command(
	Path((id, tab)): Path<(String, String)>,
	method: Method,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
) -> Response {
	let result = async {
		let tab_id = parse_tab_id(&tab)?;
		let name = if method == Method::GET {
			cmd::GET_VIEWS_INFO
		} else if method == Method::PUT {
			cmd::SET_ACTIVE_VIEW
		} else {
			cmd::CLOSE_VIEW
		};
		let command = Command {
			tab_id: Some(tab_id),
			..Command::new(name)
		};
		forward_command(&ctx, &id, command, request_timeout(&headers)).await
	}
	.await;
	respond(result)
}

async fn errors_command(
	Path(id): Path<String>,
	method: Method,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
) -> Response {
	let name = if method == Method::GET {
		cmd::GET_ERRORS
	} else {
		cmd::CLEAR_ERRORS
	};
	respond(forward_command(&ctx, &id, Command::new(name), request_timeout(&headers)).await)
}

async fn cookies_command(
	Path(id): Path<String>,
	method: Method,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	let result = cookie_command_inner(&ctx, &id, None, &method, &headers, &body).await;
	respond(result)
}

async fn named_cookie_command(
	Path((id, name)): Path<(String, String)>,
	method: Method,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	let result = cookie_command_inner(&ctx, &id, Some(name), &method, &headers, &body).await;
	respond(result)
}

async fn cookie_command_inner(
	ctx: &ServerContext,
	id: &str,
	cookie_name: Option<String>,
	method: &Method,
	headers: &HeaderMap,
	body: &Bytes,
) -> Result<CommandOutcome> {
	let name = if *method == Method::GET {
		cmd::GET_COOKIE
	} else if *method == Method::PUT {
		cmd::SET_COOKIE
	} else {
		cmd::REMOVE_COOKIE
	};
	let command = Command {
		cookie_name,
		value: parse_value_body(body)?,
		..Command::new(name)
	};
	forward_command(ctx, id, command, request_timeout(headers)).await
}

async fn doc_root_command(
	Path(id): Path<String>,
	RawQuery(query): RawQuery,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	respond(doc_command_inner(&ctx, &id, String::new(), query, &headers, &body).await)
}

async fn doc_command(
	Path((id, path)): Path<(String, String)>,
	RawQuery(query): RawQuery,
	headers: HeaderMap,
	State(ctx): State<ServerContext>,
	body: Bytes,
) -> Response {
	let doc_path = format!("/{path}");
	respond(doc_command_inner(&ctx, &id, doc_path, query, &headers, &body).await)
}

/// Document-scoped command: the first query token names the action, the
/// rest are forwarded params, and the path is handed to the agent
/// untouched beyond URI decoding.
async fn doc_command_inner(
	ctx: &ServerContext,
	id: &str,
	doc_path: String,
	query: Option<String>,
	headers: &HeaderMap,
	body: &Bytes,
) -> Result<CommandOutcome> {
	let (name, params) = parse_query_command(query.as_deref())
		.ok_or_else(|| ServerError::MissingCommand(doc_path.clone()))?;
	let command = Command {
		path: doc_path,
		params,
		value: parse_value_body(body)?,
		..Command::new(name)
	};
	forward_command(ctx, id, command, request_timeout(headers)).await
}

/// Register, precondition-check, emit, and await the reply for one
/// command.
async fn forward_command(
	ctx: &ServerContext,
	session_id: &str,
	mut command: Command,
	timeout: Duration,
) -> Result<CommandOutcome> {
	validate_session_id(session_id)?;

	let request_id = ctx.registry.next_request_id();
	command.request_id = request_id;
	command.timeout_in_sec = timeout.as_secs_f64();

	info!(
		session = short_id(session_id),
		cmd = %command.name,
		path = %command.path,
		"command"
	);

	let (tx, rx) = oneshot::channel();
	let pending = PendingRequest::new(
		session_id.to_string(),
		command.clone(),
		Instant::now() + timeout,
		tx,
	);
	ctx.registry.register_pending(request_id, pending);

	// everything except creation requires a live bound channel
	let Some(channel) = ctx.registry.channel(session_id) else {
		let _ = ctx.registry.take_pending(request_id);
		return Err(ServerError::SessionNotFound(session_id.to_string()));
	};

	if command.name == cmd::SLEEP {
		// resolved locally after the requested delay; the agent never
		// sees this command
		let delay = command
			.value
			.as_ref()
			.and_then(Value::as_f64)
			.filter(|secs| secs.is_finite() && *secs >= 0.0)
			.map(Duration::from_secs_f64)
			.unwrap_or(Duration::ZERO);
		let registry = Arc::clone(&ctx.registry);
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if let Some(pending) = registry.take_pending(request_id) {
				pending.resolve(CommandOutcome::Status(StatusCode::OK));
			}
		});
	} else if channel.send(ServerMessage::Command(command)).is_err() {
		let _ = ctx.registry.take_pending(request_id);
		return Err(ServerError::SessionDisconnected(session_id.to_string()));
	}

	rx.await
		.map_err(|_| ServerError::Internal("request resolver dropped".into()))
}

fn respond(result: Result<CommandOutcome>) -> Response {
	match result {
		Ok(CommandOutcome::Value(value)) => Json(value).into_response(),
		Ok(CommandOutcome::Status(status)) => status.into_response(),
		Ok(CommandOutcome::Error { status, message }) => {
			(status, Json(message)).into_response()
		}
		Err(err) => err.into_response(),
	}
}

/// Splits a raw query string into the command token and its trailing
/// params: the first `&`-separated token names the command, the rest are
/// forwarded untouched beyond URI decoding.
fn parse_query_command(query: Option<&str>) -> Option<(String, Vec<String>)> {
	let query = query?.trim();
	if query.is_empty() {
		return None;
	}
	let mut tokens = query.split('&').map(decode_token);
	let name = tokens.next()?;
	if name.is_empty() {
		return None;
	}
	Some((name, tokens.filter(|token| !token.is_empty()).collect()))
}

fn decode_token(token: &str) -> String {
	percent_decode_str(token).decode_utf8_lossy().into_owned()
}

/// Per-request retry window from `x-timeout-in-sec`. Absent or invalid
/// means zero, which disables the retry loop entirely.
fn request_timeout(headers: &HeaderMap) -> Duration {
	headers
		.get("x-timeout-in-sec")
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.parse::<f64>().ok())
		.filter(|secs| secs.is_finite() && *secs > 0.0)
		.map(Duration::from_secs_f64)
		.unwrap_or(Duration::ZERO)
}

fn header_millis(headers: &HeaderMap, name: &str) -> Option<Duration> {
	headers
		.get(name)?
		.to_str()
		.ok()?
		.parse::<u64>()
		.ok()
		.map(Duration::from_millis)
}

/// Session ids become profile directory names; restricting the alphabet
/// keeps them safe as path components.
fn validate_session_id(id: &str) -> Result<()> {
	let valid = !id.is_empty()
		&& id.len() <= 128
		&& id
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
	if valid {
		Ok(())
	} else {
		Err(ServerError::InvalidSessionId(id.to_string()))
	}
}

fn parse_tab_id(tab: &str) -> Result<i64> {
	tab.parse::<i64>()
		.map_err(|_| ServerError::InvalidViewId(tab.to_string()))
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
	if body.is_empty() {
		return Ok(T::default());
	}
	serde_json::from_slice(body).map_err(|err| ServerError::InvalidBody(err.to_string()))
}

/// `{"value": ...}` envelope used by most command bodies.
fn parse_value_body(body: &Bytes) -> Result<Option<Value>> {
	Ok(parse_body::<ValueBody>(body)?.value)
}

/// Whole-body payload, for commands whose body has no envelope.
fn parse_raw_body(body: &Bytes) -> Result<Option<Value>> {
	if body.is_empty() {
		return Ok(None);
	}
	serde_json::from_slice(body)
		.map(Some)
		.map_err(|err| ServerError::InvalidBody(err.to_string()))
}

/// First five characters of a session id, for log lines.
fn short_id(id: &str) -> &str {
	id.get(..5).unwrap_or(id)
}
