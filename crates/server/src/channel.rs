//! Duplex channel server.
//!
//! Accepts long-lived WebSocket connections from in-browser agents, binds
//! each one to the session whose creation is waiting for it, and routes
//! asynchronous replies back to the correlated caller. Per connection the
//! state machine is connected-unbound, then ready(session), then closed.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use browserd_protocol::{AgentMessage, Command, CommandReply, ServerMessage, is_probe};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::ServerContext;
use crate::error::ServerError;
use crate::registry::{ChannelHandle, CommandOutcome, SessionRegistry};

pub async fn channel_handler(ws: WebSocketUpgrade, State(ctx): State<ServerContext>) -> Response {
	ws.on_upgrade(move |socket| handle_agent_socket(socket, ctx))
}

async fn handle_agent_socket(socket: WebSocket, ctx: ServerContext) {
	let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
	let mut outbound_stream = UnboundedReceiverStream::new(outbound_rx);
	let (mut ws_tx, mut ws_rx) = socket.split();

	let send_task = tokio::spawn(async move {
		while let Some(message) = outbound_stream.next().await {
			let text = match serde_json::to_string(&message) {
				Ok(text) => text,
				Err(err) => {
					warn!(error = %err, "failed to encode channel message");
					continue;
				}
			};
			if ws_tx.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}
	});

	let mut bound: Option<String> = None;

	while let Some(message) = ws_rx.next().await {
		match message {
			Ok(Message::Text(text)) => match serde_json::from_str::<AgentMessage>(&text) {
				Ok(AgentMessage::Ready) => {
					if bound.is_some() {
						warn!(
							session = bound.as_deref(),
							"ready from an already bound agent ignored"
						);
						continue;
					}
					bound = complete_handshake(&ctx.registry, outbound_tx.clone());
				}
				Ok(AgentMessage::Reply(reply)) => process_reply(&ctx, reply),
				Err(err) => warn!(error = %err, "unparseable channel message dropped"),
			},
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(err) => {
				warn!(session = bound.as_deref(), error = %err, "channel transport error");
				break;
			}
		}
	}

	send_task.abort();

	match bound {
		Some(session_id) => {
			// a deliberate teardown purges before the socket closes; anything
			// still registered here means the agent went away on its own
			if ctx.registry.has_channel(&session_id) {
				warn!(session = %session_id, "unexpected channel disconnect, purging session");
				purge_and_resolve(&ctx.registry, &session_id);
			}
		}
		None => debug!("unbound channel connection closed"),
	}
}

/// Purge a session and answer every caller the purge orphaned with the
/// synthetic session-closed error. In-flight requests of a torn-down
/// session always get a terminal resolution rather than hanging.
pub(crate) fn purge_and_resolve(registry: &SessionRegistry, session_id: &str) {
	let orphaned = registry.purge(session_id);
	if !orphaned.is_empty() {
		debug!(
			session = session_id,
			count = orphaned.len(),
			"resolving orphaned requests"
		);
	}
	let err = ServerError::SessionClosed(session_id.to_string());
	for pending in orphaned {
		pending.resolve(CommandOutcome::error(&err));
	}
}

/// Creation handshake: bind this connection to the first session still
/// waiting for its channel, then answer the blocked creation request with
/// the browser's pid. A ready with no matching creation in flight is a
/// protocol anomaly; the connection is left unbound.
fn complete_handshake(registry: &SessionRegistry, channel: ChannelHandle) -> Option<String> {
	let Some((request_id, session_id)) = registry.find_unbound_pending() else {
		warn!("agent signaled ready with no creation in flight, leaving connection unbound");
		return None;
	};

	if !registry.bind_channel(&session_id, channel) {
		warn!(
			session = %session_id,
			"session already has a bound channel, leaving connection unbound"
		);
		return None;
	}

	debug!(session = %session_id, "channel ready");

	if let Some(pending) = registry.take_pending(request_id) {
		let pid = registry.process_pid(&session_id);
		pending.resolve(CommandOutcome::Value(json!(pid)));
	}

	Some(session_id)
}

/// Route one reply to its waiting caller, applying the bounded-retry rule
/// for transient not-found errors.
pub(crate) fn process_reply(ctx: &ServerContext, reply: CommandReply) {
	let Some((session_id, expires_at, command)) = ctx.registry.pending_view(reply.request_id)
	else {
		debug!(request = reply.request_id, "reply for unknown request dropped");
		return;
	};

	if reply.is_not_found() {
		if Instant::now() < expires_at {
			// transient: the target may simply not have rendered yet.
			// keep the request registered and re-emit the same command.
			debug!(session = %session_id, cmd = %command.name, "not found, retrying");
			schedule_retry(ctx, session_id, command);
			return;
		}
		if is_probe(&command.name) {
			if let Some(pending) = ctx.registry.take_pending(reply.request_id) {
				pending.resolve(CommandOutcome::Value(Value::Bool(false)));
			}
			return;
		}
	}

	let outcome = match (reply.value, reply.error_code) {
		(Some(value), _) => CommandOutcome::Value(value),
		(None, Some(code)) => CommandOutcome::Error {
			status: StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
			message: reply.error_message.unwrap_or_default(),
		},
		(None, None) => CommandOutcome::Status(StatusCode::OK),
	};

	if let Some(pending) = ctx.registry.take_pending(reply.request_id) {
		pending.resolve(outcome);
	}
}

/// Re-emit a command after the configured delay. The request stays
/// registered in the meantime; if the session is purged before the timer
/// fires, the re-emit is silently dropped.
fn schedule_retry(ctx: &ServerContext, session_id: String, command: Command) {
	let registry = Arc::clone(&ctx.registry);
	let delay = ctx.config.retry_delay;
	tokio::spawn(async move {
		tokio::time::sleep(delay).await;
		if !registry.has_pending(command.request_id) {
			return;
		}
		match registry.channel(&session_id) {
			Some(channel) => {
				if channel.send(ServerMessage::Command(command)).is_err() {
					debug!(session = %session_id, "channel gone before retry could be emitted");
				}
			}
			None => debug!(session = %session_id, "session gone before retry could be emitted"),
		}
	});
}
