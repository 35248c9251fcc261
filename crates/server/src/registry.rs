//! Process-wide session registry.
//!
//! Single logical owner of the three tables the correlation engine runs
//! on: session to OS process handle, session to bound channel, and the
//! pending-request table keyed by request id. HTTP handlers, the channel
//! server, and timer tasks synchronize exclusively through these
//! operations; each one is a single short critical section behind one
//! mutex, and none of them resolves a caller while the lock is held.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::StatusCode;
use browserd_protocol::{Command, RequestId, ServerMessage, cmd};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::ServerError;
use crate::launcher::BrowserProcess;

/// Sender half of a session's duplex channel. The receiver is drained
/// into the WebSocket by a writer task owned by the connection.
pub type ChannelHandle = mpsc::UnboundedSender<ServerMessage>;

/// Terminal payload delivered to the caller that opened a request.
#[derive(Debug, PartialEq)]
pub enum CommandOutcome {
	/// JSON body with status 200.
	Value(Value),
	/// Bare status, no body.
	Status(StatusCode),
	Error {
		status: StatusCode,
		message: String,
	},
}

impl CommandOutcome {
	pub fn error(err: &ServerError) -> Self {
		Self::Error {
			status: err.status(),
			message: err.to_string(),
		}
	}
}

/// One caller blocked on an in-flight command.
pub struct PendingRequest {
	pub session_id: String,
	/// Wire form of the command, kept so the retry path can re-emit it.
	pub command: Command,
	/// Retry window end; set to "now" when the caller supplied no timeout,
	/// which makes the first not-found reply terminal.
	pub expires_at: Instant,
	resolver: oneshot::Sender<CommandOutcome>,
}

impl PendingRequest {
	pub fn new(
		session_id: String,
		command: Command,
		expires_at: Instant,
		resolver: oneshot::Sender<CommandOutcome>,
	) -> Self {
		Self {
			session_id,
			command,
			expires_at,
			resolver,
		}
	}

	/// Answer the caller. Consumes the request: the sender moves in here
	/// and the registry entry is already gone by the time callers hold
	/// this value, so a request can never be answered twice.
	pub fn resolve(self, outcome: CommandOutcome) {
		if self.resolver.send(outcome).is_err() {
			debug!(
				request = self.command.request_id,
				session = %self.session_id,
				"caller went away before its request resolved"
			);
		}
	}
}

#[derive(Default)]
struct Tables {
	pending: HashMap<RequestId, PendingRequest>,
	channels: HashMap<String, ChannelHandle>,
	processes: HashMap<String, BrowserProcess>,
}

#[derive(Default)]
pub struct SessionRegistry {
	tables: Mutex<Tables>,
	next_request_id: AtomicU64,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Ids come from a monotonic counter, so freshness needs no check.
	pub fn next_request_id(&self) -> RequestId {
		self.next_request_id.fetch_add(1, Ordering::Relaxed)
	}

	pub fn register_pending(&self, id: RequestId, pending: PendingRequest) {
		self.tables.lock().pending.insert(id, pending);
	}

	/// Remove and return the pending request. All resolution goes through
	/// the returned value, which is the double-resolve guard: whoever
	/// takes the entry owns the only path to the caller.
	pub fn take_pending(&self, id: RequestId) -> Option<PendingRequest> {
		self.tables.lock().pending.remove(&id)
	}

	pub fn has_pending(&self, id: RequestId) -> bool {
		self.tables.lock().pending.contains_key(&id)
	}

	/// Snapshot of a registered request for the reply handler: target
	/// session, deadline, and command, cloned out so no lock is held
	/// while deciding what to do with the reply.
	pub fn pending_view(&self, id: RequestId) -> Option<(String, Instant, Command)> {
		let tables = self.tables.lock();
		tables
			.pending
			.get(&id)
			.map(|p| (p.session_id.clone(), p.expires_at, p.command.clone()))
	}

	/// First pending request whose target session has no bound channel.
	///
	/// Used only by the creation handshake: a connecting agent matches
	/// whichever creation is still waiting for its channel. First-match
	/// is the protocol here, not an ordering accident; outside this one
	/// lookup, correlation is always by request id.
	pub fn find_unbound_pending(&self) -> Option<(RequestId, String)> {
		let tables = self.tables.lock();
		tables
			.pending
			.iter()
			.find(|(_, p)| !tables.channels.contains_key(&p.session_id))
			.map(|(id, p)| (*id, p.session_id.clone()))
	}

	/// Atomic creation precondition: the target id must have no bound
	/// channel, no process, and no creation already in flight. Registers
	/// the creation request on success, so of any number of concurrent
	/// creations for one id exactly one wins.
	pub fn begin_session(&self, id: RequestId, pending: PendingRequest) -> Result<(), ServerError> {
		let mut tables = self.tables.lock();
		let session_id = &pending.session_id;
		let creation_in_flight = tables
			.pending
			.values()
			.any(|p| p.session_id == *session_id && p.command.name == cmd::START);
		if tables.channels.contains_key(session_id)
			|| tables.processes.contains_key(session_id)
			|| creation_in_flight
		{
			return Err(ServerError::SessionExists(session_id.clone()));
		}
		tables.pending.insert(id, pending);
		Ok(())
	}

	/// Bind a channel to a session. Refuses a second binding; a session
	/// must never have two channels.
	pub fn bind_channel(&self, session_id: &str, channel: ChannelHandle) -> bool {
		let mut tables = self.tables.lock();
		match tables.channels.entry(session_id.to_string()) {
			Entry::Occupied(_) => false,
			Entry::Vacant(vacant) => {
				vacant.insert(channel);
				true
			}
		}
	}

	pub fn channel(&self, session_id: &str) -> Option<ChannelHandle> {
		self.tables.lock().channels.get(session_id).cloned()
	}

	pub fn has_channel(&self, session_id: &str) -> bool {
		self.tables.lock().channels.contains_key(session_id)
	}

	pub fn set_process(&self, session_id: &str, process: BrowserProcess) {
		self.tables
			.lock()
			.processes
			.insert(session_id.to_string(), process);
	}

	pub fn has_process(&self, session_id: &str) -> bool {
		self.tables.lock().processes.contains_key(session_id)
	}

	pub fn process_pid(&self, session_id: &str) -> Option<u32> {
		self.tables
			.lock()
			.processes
			.get(session_id)
			.map(|p| p.pid())
	}

	pub fn take_process(&self, session_id: &str) -> Option<BrowserProcess> {
		self.tables.lock().processes.remove(session_id)
	}

	/// Session ids that completed the ready handshake, sorted.
	pub fn session_ids(&self) -> Vec<String> {
		let tables = self.tables.lock();
		let mut ids: Vec<String> = tables.channels.keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Drop the process handle and channel binding and drain every pending
	/// request targeting the session. Idempotent. The drained requests are
	/// returned so the caller resolves them outside the lock; leaving them
	/// in the table would strand their callers forever.
	#[must_use]
	pub fn purge(&self, session_id: &str) -> Vec<PendingRequest> {
		let mut tables = self.tables.lock();
		tables.processes.remove(session_id);
		tables.channels.remove(session_id);
		let orphaned: Vec<RequestId> = tables
			.pending
			.iter()
			.filter(|(_, p)| p.session_id == session_id)
			.map(|(id, _)| *id)
			.collect();
		orphaned
			.into_iter()
			.filter_map(|id| tables.pending.remove(&id))
			.collect()
	}
}
