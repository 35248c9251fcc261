//! End-to-end exercises of the session lifecycle: REST caller on one side,
//! a scripted stand-in for the in-browser agent on the other.
//!
//! Sessions are "spawned" as /bin/sh (which exits immediately - nothing
//! here depends on the process staying alive), and the agent half of the
//! channel is driven by the tests themselves.

#![cfg(unix)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use browserd_protocol::{AgentMessage, Command, CommandReply, ServerMessage, cmd};
use browserd_server::{ServerConfig, app};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

struct TestServer {
	addr: SocketAddr,
	profile_root: TempDir,
}

async fn start_server() -> TestServer {
	let profile_root = TempDir::new().unwrap();
	let mut config = ServerConfig::new("/bin/sh");
	config.profile_root = profile_root.path().to_path_buf();
	config.retry_delay = Duration::from_millis(25);
	config.profile_delete_backoff = Duration::from_millis(5);

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let router = app(config);
	tokio::spawn(async move {
		axum::serve(listener, router.into_make_service())
			.await
			.unwrap();
	});

	TestServer { addr, profile_root }
}

fn client() -> reqwest::Client {
	reqwest::Client::builder().no_proxy().build().unwrap()
}

fn url(addr: SocketAddr, path: &str) -> String {
	format!("http://{addr}{path}")
}

/// Scripted stand-in for the in-browser agent.
struct Agent {
	socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Agent {
	/// Connect to the channel endpoint and signal readiness.
	async fn connect(addr: SocketAddr) -> Agent {
		let (socket, _) = connect_async(format!("ws://{addr}/channel")).await.unwrap();
		let mut agent = Agent { socket };
		agent.send(&AgentMessage::Ready).await;
		agent
	}

	async fn send(&mut self, message: &AgentMessage) {
		let text = serde_json::to_string(message).unwrap();
		self.socket.send(Message::Text(text)).await.unwrap();
	}

	async fn next_command(&mut self) -> Command {
		loop {
			let message = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
				.await
				.expect("timed out waiting for a command")
				.expect("channel closed")
				.unwrap();
			if let Message::Text(text) = message {
				let ServerMessage::Command(command) = serde_json::from_str(&text).unwrap();
				return command;
			}
		}
	}

	async fn reply_value(&mut self, request_id: u64, value: Value) {
		self.send(&AgentMessage::Reply(CommandReply::value(request_id, value)))
			.await;
	}

	async fn reply_void(&mut self, request_id: u64) {
		self.send(&AgentMessage::Reply(CommandReply {
			request_id,
			..CommandReply::default()
		}))
		.await;
	}

	async fn reply_error(&mut self, request_id: u64, code: u16, message: &str) {
		self.send(&AgentMessage::Reply(CommandReply::error(
			request_id, code, message,
		)))
		.await;
	}
}

/// Issue the blocking creation request, then connect an agent to complete
/// the ready handshake.
async fn create_session(server: &TestServer, id: &str) -> Agent {
	let creation = tokio::spawn({
		let url = url(server.addr, &format!("/{id}"));
		async move { client().put(url).send().await.unwrap() }
	});

	// let the creation register its pending request before the agent binds
	tokio::time::sleep(Duration::from_millis(50)).await;
	let agent = Agent::connect(server.addr).await;

	let response = creation.await.unwrap();
	assert_eq!(response.status(), 200);
	let pid: Value = response.json().await.unwrap();
	assert!(pid.is_number(), "creation should answer with the pid");
	agent
}

#[tokio::test]
async fn create_session_completes_ready_handshake() {
	let server = start_server().await;
	let _agent = create_session(&server, "b1").await;

	let sessions: Vec<String> = client()
		.get(url(server.addr, "/"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(sessions, vec!["b1".to_string()]);
}

#[tokio::test]
async fn duplicate_creation_conflicts_and_keeps_the_existing_session() {
	let server = start_server().await;
	let _agent = create_session(&server, "b1").await;

	let response = client()
		.put(url(server.addr, "/b1"))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 409);

	let sessions: Vec<String> = client()
		.get(url(server.addr, "/"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(sessions, vec!["b1".to_string()]);
}

#[tokio::test]
async fn concurrent_creations_elect_exactly_one_winner() {
	let server = start_server().await;

	let first = tokio::spawn({
		let url = url(server.addr, "/b1");
		async move { client().put(url).send().await.unwrap().status() }
	});
	let second = tokio::spawn({
		let url = url(server.addr, "/b1");
		async move { client().put(url).send().await.unwrap().status() }
	});

	tokio::time::sleep(Duration::from_millis(50)).await;
	let _agent = Agent::connect(server.addr).await;

	let mut statuses = vec![
		first.await.unwrap().as_u16(),
		second.await.unwrap().as_u16(),
	];
	statuses.sort();
	assert_eq!(statuses, vec![200, 409]);
}

#[tokio::test]
async fn url_round_trip_through_the_agent() {
	let server = start_server().await;
	let mut agent = create_session(&server, "b1").await;

	let set = tokio::spawn({
		let url = url(server.addr, "/b1/url");
		async move {
			client()
				.put(url)
				.json(&json!({"value": "http://x"}))
				.send()
				.await
				.unwrap()
		}
	});
	let command = agent.next_command().await;
	assert_eq!(command.name, cmd::SET_URL);
	assert_eq!(command.value, Some(json!("http://x")));
	agent.reply_void(command.request_id).await;
	assert_eq!(set.await.unwrap().status(), 200);

	let get = tokio::spawn({
		let url = url(server.addr, "/b1/url");
		async move { client().get(url).send().await.unwrap() }
	});
	let command = agent.next_command().await;
	assert_eq!(command.name, cmd::GET_URL);
	agent.reply_value(command.request_id, json!("http://x")).await;

	let response = get.await.unwrap();
	assert_eq!(response.status(), 200);
	let value: Value = response.json().await.unwrap();
	assert_eq!(value, json!("http://x"));
}

#[tokio::test]
async fn probe_not_found_resolves_false_without_waiting() {
	let server = start_server().await;
	let mut agent = create_session(&server, "b1").await;

	let probe = tokio::spawn({
		let url = url(server.addr, "/b1/doc/id=result_bad?check_exists");
		async move {
			client()
				.get(url)
				.header("x-timeout-in-sec", "0")
				.send()
				.await
				.unwrap()
		}
	});
	let command = agent.next_command().await;
	assert_eq!(command.name, cmd::CHECK_EXISTS);
	assert_eq!(command.path, "/id=result_bad");
	agent
		.reply_error(command.request_id, 404, "no such element")
		.await;

	let response = probe.await.unwrap();
	assert_eq!(response.status(), 200);
	let value: Value = response.json().await.unwrap();
	assert_eq!(value, json!(false));
}

#[tokio::test]
async fn non_probe_not_found_propagates_after_deadline() {
	let server = start_server().await;
	let mut agent = create_session(&server, "b1").await;

	let request = tokio::spawn({
		let url = url(server.addr, "/b1/doc/id=missing?get_value");
		async move { client().get(url).send().await.unwrap() }
	});
	let command = agent.next_command().await;
	assert_eq!(command.name, "get_value");
	agent
		.reply_error(command.request_id, 404, "no element at path")
		.await;

	let response = request.await.unwrap();
	assert_eq!(response.status(), 404);
	let message: Value = response.json().await.unwrap();
	assert_eq!(message, json!("no element at path"));
}

#[tokio::test]
async fn transient_not_found_retries_with_the_same_request_id() {
	let server = start_server().await;
	let mut agent = create_session(&server, "b1").await;

	let request = tokio::spawn({
		let url = url(server.addr, "/b1/doc/id=slow?get_value");
		async move {
			client()
				.get(url)
				.header("x-timeout-in-sec", "5")
				.send()
				.await
				.unwrap()
		}
	});

	let first = agent.next_command().await;
	assert_eq!(first.name, "get_value");
	agent.reply_error(first.request_id, 404, "not rendered yet").await;

	// the command comes back after the retry delay, same correlation id
	let second = agent.next_command().await;
	assert_eq!(second.request_id, first.request_id);
	assert_eq!(second.name, "get_value");
	assert_eq!(second.path, first.path);
	agent.reply_value(second.request_id, json!("ready")).await;

	let response = request.await.unwrap();
	assert_eq!(response.status(), 200);
	let value: Value = response.json().await.unwrap();
	assert_eq!(value, json!("ready"));
}

#[tokio::test]
async fn unexpected_disconnect_purges_and_resolves_in_flight_requests() {
	let server = start_server().await;
	let mut agent = create_session(&server, "b2").await;

	let first = tokio::spawn({
		let url = url(server.addr, "/b2/doc/id=a?get_value");
		async move { client().get(url).send().await.unwrap() }
	});
	let c1 = agent.next_command().await;
	assert_eq!(c1.name, "get_value");

	let second = tokio::spawn({
		let url = url(server.addr, "/b2/doc/id=b?get_text");
		async move { client().get(url).send().await.unwrap() }
	});
	let c2 = agent.next_command().await;
	assert_eq!(c2.name, "get_text");

	// agent goes away without replying to either
	drop(agent);

	for request in [first, second] {
		let response = request.await.unwrap();
		assert_eq!(response.status(), 404);
		let message: Value = response.json().await.unwrap();
		assert_eq!(message, json!("session closed: b2"));
	}

	let sessions: Vec<String> = client()
		.get(url(server.addr, "/"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert!(sessions.is_empty());
}

#[tokio::test]
async fn destroy_session_waits_for_exit_and_deletes_profile_data() {
	let server = start_server().await;
	let _agent = create_session(&server, "b1").await;

	let response = client()
		.delete(url(server.addr, "/b1"))
		.json(&json!({"deleteSessionData": true}))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 204);
	assert!(!server.profile_root.path().join("b1").exists());

	let sessions: Vec<String> = client()
		.get(url(server.addr, "/"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert!(sessions.is_empty());

	// the session is gone; a second delete cannot find it
	let response = client()
		.delete(url(server.addr, "/b1"))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn destroy_all_succeeds_with_zero_sessions() {
	let server = start_server().await;
	let response = client().delete(url(server.addr, "/")).send().await.unwrap();
	assert_eq!(response.status(), 204);

	let sessions: Vec<String> = client()
		.get(url(server.addr, "/"))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert!(sessions.is_empty());
}

#[tokio::test]
async fn commands_against_unknown_sessions_are_not_found() {
	let server = start_server().await;
	let response = client()
		.get(url(server.addr, "/nope/url"))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn doc_request_without_action_is_a_bad_request() {
	let server = start_server().await;
	let _agent = create_session(&server, "b1").await;

	let response = client()
		.get(url(server.addr, "/b1/doc/id=result"))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn unsupported_session_type_is_rejected() {
	let server = start_server().await;
	let response = client()
		.put(url(server.addr, "/b9"))
		.json(&json!({"type": "firefox"}))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 415);
}

#[tokio::test]
async fn session_ids_with_path_separators_are_rejected() {
	let server = start_server().await;
	let response = client()
		.put(url(server.addr, "/a%2Fb"))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn sleep_resolves_locally_without_touching_the_channel() {
	let server = start_server().await;
	let mut agent = create_session(&server, "b1").await;

	let started = Instant::now();
	let response = client()
		.post(url(server.addr, "/b1?sleep"))
		.json(&json!({"value": 0.2}))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);
	assert!(started.elapsed() >= Duration::from_millis(200));

	// prove the sleep never crossed the wire: the next command the agent
	// sees is the follow-up, not the sleep
	let follow_up = tokio::spawn({
		let url = url(server.addr, "/b1/url");
		async move { client().get(url).send().await.unwrap() }
	});
	let command = agent.next_command().await;
	assert_eq!(command.name, cmd::GET_URL);
	agent.reply_value(command.request_id, json!("about:blank")).await;
	assert_eq!(follow_up.await.unwrap().status(), 200);
}

#[tokio::test]
async fn throttle_header_delays_processing() {
	let server = start_server().await;
	let started = Instant::now();
	let response = client()
		.get(url(server.addr, "/"))
		.header("x-throttle-requests-in-ms", "100")
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 200);
	assert!(started.elapsed() >= Duration::from_millis(100));
}
