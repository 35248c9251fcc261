//! browserd server core.
//!
//! The correlation engine between HTTP callers and live browser sessions:
//!
//! - [`registry`] - process-wide table of sessions, their OS processes,
//!   their duplex channels, and every request awaiting a reply
//! - [`channel`] - WebSocket endpoint the in-browser agents connect to;
//!   completes the creation handshake and routes replies back to callers
//! - [`gateway`] - the REST surface; normalizes requests into command
//!   records and manages the full request/response cycle
//! - [`launcher`] - browser process spawn/terminate and profile cleanup

pub mod channel;
pub mod config;
pub mod error;
pub mod gateway;
pub mod launcher;
pub mod registry;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

pub use config::ServerConfig;
pub use error::{Result, ServerError};

/// Shared handles every request handler and channel task operates on.
#[derive(Clone)]
pub struct ServerContext {
	pub registry: Arc<registry::SessionRegistry>,
	pub launcher: Arc<launcher::BrowserLauncher>,
	pub config: Arc<ServerConfig>,
}

impl ServerContext {
	pub fn new(config: ServerConfig) -> Self {
		let config = Arc::new(config);
		Self {
			registry: Arc::new(registry::SessionRegistry::new()),
			launcher: Arc::new(launcher::BrowserLauncher::new(Arc::clone(&config))),
			config,
		}
	}
}

/// Build the full application router: the REST surface plus the agent
/// channel endpoint.
pub fn app(config: ServerConfig) -> Router {
	gateway::router(ServerContext::new(config))
}

/// Serve on the given listener until ctrl-c.
pub async fn serve(config: ServerConfig, listener: TcpListener) -> std::io::Result<()> {
	axum::serve(listener, app(config).into_make_service())
		.with_graceful_shutdown(shutdown_signal())
		.await
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("shutdown requested");
}
