mod session;
mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

pub use session::{Session, SessionConfig, SessionError, SessionHandle, SessionState};
pub use transport::{HttpTransport, StdioTransport, Transport, TransportError};

use crate::client::Client;
use crate::protocol::Method;
use crate::store::AgentStore;

/// Registry of MCP sessions, one per MCP agent. Sessions spawn lazily and
/// respawn after a failure on the next use.
#[derive(Clone)]
pub struct Sessions {
	inner: Arc<Inner>,
}

struct Inner {
	agents: Arc<AgentStore>,
	client: Client,
	cfg: SessionConfig,
	map: RwLock<HashMap<String, SessionHandle>>,
}

impl Sessions {
	pub fn new(agents: Arc<AgentStore>, client: Client, cfg: SessionConfig) -> Sessions {
		Sessions {
			inner: Arc::new(Inner {
				agents,
				client,
				cfg,
				map: RwLock::new(HashMap::new()),
			}),
		}
	}

	pub async fn request(
		&self,
		agent_id: &str,
		method: Method,
		params: Option<Value>,
	) -> Result<Value, SessionError> {
		self.get_or_spawn(agent_id)?.request(method, params).await
	}

	pub async fn card(&self, agent_id: &str) -> Result<Value, SessionError> {
		self.get_or_spawn(agent_id)?.card().await
	}

	pub async fn state(&self, agent_id: &str) -> Result<SessionState, SessionError> {
		Ok(self.get_or_spawn(agent_id)?.state().await)
	}

	/// Forget the agent's session and close it in the background, releasing
	/// any child process it owns.
	pub fn remove(&self, agent_id: &str) {
		if let Some(handle) = self.inner.map.write().remove(agent_id) {
			debug!(agent = %agent_id, "closing mcp session");
			tokio::spawn(async move { handle.close().await });
		}
	}

	fn get_or_spawn(&self, agent_id: &str) -> Result<SessionHandle, SessionError> {
		let agent = self
			.inner
			.agents
			.get(agent_id)
			.ok_or(SessionError::AgentNotFound)?;
		if let Some(existing) = self.inner.map.read().get(agent_id)
			&& !existing.is_closed()
		{
			return Ok(existing.clone());
		}
		let mut map = self.inner.map.write();
		if let Some(existing) = map.get(agent_id)
			&& !existing.is_closed()
		{
			return Ok(existing.clone());
		}
		let (transport, incoming) = match agent.stdio_command() {
			Some(command) => StdioTransport::spawn(&command)
				.map_err(|e| SessionError::Transport(e.to_string()))?,
			None => HttpTransport::connect(
				self.inner.client.clone(),
				agent.url.clone(),
				agent.bearer.clone(),
			),
		};
		let handle = Session::spawn(
			agent_id.to_string(),
			self.inner.cfg.clone(),
			transport,
			incoming,
		);
		map.insert(agent_id.to_string(), handle.clone());
		Ok(handle)
	}
}

impl std::fmt::Debug for Sessions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Sessions")
			.field("sessions", &self.inner.map.read().len())
			.finish()
	}
}
