use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::jsonrpc::{self, RpcError};
use crate::mcp::transport::Transport;
use crate::protocol::mcp as mcp_protocol;
use crate::protocol::{ADAPTERS, Method};
use crate::types::agent::Protocol;
use crate::types::envelope::Envelope;

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
	#[serde(skip)]
	pub request_timeout: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			request_timeout: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
	Connecting,
	Initializing,
	Ready,
	Closing,
	Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	#[error("agent not found")]
	AgentNotFound,
	#[error("mcp session not ready")]
	NotReady(SessionState),
	#[error("mcp session closed")]
	Closed,
	#[error("mcp request timed out")]
	Timeout,
	#[error("remote error: {0}")]
	Remote(RpcError),
	#[error("transport error: {0}")]
	Transport(String),
	#[error("method has no mcp wire form: {0:?}")]
	Unsupported(Method),
}

enum Cmd {
	Request {
		method: Method,
		params: Option<Value>,
		respond: oneshot::Sender<Result<Value, SessionError>>,
	},
	Card {
		respond: oneshot::Sender<Result<Value, SessionError>>,
	},
	State {
		respond: oneshot::Sender<SessionState>,
	},
	Close {
		respond: oneshot::Sender<()>,
	},
}

/// Clonable handle to one session actor.
#[derive(Clone)]
pub struct SessionHandle {
	agent_id: String,
	timeout: Duration,
	tx: mpsc::Sender<Cmd>,
}

impl SessionHandle {
	pub async fn request(
		&self,
		method: Method,
		params: Option<Value>,
	) -> Result<Value, SessionError> {
		let (tx, rx) = oneshot::channel();
		self
			.tx
			.send(Cmd::Request {
				method,
				params,
				respond: tx,
			})
			.await
			.map_err(|_| SessionError::Closed)?;
		match tokio::time::timeout(self.timeout, rx).await {
			Err(_) => Err(SessionError::Timeout),
			Ok(Err(_)) => Err(SessionError::Closed),
			Ok(Ok(result)) => result,
		}
	}

	pub async fn card(&self) -> Result<Value, SessionError> {
		let (tx, rx) = oneshot::channel();
		self
			.tx
			.send(Cmd::Card { respond: tx })
			.await
			.map_err(|_| SessionError::Closed)?;
		rx.await.map_err(|_| SessionError::Closed)?
	}

	pub async fn state(&self) -> SessionState {
		let (tx, rx) = oneshot::channel();
		if self.tx.send(Cmd::State { respond: tx }).await.is_err() {
			return SessionState::Closed;
		}
		rx.await.unwrap_or(SessionState::Closed)
	}

	pub async fn close(&self) {
		let (tx, rx) = oneshot::channel();
		if self.tx.send(Cmd::Close { respond: tx }).await.is_ok() {
			let _ = rx.await;
		}
	}

	pub fn agent_id(&self) -> &str {
		&self.agent_id
	}

	/// True once the actor has exited, whether gracefully or not.
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

struct Pending {
	respond: oneshot::Sender<Result<Value, SessionError>>,
}

/// One session actor per MCP agent. Owns the transport (including any child
/// process), the lifecycle state machine, the request-id correlation map and
/// the tools/resources/prompts caches.
pub struct Session {
	agent_id: String,
	cfg: SessionConfig,
	transport: Transport,
	incoming: mpsc::Receiver<Value>,

	state: SessionState,
	server_info: Value,
	capabilities: Value,
	tools: Option<Value>,
	resources: Option<Value>,
	prompts: Option<Value>,
	pending: HashMap<i64, Pending>,
	next_id: i64,
}

impl Session {
	/// Spawn the actor over an already-opened transport.
	pub fn spawn(
		agent_id: String,
		cfg: SessionConfig,
		transport: Transport,
		incoming: mpsc::Receiver<Value>,
	) -> SessionHandle {
		let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
		let timeout = cfg.request_timeout;
		let session = Session {
			agent_id: agent_id.clone(),
			cfg,
			transport,
			incoming,
			state: SessionState::Connecting,
			server_info: json!({}),
			capabilities: json!({}),
			tools: None,
			resources: None,
			prompts: None,
			pending: HashMap::new(),
			next_id: 1,
		};
		tokio::spawn(session.run(rx));
		SessionHandle {
			agent_id,
			timeout,
			tx,
		}
	}

	async fn run(mut self, mut cmds: mpsc::Receiver<Cmd>) {
		self.state = SessionState::Initializing;
		if let Err(e) = self.initialize().await {
			warn!(agent = %self.agent_id, "mcp initialize failed: {e}");
			self.state = SessionState::Closed;
			self.transport.close().await;
			return;
		}
		self.state = SessionState::Ready;
		debug!(agent = %self.agent_id, transport = self.transport.info(), "mcp session ready");

		loop {
			tokio::select! {
				cmd = cmds.recv() => match cmd {
					// All handles dropped; shut the session down.
					None => break,
					Some(Cmd::Close { respond }) => {
						self.close().await;
						let _ = respond.send(());
						return;
					},
					Some(cmd) => self.handle_cmd(cmd).await,
				},
				msg = self.incoming.recv() => match msg {
					None => {
						warn!(agent = %self.agent_id, "mcp upstream went away");
						break;
					},
					Some(msg) => self.handle_incoming(msg).await,
				},
			}
		}
		self.close().await;
	}

	/// The initialize handshake: request, initialized notification, then the
	/// eager listings for whatever the server advertises.
	async fn initialize(&mut self) -> Result<(), SessionError> {
		let result = self.roundtrip(Method::Initialize, None).await?;
		self.server_info = result.get("serverInfo").cloned().unwrap_or_else(|| json!({}));
		self.capabilities = result
			.get("capabilities")
			.cloned()
			.unwrap_or_else(|| json!({}));
		self.send_notification(Method::Initialized).await?;

		if self.capabilities.get("tools").is_some() {
			self.tools = self.roundtrip(Method::ListTools, None).await.ok();
		}
		if self.capabilities.get("resources").is_some() {
			self.resources = self.roundtrip(Method::ListResources, None).await.ok();
		}
		if self.capabilities.get("prompts").is_some() {
			self.prompts = self.roundtrip(Method::ListPrompts, None).await.ok();
		}
		Ok(())
	}

	async fn handle_cmd(&mut self, cmd: Cmd) {
		match cmd {
			Cmd::Request {
				method,
				params,
				respond,
			} => self.handle_request(method, params, respond).await,
			Cmd::Card { respond } => {
				let card = self.build_card().await;
				let _ = respond.send(card);
			},
			Cmd::State { respond } => {
				let _ = respond.send(self.state);
			},
			Cmd::Close { .. } => unreachable!("close is handled by the run loop"),
		}
	}

	async fn handle_request(
		&mut self,
		method: Method,
		params: Option<Value>,
		respond: oneshot::Sender<Result<Value, SessionError>>,
	) {
		if self.state != SessionState::Ready {
			let _ = respond.send(Err(SessionError::NotReady(self.state)));
			return;
		}
		match method {
			// Listings are cached; a *_changed notification empties the cache
			// and the next listing refreshes it.
			Method::ListTools => {
				let result = self.cached_list(Method::ListTools).await;
				let _ = respond.send(result);
			},
			Method::ListResources => {
				let result = self.cached_list(Method::ListResources).await;
				let _ = respond.send(result);
			},
			Method::ListPrompts => {
				let result = self.cached_list(Method::ListPrompts).await;
				let _ = respond.send(result);
			},
			m if mcp_protocol::is_notification(m) => {
				let result = self.send_notification(m).await.map(|_| Value::Null);
				let _ = respond.send(result);
			},
			// Everything else runs concurrently through the pending map.
			_ => self.fire_request(method, params, respond).await,
		}
	}

	async fn cached_list(&mut self, method: Method) -> Result<Value, SessionError> {
		let slot = match method {
			Method::ListTools => &self.tools,
			Method::ListResources => &self.resources,
			_ => &self.prompts,
		};
		if let Some(cached) = slot {
			return Ok(cached.clone());
		}
		let fresh = self.roundtrip(method, None).await?;
		match method {
			Method::ListTools => self.tools = Some(fresh.clone()),
			Method::ListResources => self.resources = Some(fresh.clone()),
			_ => self.prompts = Some(fresh.clone()),
		}
		Ok(fresh)
	}

	/// Issue a request and register a waiter; the response is routed back by
	/// id when it arrives on the incoming channel.
	async fn fire_request(
		&mut self,
		method: Method,
		params: Option<Value>,
		respond: oneshot::Sender<Result<Value, SessionError>>,
	) {
		let id = self.next_id;
		self.next_id += 1;
		let request = match self.encode(method, params, json!(id)) {
			Ok(r) => r,
			Err(e) => {
				let _ = respond.send(Err(e));
				return;
			},
		};
		self.pending.insert(id, Pending { respond });
		if let Err(e) = self
			.transport
			.send(&serde_json::to_value(&request).expect("request serializes"))
			.await
			&& let Some(p) = self.pending.remove(&id)
		{
			let _ = p.respond.send(Err(SessionError::Transport(e.to_string())));
		}
	}

	/// Serial request/response used for the handshake and cached listings.
	/// Unrelated incoming traffic is processed while waiting.
	async fn roundtrip(&mut self, method: Method, params: Option<Value>) -> Result<Value, SessionError> {
		let id = self.next_id;
		self.next_id += 1;
		let request = self.encode(method, params, json!(id))?;
		self
			.transport
			.send(&serde_json::to_value(&request).expect("request serializes"))
			.await
			.map_err(|e| SessionError::Transport(e.to_string()))?;

		let deadline = Instant::now() + self.cfg.request_timeout;
		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Err(SessionError::Timeout);
			}
			match tokio::time::timeout(remaining, self.incoming.recv()).await {
				Err(_) => return Err(SessionError::Timeout),
				Ok(None) => return Err(SessionError::Transport("upstream closed".to_string())),
				Ok(Some(msg)) => {
					if msg.get("id").and_then(Value::as_i64) == Some(id)
						&& (msg.get("result").is_some() || msg.get("error").is_some())
					{
						if let Some(error) = msg.get("error") {
							return Err(SessionError::Remote(RpcError::from_value(error.clone())));
						}
						return Ok(msg.get("result").cloned().unwrap_or(Value::Null));
					}
					self.handle_incoming(msg).await;
				},
			}
		}
	}

	async fn handle_incoming(&mut self, msg: Value) {
		let adapter = ADAPTERS.lookup(Protocol::Mcp, None);
		// Responses route to their waiter by id.
		if msg.get("result").is_some() || msg.get("error").is_some() {
			let Some(id) = msg.get("id").and_then(Value::as_i64) else {
				debug!(agent = %self.agent_id, "dropping response without a usable id");
				return;
			};
			let Some(pending) = self.pending.remove(&id) else {
				debug!(agent = %self.agent_id, id, "dropping response with no pending request");
				return;
			};
			let outcome = match msg.get("error") {
				Some(error) => Err(SessionError::Remote(RpcError::from_value(error.clone()))),
				None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
			};
			let _ = pending.respond.send(outcome);
			return;
		}

		let Some(wire_method) = msg.get("method").and_then(Value::as_str) else {
			// Valid JSON, but neither a response nor a method call.
			debug!(agent = %self.agent_id, "dropping unrecognized mcp message");
			return;
		};
		let canonical = adapter.normalize_method(wire_method);

		// Server-originated requests get an answer with the same id.
		if let Some(id) = msg.get("id").filter(|id| !id.is_null()) {
			let response = match canonical {
				Some(m) if mcp_protocol::is_server_request(m) => {
					mcp_protocol::server_request_response(m, id.clone())
				},
				_ => jsonrpc::Response::error(
					id.clone(),
					RpcError::new(jsonrpc::code::METHOD_NOT_FOUND, "unknown method"),
				),
			};
			if let Err(e) = self
				.transport
				.send(&serde_json::to_value(&response).expect("response serializes"))
				.await
			{
				debug!(agent = %self.agent_id, "failed to answer server request: {e}");
			}
			return;
		}

		match canonical {
			Some(Method::ToolsChanged) => self.tools = None,
			Some(Method::ResourcesChanged) => self.resources = None,
			Some(Method::PromptsChanged) => self.prompts = None,
			Some(Method::ResourceUpdated) => {
				debug!(agent = %self.agent_id, "resource updated upstream")
			},
			Some(Method::LogMessage) => {
				debug!(target: "mcp log", agent = %self.agent_id, params = ?msg.get("params"))
			},
			Some(Method::Progress) | Some(Method::Cancelled) => {
				debug!(agent = %self.agent_id, method = wire_method, "progress notification")
			},
			_ => debug!(agent = %self.agent_id, method = wire_method, "dropping unknown notification"),
		}
	}

	/// Synthesize the agent card from session state, refreshing invalidated
	/// caches first.
	async fn build_card(&mut self) -> Result<Value, SessionError> {
		if self.state != SessionState::Ready {
			return Err(SessionError::NotReady(self.state));
		}
		if self.tools.is_none() && self.capabilities.get("tools").is_some() {
			self.tools = self.roundtrip(Method::ListTools, None).await.ok();
		}
		if self.resources.is_none() && self.capabilities.get("resources").is_some() {
			self.resources = self.roundtrip(Method::ListResources, None).await.ok();
		}
		if self.prompts.is_none() && self.capabilities.get("prompts").is_some() {
			self.prompts = self.roundtrip(Method::ListPrompts, None).await.ok();
		}

		let tools = self
			.tools
			.as_ref()
			.and_then(|t| t.get("tools"))
			.and_then(Value::as_array)
			.cloned()
			.unwrap_or_default();
		let skills: Vec<Value> = tools
			.iter()
			.map(|tool| {
				json!({
					"id": tool.get("name").cloned().unwrap_or(Value::Null),
					"name": tool.get("name").cloned().unwrap_or(Value::Null),
					"description": tool.get("description").cloned().unwrap_or(Value::Null),
					"inputSchema": tool.get("inputSchema").cloned().unwrap_or(Value::Null),
				})
			})
			.collect();
		Ok(json!({
			"name": self.agent_id,
			"protocol": "mcp",
			"protocolVersion": crate::protocol::mcp::VERSION,
			"description": self
				.server_info
				.get("name")
				.and_then(Value::as_str)
				.unwrap_or(&self.agent_id),
			"version": self.server_info.get("version").cloned().unwrap_or(Value::Null),
			"capabilities": self.capabilities,
			"skills": skills,
			"resources": self
				.resources
				.as_ref()
				.and_then(|r| r.get("resources"))
				.cloned()
				.unwrap_or_else(|| json!([])),
			"prompts": self
				.prompts
				.as_ref()
				.and_then(|p| p.get("prompts"))
				.cloned()
				.unwrap_or_else(|| json!([])),
		}))
	}

	async fn send_notification(&mut self, method: Method) -> Result<(), SessionError> {
		let request = self.encode(method, None, Value::Null)?;
		self
			.transport
			.send(&serde_json::to_value(&request).expect("request serializes"))
			.await
			.map_err(|e| SessionError::Transport(e.to_string()))
	}

	fn encode(
		&self,
		method: Method,
		params: Option<Value>,
		rpc_id: Value,
	) -> Result<jsonrpc::Request, SessionError> {
		let adapter = ADAPTERS.lookup(Protocol::Mcp, None);
		let mut env = Envelope::new(Protocol::Mcp, adapter.version(), method, rpc_id);
		env.payload = params;
		adapter
			.encode(&env)
			.map_err(|_| SessionError::Unsupported(method))
	}

	/// Graceful teardown: drain pending requests up to the request timeout,
	/// then shut the transport down. Stdio servers get a shutdown line and a
	/// short grace period before the child is killed.
	async fn close(&mut self) {
		self.state = SessionState::Closing;
		let deadline = Instant::now() + self.cfg.request_timeout;
		while !self.pending.is_empty() {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				break;
			}
			match tokio::time::timeout(remaining, self.incoming.recv()).await {
				Ok(Some(msg)) => self.handle_incoming(msg).await,
				_ => break,
			}
		}
		for (_, pending) in self.pending.drain() {
			let _ = pending.respond.send(Err(SessionError::Closed));
		}

		if self.transport.is_stdio() {
			let _ = self
				.transport
				.send(&json!({"jsonrpc": jsonrpc::VERSION, "method": "shutdown"}))
				.await;
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
		self.transport.close().await;
		self.state = SessionState::Closed;
		debug!(agent = %self.agent_id, "mcp session closed");
	}
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
