use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::Client;
use crate::types::agent::StdioCommand;

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
	#[error("failed to spawn mcp server: {0}")]
	Spawn(String),
	#[error("transport closed")]
	Closed,
	#[error("upstream status {0}")]
	Http(u16),
	#[error("transport error: {0}")]
	Transport(String),
	#[error("unexpected content type: {0}")]
	ContentType(String),
}

/// An MCP transport. Incoming JSON-RPC messages, whatever the direction,
/// arrive on the receiver handed out at connect time; correlation is the
/// session's job.
pub enum Transport {
	Http(HttpTransport),
	Stdio(StdioTransport),
}

impl Transport {
	pub async fn send(&self, message: &Value) -> Result<(), TransportError> {
		match self {
			Transport::Http(t) => t.send(message).await,
			Transport::Stdio(t) => t.send(message).await,
		}
	}

	pub async fn close(&mut self) {
		match self {
			Transport::Http(t) => t.close().await,
			Transport::Stdio(t) => t.close().await,
		}
	}

	pub fn is_stdio(&self) -> bool {
		matches!(self, Transport::Stdio(_))
	}

	pub fn info(&self) -> &'static str {
		match self {
			Transport::Http(_) => "streamable-http",
			Transport::Stdio(_) => "stdio",
		}
	}
}

/// Streamable-HTTP transport: every send is a POST that may come back as a
/// single JSON message, an SSE stream of messages, or a bare 202.
pub struct HttpTransport {
	client: Client,
	url: String,
	bearer: Option<String>,
	session_id: Arc<RwLock<Option<String>>>,
	incoming: mpsc::Sender<Value>,
}

impl HttpTransport {
	pub fn connect(
		client: Client,
		url: String,
		bearer: Option<String>,
	) -> (Transport, mpsc::Receiver<Value>) {
		let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
		(
			Transport::Http(HttpTransport {
				client,
				url,
				bearer,
				session_id: Arc::new(RwLock::new(None)),
				incoming: tx,
			}),
			rx,
		)
	}

	async fn send(&self, message: &Value) -> Result<(), TransportError> {
		let mut builder = self
			.client
			.raw()
			.post(&self.url)
			.json(message)
			.header(
				reqwest::header::ACCEPT,
				"application/json, text/event-stream",
			);
		if let Some(token) = &self.bearer {
			builder = builder.bearer_auth(token);
		}
		if let Some(session_id) = self.session_id.read().clone() {
			builder = builder.header(HEADER_SESSION_ID, session_id);
		}
		let resp = builder
			.send()
			.await
			.map_err(|e| TransportError::Transport(e.to_string()))?;

		if resp.status() == reqwest::StatusCode::ACCEPTED {
			return Ok(());
		}
		if !resp.status().is_success() {
			return Err(TransportError::Http(resp.status().as_u16()));
		}
		if let Some(sid) = resp
			.headers()
			.get(HEADER_SESSION_ID)
			.and_then(|v| v.to_str().ok())
		{
			*self.session_id.write() = Some(sid.to_string());
		}

		let content_type = resp
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_string();
		if content_type.starts_with("application/json") {
			let message: Value = resp
				.json()
				.await
				.map_err(|e| TransportError::Transport(e.to_string()))?;
			let _ = self.incoming.send(message).await;
			return Ok(());
		}
		if content_type.starts_with("text/event-stream") {
			let incoming = self.incoming.clone();
			tokio::spawn(async move {
				let mut events = resp.bytes_stream().eventsource();
				while let Some(event) = events.next().await {
					match event {
						Ok(event) if event.data.trim().is_empty() => {},
						Ok(event) => match serde_json::from_str::<Value>(&event.data) {
							Ok(message) => {
								if incoming.send(message).await.is_err() {
									return;
								}
							},
							Err(e) => debug!("dropping non-JSON SSE payload: {e}"),
						},
						Err(e) => {
							debug!("mcp event stream ended: {e}");
							return;
						},
					}
				}
			});
			return Ok(());
		}
		Err(TransportError::ContentType(content_type))
	}

	async fn close(&mut self) {
		// Tell the server to drop the session; best effort.
		let Some(session_id) = self.session_id.read().clone() else {
			return;
		};
		let mut builder = self
			.client
			.raw()
			.delete(&self.url)
			.header(HEADER_SESSION_ID, session_id);
		if let Some(token) = &self.bearer {
			builder = builder.bearer_auth(token);
		}
		if let Err(e) = builder.send().await {
			debug!("mcp session delete failed: {e}");
		}
	}
}

/// Stdio transport: a child process speaking newline-delimited JSON-RPC on
/// stdout/stdin. Stderr is allowed for logs and never parsed.
pub struct StdioTransport {
	child: Child,
	outgoing: mpsc::Sender<Value>,
}

impl StdioTransport {
	pub fn spawn(command: &StdioCommand) -> Result<(Transport, mpsc::Receiver<Value>), TransportError> {
		let mut child = Command::new(&command.cmd)
			.args(&command.args)
			.envs(command.env.iter().map(|(k, v)| (k.clone(), v.clone())))
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| TransportError::Spawn(e.to_string()))?;

		let mut stdin = child
			.stdin
			.take()
			.ok_or_else(|| TransportError::Spawn("no stdin pipe".to_string()))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| TransportError::Spawn("no stdout pipe".to_string()))?;
		let stderr = child
			.stderr
			.take()
			.ok_or_else(|| TransportError::Spawn("no stderr pipe".to_string()))?;

		let (outgoing, mut outgoing_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);
		tokio::spawn(async move {
			while let Some(message) = outgoing_rx.recv().await {
				let line = match serde_json::to_string(&message) {
					Ok(json) => json,
					Err(e) => {
						warn!("failed to serialize mcp message: {e}");
						continue;
					},
				};
				if stdin.write_all(line.as_bytes()).await.is_err()
					|| stdin.write_all(b"\n").await.is_err()
				{
					warn!("failed to write to mcp server stdin");
					return;
				}
			}
		});

		let (incoming, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
		tokio::spawn(async move {
			let mut lines = BufReader::new(stdout).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				match serde_json::from_str::<Value>(&line) {
					Ok(message) => {
						if incoming.send(message).await.is_err() {
							return;
						}
					},
					// Servers that leak non-JSON to stdout are tolerated.
					Err(_) => debug!(target: "mcp stdio", "dropping non-JSON stdout line: {line}"),
				}
			}
		});

		tokio::spawn(async move {
			let mut lines = BufReader::new(stderr).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				debug!(target: "mcp stderr", "{line}");
			}
		});

		Ok((
			Transport::Stdio(StdioTransport { child, outgoing }),
			incoming_rx,
		))
	}

	async fn send(&self, message: &Value) -> Result<(), TransportError> {
		self
			.outgoing
			.send(message.clone())
			.await
			.map_err(|_| TransportError::Closed)
	}

	async fn close(&mut self) {
		// The session has already written the shutdown request and waited.
		if let Err(e) = self.child.start_kill() {
			debug!("mcp server already exited: {e}");
		}
		let _ = self.child.wait().await;
	}
}
