use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{Level, event, warn};

use crate::client::{Client, HttpError};
use crate::jsonrpc::{self, RpcError};
use crate::protocol::{ADAPTERS, AdapterError};
use crate::store::{AgentStore, TaskStore};
use crate::stream::{self, StreamEvent, StreamOutcome, StreamRequest};
use crate::types::envelope::Envelope;

const MAILBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub max_in_flight: usize,
	pub failure_threshold: u32,
	#[serde(skip)]
	pub failure_window: Duration,
	#[serde(skip)]
	pub cooldown: Duration,
	#[serde(skip)]
	pub call_timeout: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			max_in_flight: 10,
			failure_threshold: 5,
			failure_window: Duration::from_secs(30),
			cooldown: Duration::from_secs(30),
			call_timeout: Duration::from_secs(15),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
	pub agent_id: String,
	pub breaker: BreakerState,
	pub in_flight: usize,
	pub max_in_flight: usize,
	pub failure_count: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_failure_ago_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
	#[error("agent not found")]
	AgentNotFound,
	#[error("circuit open")]
	CircuitOpen,
	#[error("too many in-flight requests")]
	Overloaded,
	#[error("upstream call timed out")]
	Timeout,
	#[error("upstream status {0}")]
	Status(u16),
	#[error("transport error: {0}")]
	Transport(String),
	#[error("remote error: {0}")]
	Remote(RpcError),
	#[error(transparent)]
	Encode(#[from] AdapterError),
	#[error("worker unavailable")]
	Unavailable,
}

/// How one completed call is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
	Success,
	/// Upstream 4xx: surfaced to the caller, never counted by the breaker.
	ClientError,
	Failure,
}

enum Msg {
	Call {
		env: Envelope,
		respond: oneshot::Sender<Result<Value, CallError>>,
	},
	/// A pre-encoded request forwarded opaquely, bypassing the adapter.
	Forward {
		request: jsonrpc::Request,
		respond: oneshot::Sender<Result<Value, CallError>>,
	},
	Stream {
		env: Envelope,
		reply_to: mpsc::Sender<StreamEvent>,
		respond: oneshot::Sender<Result<(), CallError>>,
	},
	Done {
		outcome: Outcome,
	},
	Health {
		respond: oneshot::Sender<HealthSnapshot>,
	},
	Shutdown,
}

/// One supervised worker per agent id. The actor owns the in-flight counter
/// and breaker state, so admission decisions are linearizable; the outbound
/// I/O itself runs in spawned tasks that report completion back through the
/// mailbox.
struct Worker {
	agent_id: String,
	cfg: Config,
	agents: Arc<AgentStore>,
	tasks: Arc<TaskStore>,
	client: Client,
	tx: mpsc::Sender<Msg>,

	in_flight: usize,
	breaker: BreakerState,
	failure_count: u32,
	window_start: Option<Instant>,
	cooldown_until: Option<Instant>,
	last_failure: Option<Instant>,
	/// In half-open, only a single probe call may be outstanding.
	half_open_probe: bool,
	streams: Vec<stream::StreamHandle>,
}

impl Worker {
	async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
		while let Some(msg) = rx.recv().await {
			self.streams.retain(|s| !s.is_finished());
			match msg {
				Msg::Call { env, respond } => self.handle_call(env, respond),
				Msg::Forward { request, respond } => self.handle_forward(request, respond),
				Msg::Stream {
					env,
					reply_to,
					respond,
				} => self.handle_stream(env, reply_to, respond),
				Msg::Done { outcome } => self.on_done(outcome),
				Msg::Health { respond } => {
					let _ = respond.send(self.snapshot());
				},
				Msg::Shutdown => break,
			}
		}
		for s in self.streams.drain(..) {
			s.shutdown();
		}
	}

	/// Admission, evaluated atomically per message. Order matters: breaker
	/// first, then backpressure.
	fn admit(&mut self) -> Result<(), CallError> {
		let now = Instant::now();
		if self.breaker == BreakerState::Open {
			match self.cooldown_until {
				Some(until) if now < until => {
					self.telemetry("breaker_reject");
					return Err(CallError::CircuitOpen);
				},
				_ => {
					self.breaker = BreakerState::HalfOpen;
					self.half_open_probe = false;
					self.telemetry("breaker_half_open");
				},
			}
		}
		if self.breaker == BreakerState::HalfOpen && self.half_open_probe {
			self.telemetry("breaker_reject");
			return Err(CallError::CircuitOpen);
		}
		if self.in_flight >= self.cfg.max_in_flight {
			self.telemetry("backpressure_reject");
			return Err(CallError::Overloaded);
		}
		self.in_flight += 1;
		if self.breaker == BreakerState::HalfOpen {
			self.half_open_probe = true;
		}
		self.telemetry("call_start");
		Ok(())
	}

	fn on_done(&mut self, outcome: Outcome) {
		let now = Instant::now();
		self.in_flight = self.in_flight.saturating_sub(1);
		match outcome {
			Outcome::Success => {
				if self.breaker == BreakerState::HalfOpen {
					self.breaker = BreakerState::Closed;
					self.failure_count = 0;
					self.window_start = None;
					self.half_open_probe = false;
					self.cooldown_until = None;
					self.telemetry("breaker_closed");
				}
				self.telemetry("call_stop");
			},
			Outcome::ClientError => {
				// Reported but not counted; a half-open probe may retry.
				self.half_open_probe = false;
				self.telemetry("call_error");
			},
			Outcome::Failure => {
				self.last_failure = Some(now);
				match self.window_start {
					Some(start) if now.duration_since(start) <= self.cfg.failure_window => {
						self.failure_count += 1;
					},
					_ => {
						self.window_start = Some(now);
						self.failure_count = 1;
					},
				}
				let tripped = self.failure_count >= self.cfg.failure_threshold
					&& self.breaker != BreakerState::Open;
				// A failed half-open probe re-opens immediately.
				if tripped || self.breaker == BreakerState::HalfOpen {
					self.breaker = BreakerState::Open;
					self.cooldown_until = Some(now + self.cfg.cooldown);
					self.half_open_probe = false;
					self.telemetry("breaker_open");
				}
				self.telemetry("call_error");
			},
		}
	}

	fn handle_call(&mut self, env: Envelope, respond: oneshot::Sender<Result<Value, CallError>>) {
		let Some(agent) = self.agents.get(&self.agent_id) else {
			let _ = respond.send(Err(CallError::AgentNotFound));
			return;
		};
		let adapter = ADAPTERS.for_agent(&agent);
		let request = match adapter.encode(&env) {
			Ok(r) => r,
			Err(e) => {
				let _ = respond.send(Err(e.into()));
				return;
			},
		};
		if let Err(e) = self.admit() {
			let _ = respond.send(Err(e));
			return;
		}

		let client = self.client.clone();
		let tx = self.tx.clone();
		let timeout = self.cfg.call_timeout;
		let url = agent.url.clone();
		let bearer = agent.bearer.clone();
		tokio::spawn(async move {
			let result = client.post_rpc(&url, bearer.as_deref(), &request, timeout).await;
			let (outcome, reply) = interpret(result);
			let _ = tx.send(Msg::Done { outcome }).await;
			let _ = respond.send(reply);
		});
	}

	fn handle_forward(
		&mut self,
		request: jsonrpc::Request,
		respond: oneshot::Sender<Result<Value, CallError>>,
	) {
		let Some(agent) = self.agents.get(&self.agent_id) else {
			let _ = respond.send(Err(CallError::AgentNotFound));
			return;
		};
		if let Err(e) = self.admit() {
			let _ = respond.send(Err(e));
			return;
		}
		let client = self.client.clone();
		let tx = self.tx.clone();
		let timeout = self.cfg.call_timeout;
		let url = agent.url.clone();
		let bearer = agent.bearer.clone();
		tokio::spawn(async move {
			let result = client.post_rpc(&url, bearer.as_deref(), &request, timeout).await;
			let (outcome, reply) = interpret(result);
			let _ = tx.send(Msg::Done { outcome }).await;
			let _ = respond.send(reply);
		});
	}

	fn handle_stream(
		&mut self,
		env: Envelope,
		reply_to: mpsc::Sender<StreamEvent>,
		respond: oneshot::Sender<Result<(), CallError>>,
	) {
		let Some(agent) = self.agents.get(&self.agent_id) else {
			let _ = respond.send(Err(CallError::AgentNotFound));
			return;
		};
		let adapter = ADAPTERS.for_agent(&agent);
		let request = match adapter.encode(&env) {
			Ok(r) => r,
			Err(e) => {
				let _ = respond.send(Err(e.into()));
				return;
			},
		};
		if let Err(e) = self.admit() {
			let _ = respond.send(Err(e));
			return;
		}

		let (done_tx, done_rx) = oneshot::channel();
		let handle = stream::spawn(
			self.client.clone(),
			adapter,
			self.tasks.clone(),
			StreamRequest {
				url: agent.url.clone(),
				bearer: agent.bearer.clone(),
				request,
				rpc_id: env.rpc_id.clone(),
				reply_to,
			},
			done_tx,
		);
		self.streams.push(handle);

		// The stream holds its in-flight slot until the consumer halts.
		let tx = self.tx.clone();
		tokio::spawn(async move {
			let outcome = match done_rx.await {
				Ok(StreamOutcome::Ok) => Outcome::Success,
				Ok(StreamOutcome::ClientError) => Outcome::ClientError,
				Ok(StreamOutcome::Failure) | Err(_) => Outcome::Failure,
			};
			let _ = tx.send(Msg::Done { outcome }).await;
		});
		let _ = respond.send(Ok(()));
	}

	fn snapshot(&self) -> HealthSnapshot {
		HealthSnapshot {
			agent_id: self.agent_id.clone(),
			breaker: self.breaker,
			in_flight: self.in_flight,
			max_in_flight: self.cfg.max_in_flight,
			failure_count: self.failure_count,
			last_failure_ago_ms: self
				.last_failure
				.map(|at| Instant::now().duration_since(at).as_millis() as u64),
		}
	}

	fn telemetry(&self, name: &'static str) {
		event!(
			target: "worker",
			Level::DEBUG,
			agent = %self.agent_id,
			event = name,
			breaker = ?self.breaker,
			in_flight = self.in_flight,
			failures = self.failure_count,
		);
	}
}

fn interpret(
	result: Result<jsonrpc::Response, HttpError>,
) -> (Outcome, Result<Value, CallError>) {
	match result {
		Ok(resp) => {
			if let Some(result) = resp.result {
				(Outcome::Success, Ok(result))
			} else if let Some(error) = resp.error {
				// A remote JSON-RPC error counts toward the breaker.
				(Outcome::Failure, Err(CallError::Remote(error)))
			} else {
				(
					Outcome::Failure,
					Err(CallError::Transport("response carries neither result nor error".to_string())),
				)
			}
		},
		Err(HttpError::Timeout) => (Outcome::Failure, Err(CallError::Timeout)),
		Err(HttpError::Status(s)) if (400..500).contains(&s) => {
			(Outcome::ClientError, Err(CallError::Status(s)))
		},
		Err(HttpError::Status(s)) => (Outcome::Failure, Err(CallError::Status(s))),
		Err(HttpError::Decode(e)) => (Outcome::Failure, Err(CallError::Transport(e))),
		Err(HttpError::Transport(e)) => (Outcome::Failure, Err(CallError::Transport(e))),
	}
}

/// Registry of per-agent workers. Workers spawn lazily on first use and are
/// looked up by agent id on every call, so agent upserts apply immediately.
#[derive(Clone)]
pub struct Workers {
	inner: Arc<Inner>,
}

struct Inner {
	agents: Arc<AgentStore>,
	tasks: Arc<TaskStore>,
	client: Client,
	cfg: Config,
	map: RwLock<HashMap<String, mpsc::Sender<Msg>>>,
}

impl Workers {
	pub fn new(
		agents: Arc<AgentStore>,
		tasks: Arc<TaskStore>,
		client: Client,
		cfg: Config,
	) -> Workers {
		Workers {
			inner: Arc::new(Inner {
				agents,
				tasks,
				client,
				cfg,
				map: RwLock::new(HashMap::new()),
			}),
		}
	}

	/// Synchronous call through the agent's worker.
	pub async fn call(&self, agent_id: &str, env: Envelope) -> Result<Value, CallError> {
		let handle = self.handle(agent_id)?;
		let (tx, rx) = oneshot::channel();
		handle
			.send(Msg::Call { env, respond: tx })
			.await
			.map_err(|_| CallError::Unavailable)?;
		rx.await.map_err(|_| CallError::Unavailable)?
	}

	/// Forward an already-encoded JSON-RPC request through the agent's worker,
	/// keeping admission control without interpreting the method.
	pub async fn forward(
		&self,
		agent_id: &str,
		request: jsonrpc::Request,
	) -> Result<Value, CallError> {
		let handle = self.handle(agent_id)?;
		let (tx, rx) = oneshot::channel();
		handle
			.send(Msg::Forward {
				request,
				respond: tx,
			})
			.await
			.map_err(|_| CallError::Unavailable)?;
		rx.await.map_err(|_| CallError::Unavailable)?
	}

	/// Start a streaming call; events flow to `reply_to`. Returns once the
	/// consumer is admitted and spawned.
	pub async fn stream(
		&self,
		agent_id: &str,
		env: Envelope,
		reply_to: mpsc::Sender<StreamEvent>,
	) -> Result<(), CallError> {
		let handle = self.handle(agent_id)?;
		let (tx, rx) = oneshot::channel();
		handle
			.send(Msg::Stream {
				env,
				reply_to,
				respond: tx,
			})
			.await
			.map_err(|_| CallError::Unavailable)?;
		rx.await.map_err(|_| CallError::Unavailable)?
	}

	pub async fn health(&self, agent_id: &str) -> Result<HealthSnapshot, CallError> {
		let handle = self.handle(agent_id)?;
		let (tx, rx) = oneshot::channel();
		handle
			.send(Msg::Health { respond: tx })
			.await
			.map_err(|_| CallError::Unavailable)?;
		rx.await.map_err(|_| CallError::Unavailable)
	}

	pub async fn health_all(&self) -> Vec<HealthSnapshot> {
		let mut out = Vec::new();
		for id in self.inner.agents.ids() {
			if let Ok(snapshot) = self.health(&id).await {
				out.push(snapshot);
			}
		}
		out
	}

	pub async fn in_flight(&self, agent_id: &str) -> Result<usize, CallError> {
		Ok(self.health(agent_id).await?.in_flight)
	}

	/// Stop and forget the agent's worker, ending its active streams.
	pub fn remove(&self, agent_id: &str) {
		if let Some(handle) = self.inner.map.write().remove(agent_id)
			&& handle.try_send(Msg::Shutdown).is_err()
		{
			warn!(agent = %agent_id, "worker mailbox full at shutdown; worker will exit on drop");
		}
	}

	fn handle(&self, agent_id: &str) -> Result<mpsc::Sender<Msg>, CallError> {
		if self.inner.agents.get(agent_id).is_none() {
			return Err(CallError::AgentNotFound);
		}
		if let Some(existing) = self.inner.map.read().get(agent_id)
			&& !existing.is_closed()
		{
			return Ok(existing.clone());
		}
		let mut map = self.inner.map.write();
		// Raced with another spawner; re-check under the write lock.
		if let Some(existing) = map.get(agent_id)
			&& !existing.is_closed()
		{
			return Ok(existing.clone());
		}
		let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
		let worker = Worker {
			agent_id: agent_id.to_string(),
			cfg: self.inner.cfg.clone(),
			agents: self.inner.agents.clone(),
			tasks: self.inner.tasks.clone(),
			client: self.inner.client.clone(),
			tx: tx.clone(),
			in_flight: 0,
			breaker: BreakerState::Closed,
			failure_count: 0,
			window_start: None,
			cooldown_until: None,
			last_failure: None,
			half_open_probe: false,
			streams: Vec::new(),
		};
		tokio::spawn(worker.run(rx));
		map.insert(agent_id.to_string(), tx.clone());
		Ok(tx)
	}
}

impl std::fmt::Debug for Workers {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Workers")
			.field("workers", &self.inner.map.read().len())
			.finish()
	}
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
