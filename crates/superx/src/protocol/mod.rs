pub mod a2a;
pub mod mcp;

use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::jsonrpc;
use crate::types::agent::{Agent, Protocol};
use crate::types::envelope::Envelope;

/// Canonical method names, stable across protocols and protocol versions.
/// Wire names are mapped in and out by the per-version adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
	// Task protocol (A2A and local task ops)
	SendMessage,
	StreamMessage,
	GetTask,
	ListTasks,
	CancelTask,
	SubscribeTask,
	SetPushConfig,
	GetPushConfig,
	ListPushConfigs,
	DeletePushConfig,
	GetAgentCard,
	// MCP lifecycle
	Initialize,
	Initialized,
	Ping,
	Shutdown,
	// MCP tools
	ListTools,
	CallTool,
	ToolsChanged,
	// MCP resources
	ListResources,
	ListResourceTemplates,
	ReadResource,
	SubscribeResource,
	UnsubscribeResource,
	ResourcesChanged,
	ResourceUpdated,
	// MCP prompts
	ListPrompts,
	GetPrompt,
	PromptsChanged,
	// MCP server -> client
	CreateMessage,
	CreateElicitation,
	ListRoots,
	RootsChanged,
	// MCP misc
	SetLogLevel,
	LogMessage,
	Progress,
	Cancelled,
}

impl Method {
	/// True iff the response to this method is a stream of events.
	pub fn streaming(&self) -> bool {
		matches!(self, Method::StreamMessage | Method::SubscribeTask)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
	#[error("unknown method: {0}")]
	UnknownMethod(String),
	#[error("method {0:?} has no wire form in {1}")]
	NoWireForm(Method, &'static str),
	#[error("invalid params: {0}")]
	InvalidParams(&'static str),
}

/// Outcome of decoding one SSE line from an upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventBody {
	/// The `result` of a successful event.
	Ok(Value),
	/// The `error` body of a failed event.
	Err(Value),
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("undecodable stream event")]
pub struct StreamDecodeError;

/// One protocol version's translation capability set. Implementations are
/// stateless; the registry hands out shared instances.
pub trait ProtocolAdapter: Send + Sync + std::fmt::Debug {
	fn protocol(&self) -> Protocol;
	fn version(&self) -> &'static str;

	/// Map a wire method name to its canonical method.
	fn normalize_method(&self, wire: &str) -> Option<Method>;
	/// Map a canonical method to the wire name this version emits.
	fn wire_method(&self, method: Method) -> Option<&'static str>;

	/// Build the outbound JSON-RPC request for an envelope.
	fn encode(&self, env: &Envelope) -> Result<jsonrpc::Request, AdapterError>;
	/// Normalize an inbound JSON-RPC request into an envelope.
	fn decode(&self, req: jsonrpc::Request) -> Result<Envelope, AdapterError>;

	/// Parse one SSE event line (with or without its `data: ` prefix).
	fn decode_stream_event(&self, line: &str) -> Result<StreamEventBody, StreamDecodeError> {
		let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")).unwrap_or(line);
		let v: Value = serde_json::from_str(data.trim()).map_err(|_| StreamDecodeError)?;
		if let Some(result) = v.get("result") {
			return Ok(StreamEventBody::Ok(result.clone()));
		}
		if let Some(error) = v.get("error") {
			return Ok(StreamEventBody::Err(error.clone()));
		}
		// MCP-style notification frame.
		if v.get("method").is_some() {
			return Ok(StreamEventBody::Ok(v.get("params").cloned().unwrap_or(Value::Null)));
		}
		Err(StreamDecodeError)
	}

	/// Path agents serve their card document under, when the protocol has one.
	fn well_known_path(&self) -> Option<&'static str> {
		None
	}

	/// Where to fetch the card for this agent, when the protocol has one.
	fn resolve_card_url(&self, _agent: &Agent) -> Option<String> {
		None
	}

	/// Fill protocol defaults into a card document.
	fn normalize_agent_card(&self, card: Value) -> Value {
		card
	}

	fn valid_card(&self, _card: &Value) -> bool {
		false
	}
}

/// Static table of registered adapters. Lookup falls back to the latest
/// registered version for the protocol; unknown protocols default to A2A.
/// Adding a protocol version adds an entry here, never a branch at call sites.
#[derive(Debug)]
pub struct AdapterRegistry {
	entries: Vec<Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
	fn new() -> Self {
		Self {
			entries: vec![
				Arc::new(a2a::A2aAdapter::V0_3_0) as Arc<dyn ProtocolAdapter>,
				Arc::new(mcp::McpAdapter::V2025_06_18) as Arc<dyn ProtocolAdapter>,
			],
		}
	}

	pub fn lookup(&self, protocol: Protocol, version: Option<&str>) -> Arc<dyn ProtocolAdapter> {
		if let Some(version) = version
			&& let Some(exact) = self
				.entries
				.iter()
				.find(|a| a.protocol() == protocol && a.version() == version)
		{
			return exact.clone();
		}
		// Latest registered adapter for the protocol; entries are ordered
		// oldest-first per protocol.
		self
			.entries
			.iter()
			.rev()
			.find(|a| a.protocol() == protocol)
			.cloned()
			.unwrap_or_else(|| self.for_agent_default())
	}

	pub fn for_agent(&self, agent: &Agent) -> Arc<dyn ProtocolAdapter> {
		self.lookup(agent.protocol, agent.protocol_version.as_deref())
	}

	fn for_agent_default(&self) -> Arc<dyn ProtocolAdapter> {
		self
			.entries
			.iter()
			.rev()
			.find(|a| a.protocol() == Protocol::A2a)
			.cloned()
			.expect("A2A adapter is always registered")
	}
}

pub static ADAPTERS: Lazy<AdapterRegistry> = Lazy::new(AdapterRegistry::new);

/// The default adapter used at `/rpc`, where no agent context exists yet.
pub fn default_adapter() -> Arc<dyn ProtocolAdapter> {
	ADAPTERS.lookup(Protocol::A2a, Some(a2a::VERSION))
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
