use serde_json::Value;

use crate::protocol::Method;
use crate::types::agent::Protocol;

/// Protocol-independent representation of one RPC call. Built by request
/// intake, carried by value into the worker or session that executes it.
#[derive(Debug, Clone)]
pub struct Envelope {
	pub protocol: Protocol,
	pub version: String,
	pub method: Method,
	pub task_id: Option<String>,
	pub context_id: Option<String>,
	pub message: Option<Value>,
	/// Full decoded params, pass-through for methods the gateway does not model.
	pub payload: Option<Value>,
	pub metadata: Option<Value>,
	pub agent_id: Option<String>,
	pub rpc_id: Value,
	/// Per-request webhook URL lifted out of `metadata.webhook`.
	pub webhook: Option<String>,
}

impl Envelope {
	pub fn new(protocol: Protocol, version: impl Into<String>, method: Method, rpc_id: Value) -> Self {
		Self {
			protocol,
			version: version.into(),
			method,
			task_id: None,
			context_id: None,
			message: None,
			payload: None,
			metadata: None,
			agent_id: None,
			rpc_id,
			webhook: None,
		}
	}

	pub fn streaming(&self) -> bool {
		self.method.streaming()
	}
}
