use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = "2.0";

/// Standard and application error codes surfaced to clients.
pub mod code {
	pub const PARSE_ERROR: i64 = -32700;
	pub const INVALID_REQUEST: i64 = -32600;
	pub const METHOD_NOT_FOUND: i64 = -32601;
	pub const INVALID_PARAMS: i64 = -32602;
	pub const INTERNAL_ERROR: i64 = -32603;

	pub const AGENT_NOT_FOUND: i64 = -32001;
	pub const CIRCUIT_OPEN: i64 = -32002;
	pub const AGENT_OVERLOADED: i64 = -32003;
	pub const TASK_NOT_FOUND: i64 = -32004;
	pub const RESOURCE_NOT_FOUND: i64 = -32010;
	pub const TIMEOUT: i64 = -32098;
	pub const REMOTE_ERROR: i64 = -32099;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	pub jsonrpc: String,
	/// Notifications carry no id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<Value>,
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

impl Request {
	pub fn new(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
		Self {
			jsonrpc: VERSION.to_string(),
			id: Some(id),
			method: method.into(),
			params,
		}
	}

	pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
		Self {
			jsonrpc: VERSION.to_string(),
			id: None,
			method: method.into(),
			params,
		}
	}

	pub fn is_notification(&self) -> bool {
		self.id.is_none()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub jsonrpc: String,
	pub id: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<RpcError>,
}

impl Response {
	pub fn ok(id: Value, result: Value) -> Self {
		Self {
			jsonrpc: VERSION.to_string(),
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn error(id: Value, error: RpcError) -> Self {
		Self {
			jsonrpc: VERSION.to_string(),
			id,
			result: None,
			error: Some(error),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
	pub code: i64,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl RpcError {
	pub fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			data: None,
		}
	}

	pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
		Self {
			code,
			message: message.into(),
			data: Some(data),
		}
	}

	/// Best-effort conversion of an upstream error body into a structured error.
	/// Remote peers do not always send well-formed error objects.
	pub fn from_value(v: Value) -> Self {
		match serde_json::from_value::<RpcError>(v.clone()) {
			Ok(e) => e,
			Err(_) => RpcError::with_data(code::REMOTE_ERROR, "remote error", v),
		}
	}
}

impl std::fmt::Display for RpcError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} ({})", self.message, self.code)
	}
}
