use serde_json::{Map, Value, json};

use super::{AdapterError, Method, ProtocolAdapter};
use crate::jsonrpc;
use crate::types::agent::Protocol;
use crate::types::envelope::Envelope;

pub const VERSION: &str = "2025-06-18";

/// MCP protocol adapter. Notification methods get the `notifications/` prefix
/// and are encoded without an id; everything else is a request.
#[derive(Debug, Clone, Copy)]
pub enum McpAdapter {
	V2025_06_18,
}

fn normalize(wire: &str) -> Option<Method> {
	Some(match wire {
		"initialize" => Method::Initialize,
		"notifications/initialized" => Method::Initialized,
		"ping" => Method::Ping,
		"shutdown" => Method::Shutdown,
		"tools/list" => Method::ListTools,
		"tools/call" => Method::CallTool,
		"notifications/tools/list_changed" => Method::ToolsChanged,
		"resources/list" => Method::ListResources,
		"resources/templates/list" => Method::ListResourceTemplates,
		"resources/read" => Method::ReadResource,
		"resources/subscribe" => Method::SubscribeResource,
		"resources/unsubscribe" => Method::UnsubscribeResource,
		"notifications/resources/list_changed" => Method::ResourcesChanged,
		"notifications/resources/updated" => Method::ResourceUpdated,
		"prompts/list" => Method::ListPrompts,
		"prompts/get" => Method::GetPrompt,
		"notifications/prompts/list_changed" => Method::PromptsChanged,
		"sampling/createMessage" => Method::CreateMessage,
		"elicitation/create" => Method::CreateElicitation,
		"roots/list" => Method::ListRoots,
		"notifications/roots/list_changed" => Method::RootsChanged,
		"logging/setLevel" => Method::SetLogLevel,
		"notifications/message" => Method::LogMessage,
		"notifications/progress" => Method::Progress,
		"notifications/cancelled" => Method::Cancelled,
		_ => return None,
	})
}

fn wire(method: Method) -> Option<&'static str> {
	Some(match method {
		Method::Initialize => "initialize",
		Method::Initialized => "notifications/initialized",
		Method::Ping => "ping",
		Method::Shutdown => "shutdown",
		Method::ListTools => "tools/list",
		Method::CallTool => "tools/call",
		Method::ToolsChanged => "notifications/tools/list_changed",
		Method::ListResources => "resources/list",
		Method::ListResourceTemplates => "resources/templates/list",
		Method::ReadResource => "resources/read",
		Method::SubscribeResource => "resources/subscribe",
		Method::UnsubscribeResource => "resources/unsubscribe",
		Method::ResourcesChanged => "notifications/resources/list_changed",
		Method::ResourceUpdated => "notifications/resources/updated",
		Method::ListPrompts => "prompts/list",
		Method::GetPrompt => "prompts/get",
		Method::PromptsChanged => "notifications/prompts/list_changed",
		Method::CreateMessage => "sampling/createMessage",
		Method::CreateElicitation => "elicitation/create",
		Method::ListRoots => "roots/list",
		Method::RootsChanged => "notifications/roots/list_changed",
		Method::SetLogLevel => "logging/setLevel",
		Method::LogMessage => "notifications/message",
		Method::Progress => "notifications/progress",
		Method::Cancelled => "notifications/cancelled",
		_ => return None,
	})
}

/// Methods delivered as notifications, without an id.
pub fn is_notification(method: Method) -> bool {
	matches!(
		method,
		Method::Initialized
			| Method::ToolsChanged
			| Method::ResourcesChanged
			| Method::ResourceUpdated
			| Method::PromptsChanged
			| Method::RootsChanged
			| Method::LogMessage
			| Method::Progress
			| Method::Cancelled
	)
}

/// Requests a server may originate toward the client. These are dispatched to
/// a client-side handler that must answer with the same id.
pub fn is_server_request(method: Method) -> bool {
	matches!(
		method,
		Method::CreateMessage | Method::CreateElicitation | Method::ListRoots
	)
}

impl ProtocolAdapter for McpAdapter {
	fn protocol(&self) -> Protocol {
		Protocol::Mcp
	}

	fn version(&self) -> &'static str {
		VERSION
	}

	fn normalize_method(&self, wire: &str) -> Option<Method> {
		normalize(wire)
	}

	fn wire_method(&self, method: Method) -> Option<&'static str> {
		wire(method)
	}

	fn encode(&self, env: &Envelope) -> Result<jsonrpc::Request, AdapterError> {
		let method =
			wire(env.method).ok_or(AdapterError::NoWireForm(env.method, "mcp"))?;
		let params = match &env.payload {
			Some(Value::Object(m)) => {
				let mut m = m.clone();
				if let Some(meta) = &env.metadata {
					m.insert("_meta".to_string(), meta.clone());
				}
				Some(Value::Object(m))
			},
			Some(other) => Some(other.clone()),
			None => default_params(env.method),
		};
		if is_notification(env.method) {
			return Ok(jsonrpc::Request::notification(method, params));
		}
		Ok(jsonrpc::Request::new(env.rpc_id.clone(), method, params))
	}

	fn decode(&self, req: jsonrpc::Request) -> Result<Envelope, AdapterError> {
		let method =
			normalize(&req.method).ok_or_else(|| AdapterError::UnknownMethod(req.method.clone()))?;
		let mut env = Envelope::new(
			Protocol::Mcp,
			VERSION,
			method,
			req.id.unwrap_or(Value::Null),
		);
		if let Some(params) = &req.params {
			env.metadata = params.get("_meta").cloned();
		}
		env.payload = req.params;
		Ok(env)
	}
}

/// Params some servers require to be present even when empty.
fn default_params(method: Method) -> Option<Value> {
	match method {
		Method::Initialize => Some(json!({
			"protocolVersion": VERSION,
			"capabilities": {},
			"clientInfo": {"name": "superx", "version": env!("CARGO_PKG_VERSION")},
		})),
		Method::ListTools
		| Method::ListResources
		| Method::ListResourceTemplates
		| Method::ListPrompts => Some(json!({})),
		_ => None,
	}
}

/// Build a result map keyed per request, used by the client-side handler for
/// server-originated requests the gateway can answer on its own.
pub fn server_request_response(method: Method, id: Value) -> jsonrpc::Response {
	match method {
		// The gateway exposes no filesystem roots.
		Method::ListRoots => jsonrpc::Response::ok(id, json!({"roots": []})),
		// No interactive user to sample or elicit from.
		_ => jsonrpc::Response::error(
			id,
			jsonrpc::RpcError::new(
				jsonrpc::code::METHOD_NOT_FOUND,
				"not supported by this client",
			),
		),
	}
}

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod tests;
