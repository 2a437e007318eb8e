use serde_json::{Map, Value, json};

use super::{AdapterError, Method, ProtocolAdapter};
use crate::jsonrpc;
use crate::types::agent::{Agent, Protocol};
use crate::types::envelope::Envelope;

pub const VERSION: &str = "0.3.0";
pub const WELL_KNOWN_PATH: &str = "/.well-known/agent-card.json";

/// A2A protocol adapter. Accepts both the PascalCase and the slash-form wire
/// method names seen across A2A server generations; always emits slash form.
#[derive(Debug, Clone, Copy)]
pub enum A2aAdapter {
	V0_3_0,
}

fn normalize(wire: &str) -> Option<Method> {
	Some(match wire {
		"message/send" | "SendMessage" => Method::SendMessage,
		"message/stream" | "StreamMessage" | "SendStreamingMessage" => Method::StreamMessage,
		"tasks/get" | "GetTask" => Method::GetTask,
		"tasks/list" | "ListTasks" => Method::ListTasks,
		"tasks/cancel" | "CancelTask" => Method::CancelTask,
		"tasks/subscribe" | "tasks/resubscribe" | "SubscribeTask" => Method::SubscribeTask,
		"tasks/pushNotificationConfig/set" | "SetTaskPushNotificationConfig" => Method::SetPushConfig,
		"tasks/pushNotificationConfig/get" | "GetTaskPushNotificationConfig" => Method::GetPushConfig,
		"tasks/pushNotificationConfig/list" | "ListTaskPushNotificationConfig" => {
			Method::ListPushConfigs
		},
		"tasks/pushNotificationConfig/delete" | "DeleteTaskPushNotificationConfig" => {
			Method::DeletePushConfig
		},
		"agent/card" | "agent/getAuthenticatedExtendedCard" | "GetAgentCard" => Method::GetAgentCard,
		_ => return None,
	})
}

fn wire(method: Method) -> Option<&'static str> {
	Some(match method {
		Method::SendMessage => "message/send",
		Method::StreamMessage => "message/stream",
		Method::GetTask => "tasks/get",
		Method::ListTasks => "tasks/list",
		Method::CancelTask => "tasks/cancel",
		Method::SubscribeTask => "tasks/subscribe",
		Method::SetPushConfig => "tasks/pushNotificationConfig/set",
		Method::GetPushConfig => "tasks/pushNotificationConfig/get",
		Method::ListPushConfigs => "tasks/pushNotificationConfig/list",
		Method::DeletePushConfig => "tasks/pushNotificationConfig/delete",
		Method::GetAgentCard => "agent/card",
		_ => return None,
	})
}

impl ProtocolAdapter for A2aAdapter {
	fn protocol(&self) -> Protocol {
		Protocol::A2a
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
			wire(env.method).ok_or(AdapterError::NoWireForm(env.method, "a2a"))?;
		// Start from the pass-through payload so fields the gateway does not
		// model survive the trip upstream.
		let mut params = match &env.payload {
			Some(Value::Object(m)) => m.clone(),
			_ => Map::new(),
		};
		if let Some(message) = &env.message {
			params.insert("message".to_string(), message.clone());
		}
		if let Some(task_id) = &env.task_id {
			// A2A servers historically disagree on the key; send both.
			params.insert("id".to_string(), Value::String(task_id.clone()));
			params.insert("taskId".to_string(), Value::String(task_id.clone()));
		}
		if let Some(context_id) = &env.context_id {
			params.insert("contextId".to_string(), Value::String(context_id.clone()));
		}
		if let Some(metadata) = &env.metadata {
			params.insert("metadata".to_string(), metadata.clone());
		}
		Ok(jsonrpc::Request::new(
			env.rpc_id.clone(),
			method,
			Some(Value::Object(params)),
		))
	}

	fn decode(&self, req: jsonrpc::Request) -> Result<Envelope, AdapterError> {
		let method =
			normalize(&req.method).ok_or_else(|| AdapterError::UnknownMethod(req.method.clone()))?;
		let params = req.params.unwrap_or_else(|| json!({}));
		let mut env = Envelope::new(
			Protocol::A2a,
			VERSION,
			method,
			req.id.unwrap_or(Value::Null),
		);
		env.task_id = str_field(&params, "taskId").or_else(|| str_field(&params, "id"));
		env.context_id = str_field(&params, "contextId");
		env.message = params.get("message").cloned();
		env.metadata = params.get("metadata").cloned();
		env.agent_id = str_field(&params, "agentId");
		env.webhook = env
			.metadata
			.as_ref()
			.and_then(|m| m.get("webhook"))
			.and_then(Value::as_str)
			.map(str::to_string);
		env.payload = Some(params);
		Ok(env)
	}

	fn well_known_path(&self) -> Option<&'static str> {
		Some(WELL_KNOWN_PATH)
	}

	fn resolve_card_url(&self, agent: &Agent) -> Option<String> {
		if let Some(url) = agent
			.cached_card()
			.and_then(|c| c.get("url"))
			.and_then(Value::as_str)
		{
			return Some(url.to_string());
		}
		Some(format!(
			"{}{}",
			agent.url.trim_end_matches('/'),
			WELL_KNOWN_PATH
		))
	}

	/// Fill protocol defaults into a card and drop null top-level fields.
	fn normalize_agent_card(&self, card: Value) -> Value {
		let Value::Object(card) = card else {
			return card;
		};
		let mut out: Map<String, Value> = card.into_iter().filter(|(_, v)| !v.is_null()).collect();
		out
			.entry("version".to_string())
			.or_insert_with(|| json!("1.0.0"));
		out
			.entry("protocolVersion".to_string())
			.or_insert_with(|| json!(VERSION));
		out
			.entry("defaultInputModes".to_string())
			.or_insert_with(|| json!(["text/plain"]));
		out
			.entry("defaultOutputModes".to_string())
			.or_insert_with(|| json!(["text/plain"]));
		if let Some(skills) = out.get_mut("skills").and_then(Value::as_array_mut) {
			for skill in skills.iter_mut().filter_map(Value::as_object_mut) {
				skill.entry("tags".to_string()).or_insert_with(|| json!([]));
				skill
					.entry("examples".to_string())
					.or_insert_with(|| json!([]));
			}
		}
		Value::Object(out)
	}

	fn valid_card(&self, card: &Value) -> bool {
		card
			.get("name")
			.and_then(Value::as_str)
			.is_some_and(|n| !n.is_empty())
	}
}

fn str_field(params: &Value, key: &str) -> Option<String> {
	params
		.get(key)
		.and_then(Value::as_str)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
}

#[cfg(test)]
#[path = "a2a_tests.rs"]
mod tests;
