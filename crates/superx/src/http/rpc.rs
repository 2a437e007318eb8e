use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::warn;

use super::{App, sse};
use crate::jsonrpc::{self, Request, RpcError, code};
use crate::mcp::SessionError;
use crate::protocol::{ADAPTERS, AdapterError, Method, default_adapter};
use crate::push::PushConfig;
use crate::types::agent::{Agent, Protocol};
use crate::types::envelope::Envelope;
use crate::worker::CallError;

/// `POST /rpc`: dot-style method names, no agent context until params name one.
pub async fn handle_rpc(State(app): State<App>, body: Bytes) -> Response {
	let req = match decode_request(&body) {
		Ok(req) => req,
		Err(resp) => return resp,
	};
	let rpc_id = req.id.clone().unwrap_or(Value::Null);
	match intake_method(&req.method) {
		Some(IntakeOp::Agents(op)) => handle_agents_op(&app, op, req.params, rpc_id).await,
		Some(IntakeOp::Canonical(method)) => {
			let adapter = default_adapter();
			let wire = adapter
				.wire_method(method)
				.expect("every intake method has an A2A wire form");
			let rewired = Request {
				method: wire.to_string(),
				..req
			};
			match adapter.decode(rewired) {
				Ok(env) => dispatch_canonical(app, None, env).await,
				Err(e) => error_response(rpc_id, adapter_error(e)),
			}
		},
		// Slash and PascalCase forms also reach /rpc.
		None => match default_adapter().decode(req) {
			Ok(env) => dispatch_canonical(app, None, env).await,
			Err(e) => error_response(rpc_id, adapter_error(e)),
		},
	}
}

/// `POST /agents/{id}`: per-agent proxy speaking the agent's own protocol.
pub async fn handle_agent_rpc(
	State(app): State<App>,
	Path(id): Path<String>,
	body: Bytes,
) -> Response {
	let req = match decode_request(&body) {
		Ok(req) => req,
		Err(resp) => return resp,
	};
	let rpc_id = req.id.clone().unwrap_or(Value::Null);
	let Some(agent) = app.gateway.agents.get(&id) else {
		return error_response(rpc_id, RpcError::new(code::AGENT_NOT_FOUND, "agent not found"));
	};
	let adapter = ADAPTERS.for_agent(&agent);

	match agent.protocol {
		Protocol::Mcp => match adapter.normalize_method(&req.method) {
			Some(method) => {
				let result = app.gateway.sessions.request(&id, method, req.params).await;
				match result {
					Ok(result) => ok_response(rpc_id, result),
					Err(e) => error_response(rpc_id, session_error(e)),
				}
			},
			None => error_response(
				rpc_id,
				RpcError::new(code::METHOD_NOT_FOUND, format!("unknown method: {}", req.method)),
			),
		},
		Protocol::A2a => match adapter.decode(req.clone()) {
			Ok(mut env) => {
				env.agent_id = Some(id);
				dispatch_canonical(app, Some(agent), env).await
			},
			// Unknown methods are forwarded opaquely through the worker so the
			// agent still gets them under admission control.
			Err(AdapterError::UnknownMethod(_)) => {
				match app.gateway.workers.forward(&id, req).await {
					Ok(result) => ok_response(rpc_id, result),
					Err(e) => error_response(rpc_id, call_error(e)),
				}
			},
			Err(e) => error_response(rpc_id, adapter_error(e)),
		},
	}
}

enum AgentsOp {
	List,
	Get,
	Upsert,
	Delete,
	Health,
}

enum IntakeOp {
	Agents(AgentsOp),
	Canonical(Method),
}

fn intake_method(name: &str) -> Option<IntakeOp> {
	Some(match name {
		"agents.list" => IntakeOp::Agents(AgentsOp::List),
		"agents.get" => IntakeOp::Agents(AgentsOp::Get),
		"agents.upsert" => IntakeOp::Agents(AgentsOp::Upsert),
		"agents.delete" => IntakeOp::Agents(AgentsOp::Delete),
		"agents.health" => IntakeOp::Agents(AgentsOp::Health),
		"message.send" => IntakeOp::Canonical(Method::SendMessage),
		"message.stream" => IntakeOp::Canonical(Method::StreamMessage),
		"tasks.get" => IntakeOp::Canonical(Method::GetTask),
		"tasks.list" => IntakeOp::Canonical(Method::ListTasks),
		"tasks.cancel" => IntakeOp::Canonical(Method::CancelTask),
		"tasks.subscribe" => IntakeOp::Canonical(Method::SubscribeTask),
		"tasks.pushNotificationConfig.set" => IntakeOp::Canonical(Method::SetPushConfig),
		"tasks.pushNotificationConfig.get" => IntakeOp::Canonical(Method::GetPushConfig),
		"tasks.pushNotificationConfig.list" => IntakeOp::Canonical(Method::ListPushConfigs),
		"tasks.pushNotificationConfig.delete" => IntakeOp::Canonical(Method::DeletePushConfig),
		_ => return None,
	})
}

async fn dispatch_canonical(app: App, agent: Option<Arc<Agent>>, env: Envelope) -> Response {
	let rpc_id = env.rpc_id.clone();
	match env.method {
		Method::SendMessage | Method::CancelTask => {
			let Some(agent_id) = resolve_agent_id(&agent, &env) else {
				return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "agentId is required"));
			};
			match app.gateway.workers.call(&agent_id, env.clone()).await {
				Ok(result) => {
					persist_result(&app, &env, &result);
					ok_response(rpc_id, result)
				},
				Err(e) => error_response(rpc_id, call_error(e)),
			}
		},
		Method::StreamMessage => {
			let Some(agent_id) = resolve_agent_id(&agent, &env) else {
				return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "agentId is required"));
			};
			sse::stream_message(app, agent_id, env).await
		},
		Method::SubscribeTask => sse::subscribe_task(app, env).await,
		Method::GetTask => {
			let Some(task_id) = env.task_id else {
				return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "taskId is required"));
			};
			match app.gateway.tasks.get(&task_id) {
				Some(task) => ok_response(rpc_id, task.as_value().clone()),
				None => error_response(rpc_id, RpcError::new(code::TASK_NOT_FOUND, "task not found")),
			}
		},
		Method::ListTasks => {
			let limit = env
				.payload
				.as_ref()
				.and_then(|p| p.get("limit"))
				.and_then(Value::as_u64)
				.map(|l| l as usize);
			let tasks: Vec<Value> = app
				.gateway
				.tasks
				.list(limit)
				.iter()
				.map(|t| t.as_value().clone())
				.collect();
			ok_response(rpc_id, json!({"tasks": tasks}))
		},
		Method::SetPushConfig => {
			let Some(task_id) = env.task_id.clone() else {
				return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "taskId is required"));
			};
			let raw = env
				.payload
				.as_ref()
				.and_then(|p| p.get("pushNotificationConfig"))
				.cloned()
				.or(env.payload.clone())
				.unwrap_or(Value::Null);
			let cfg = match serde_json::from_value::<PushConfig>(raw) {
				Ok(cfg) if !cfg.url.is_empty() => cfg,
				_ => {
					return error_response(
						rpc_id,
						RpcError::new(code::INVALID_PARAMS, "push config requires a url"),
					);
				},
			};
			let stored = app.gateway.tasks.set_push_config(&task_id, cfg);
			ok_response(rpc_id, serde_json::to_value(stored).expect("config serializes"))
		},
		Method::GetPushConfig => {
			let (Some(task_id), Some(config_id)) = (env.task_id.clone(), config_id(&env)) else {
				return error_response(
					rpc_id,
					RpcError::new(code::INVALID_PARAMS, "taskId and configId are required"),
				);
			};
			match app.gateway.tasks.get_push_config(&task_id, &config_id) {
				Some(cfg) => ok_response(rpc_id, serde_json::to_value(cfg).expect("config serializes")),
				None => error_response(
					rpc_id,
					RpcError::new(code::RESOURCE_NOT_FOUND, "push config not found"),
				),
			}
		},
		Method::ListPushConfigs => {
			let Some(task_id) = env.task_id.clone() else {
				return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "taskId is required"));
			};
			let configs = app.gateway.tasks.list_push_configs(&task_id);
			ok_response(
				rpc_id,
				json!({"configs": serde_json::to_value(configs).expect("configs serialize")}),
			)
		},
		Method::DeletePushConfig => {
			let (Some(task_id), Some(config_id)) = (env.task_id.clone(), config_id(&env)) else {
				return error_response(
					rpc_id,
					RpcError::new(code::INVALID_PARAMS, "taskId and configId are required"),
				);
			};
			app.gateway.tasks.delete_push_config(&task_id, &config_id);
			ok_response(rpc_id, json!({"deleted": true}))
		},
		Method::GetAgentCard => {
			let Some(agent) = agent else {
				return error_response(
					rpc_id,
					RpcError::new(code::INVALID_PARAMS, "agent card requires an agent context"),
				);
			};
			match super::card::load_card(&app, &agent).await {
				Ok(card) => ok_response(rpc_id, card),
				Err(e) => error_response(rpc_id, e),
			}
		},
		other => error_response(
			rpc_id,
			RpcError::new(code::METHOD_NOT_FOUND, format!("unsupported method: {other:?}")),
		),
	}
}

async fn handle_agents_op(
	app: &App,
	op: AgentsOp,
	params: Option<Value>,
	rpc_id: Value,
) -> Response {
	let params = params.unwrap_or_else(|| json!({}));
	match op {
		AgentsOp::List => {
			let agents: Vec<Value> = app
				.gateway
				.agents
				.list()
				.iter()
				.map(|a| serde_json::to_value(a.as_ref()).expect("agent serializes"))
				.collect();
			ok_response(rpc_id, json!({"agents": agents}))
		},
		AgentsOp::Get => {
			let Some(id) = params.get("id").and_then(Value::as_str) else {
				return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "id is required"));
			};
			match app.gateway.agents.get(id) {
				Some(agent) => ok_response(
					rpc_id,
					serde_json::to_value(agent.as_ref()).expect("agent serializes"),
				),
				None => error_response(rpc_id, RpcError::new(code::AGENT_NOT_FOUND, "agent not found")),
			}
		},
		AgentsOp::Upsert => {
			let Some(raw) = params.get("agent").cloned() else {
				return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "agent is required"));
			};
			let agent = match serde_json::from_value::<Agent>(raw) {
				Ok(agent) if !agent.id.is_empty() && !agent.url.is_empty() => agent,
				Ok(_) => {
					return error_response(
						rpc_id,
						RpcError::new(code::INVALID_PARAMS, "agent requires id and url"),
					);
				},
				Err(e) => {
					return error_response(
						rpc_id,
						RpcError::new(code::INVALID_PARAMS, format!("invalid agent: {e}")),
					);
				},
			};
			let stored = app.gateway.agents.upsert(agent);
			ok_response(
				rpc_id,
				serde_json::to_value(stored.as_ref()).expect("agent serializes"),
			)
		},
		AgentsOp::Delete => {
			let Some(id) = params.get("id").and_then(Value::as_str) else {
				return error_response(rpc_id, RpcError::new(code::INVALID_PARAMS, "id is required"));
			};
			let removed = app.gateway.agents.delete(id).is_some();
			app.gateway.workers.remove(id);
			app.gateway.sessions.remove(id);
			ok_response(rpc_id, json!({"deleted": removed}))
		},
		AgentsOp::Health => match params.get("id").and_then(Value::as_str) {
			Some(id) => match app.gateway.workers.health(id).await {
				Ok(snapshot) => ok_response(
					rpc_id,
					serde_json::to_value(snapshot).expect("snapshot serializes"),
				),
				Err(e) => error_response(rpc_id, call_error(e)),
			},
			None => {
				let all = app.gateway.workers.health_all().await;
				ok_response(
					rpc_id,
					json!({"agents": serde_json::to_value(all).expect("snapshots serialize")}),
				)
			},
		},
	}
}

fn resolve_agent_id(agent: &Option<Arc<Agent>>, env: &Envelope) -> Option<String> {
	agent
		.as_ref()
		.map(|a| a.id.clone())
		.or_else(|| env.agent_id.clone())
}

fn config_id(env: &Envelope) -> Option<String> {
	let payload = env.payload.as_ref()?;
	payload
		.get("configId")
		.or_else(|| payload.get("pushNotificationConfigId"))
		.and_then(Value::as_str)
		.map(str::to_string)
}

/// Store the upstream result when it is a task, wiring up any per-request
/// webhook first so later updates reach it.
fn persist_result(app: &App, env: &Envelope, result: &Value) {
	let Some(task_id) = result.get("id").and_then(Value::as_str) else {
		return;
	};
	if let Some(webhook) = &env.webhook {
		app.gateway.tasks.register_webhook(task_id, webhook);
	}
	if let Err(e) = app.gateway.tasks.put(result.clone()) {
		warn!(task = %task_id, "upstream task result not persisted: {e}");
	}
}

fn decode_request(body: &[u8]) -> Result<Request, Response> {
	let raw: Value = serde_json::from_slice(body)
		.map_err(|_| error_response(Value::Null, RpcError::new(code::PARSE_ERROR, "parse error")))?;
	let id = raw.get("id").cloned().unwrap_or(Value::Null);
	let req: Request = serde_json::from_value(raw)
		.map_err(|_| error_response(id.clone(), RpcError::new(code::INVALID_REQUEST, "invalid request")))?;
	if req.jsonrpc != jsonrpc::VERSION {
		return Err(error_response(
			id,
			RpcError::new(code::INVALID_REQUEST, "jsonrpc must be \"2.0\""),
		));
	}
	Ok(req)
}

pub(crate) fn ok_response(id: Value, result: Value) -> Response {
	(StatusCode::OK, Json(jsonrpc::Response::ok(id, result))).into_response()
}

/// All RPC errors are HTTP 400 with a JSON-RPC error body.
pub(crate) fn error_response(id: Value, error: RpcError) -> Response {
	(StatusCode::BAD_REQUEST, Json(jsonrpc::Response::error(id, error))).into_response()
}

pub(crate) fn call_error(e: CallError) -> RpcError {
	match e {
		CallError::AgentNotFound => RpcError::new(code::AGENT_NOT_FOUND, "agent not found"),
		CallError::CircuitOpen => RpcError::new(code::CIRCUIT_OPEN, "circuit open"),
		CallError::Overloaded => RpcError::new(code::AGENT_OVERLOADED, "too many in-flight requests"),
		CallError::Timeout => RpcError::new(code::TIMEOUT, "upstream call timed out"),
		CallError::Status(s) => RpcError::new(code::REMOTE_ERROR, format!("upstream status {s}")),
		CallError::Transport(e) => RpcError::new(code::REMOTE_ERROR, e),
		// The upstream's own error passes through untouched.
		CallError::Remote(e) => e,
		CallError::Encode(e) => adapter_error(e),
		CallError::Unavailable => RpcError::new(code::INTERNAL_ERROR, "worker unavailable"),
	}
}

pub(crate) fn session_error(e: SessionError) -> RpcError {
	match e {
		SessionError::AgentNotFound => RpcError::new(code::AGENT_NOT_FOUND, "agent not found"),
		SessionError::NotReady(state) => RpcError::new(
			code::INTERNAL_ERROR,
			format!("mcp session not ready ({state:?})"),
		),
		SessionError::Closed => RpcError::new(code::INTERNAL_ERROR, "mcp session closed"),
		SessionError::Timeout => RpcError::new(code::TIMEOUT, "mcp request timed out"),
		SessionError::Remote(e) => e,
		SessionError::Transport(e) => RpcError::new(code::REMOTE_ERROR, e),
		SessionError::Unsupported(m) => {
			RpcError::new(code::METHOD_NOT_FOUND, format!("unsupported method: {m:?}"))
		},
	}
}

pub(crate) fn adapter_error(e: AdapterError) -> RpcError {
	match e {
		AdapterError::UnknownMethod(m) => {
			RpcError::new(code::METHOD_NOT_FOUND, format!("unknown method: {m}"))
		},
		AdapterError::NoWireForm(m, p) => {
			RpcError::new(code::METHOD_NOT_FOUND, format!("{m:?} has no {p} wire form"))
		},
		AdapterError::InvalidParams(m) => RpcError::new(code::INVALID_PARAMS, m),
	}
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
