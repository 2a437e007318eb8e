use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use super::App;
use crate::client::HttpError;
use crate::jsonrpc::{RpcError, code};
use crate::mcp::SessionError;
use crate::protocol::ADAPTERS;
use crate::types::agent::{Agent, Protocol};

#[derive(Debug)]
pub(crate) enum CardError {
	NotFound,
	NotReady,
	Timeout,
	Upstream(String),
	Invalid,
}

/// `GET /agents/{id}/.well-known/agent-card.json`. A2A cards come from the
/// cache or the remote well-known path and get their `url` rewritten to point
/// back at the gateway; MCP cards are synthesized from the live session.
pub async fn handle_agent_card(
	State(app): State<App>,
	Path(id): Path<String>,
	headers: HeaderMap,
) -> Response {
	let Some(agent) = app.gateway.agents.get(&id) else {
		return (
			StatusCode::NOT_FOUND,
			Json(json!({"error": "agent not found"})),
		)
			.into_response();
	};
	match fetch(&app, &agent).await {
		Ok(mut card) => {
			if agent.protocol == Protocol::A2a
				&& let Some(card) = card.as_object_mut()
			{
				// Clients calling this card reach the agent through us.
				card.insert("url".to_string(), json!(gateway_url(&headers, &id)));
			}
			(StatusCode::OK, Json(card)).into_response()
		},
		Err(CardError::NotFound) => (
			StatusCode::NOT_FOUND,
			Json(json!({"error": "agent not found"})),
		)
			.into_response(),
		Err(CardError::NotReady) => (
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({"error": "mcp session not ready"})),
		)
			.into_response(),
		Err(CardError::Timeout) => (
			StatusCode::GATEWAY_TIMEOUT,
			Json(json!({"error": "upstream timed out"})),
		)
			.into_response(),
		Err(CardError::Upstream(e)) => {
			(StatusCode::BAD_GATEWAY, Json(json!({"error": e}))).into_response()
		},
		Err(CardError::Invalid) => (
			StatusCode::BAD_GATEWAY,
			Json(json!({"error": "upstream served an invalid agent card"})),
		)
			.into_response(),
	}
}

/// Card lookup for the RPC surface, where failures become JSON-RPC errors.
pub(crate) async fn load_card(app: &App, agent: &Agent) -> Result<Value, RpcError> {
	fetch(app, agent).await.map_err(|e| match e {
		CardError::NotFound => RpcError::new(code::AGENT_NOT_FOUND, "agent not found"),
		CardError::NotReady => RpcError::new(code::INTERNAL_ERROR, "mcp session not ready"),
		CardError::Timeout => RpcError::new(code::TIMEOUT, "upstream timed out"),
		CardError::Upstream(e) => RpcError::new(code::REMOTE_ERROR, e),
		CardError::Invalid => {
			RpcError::new(code::REMOTE_ERROR, "upstream served an invalid agent card")
		},
	})
}

async fn fetch(app: &App, agent: &Agent) -> Result<Value, CardError> {
	match agent.protocol {
		Protocol::Mcp => app.gateway.sessions.card(&agent.id).await.map_err(|e| match e {
			SessionError::AgentNotFound => CardError::NotFound,
			SessionError::NotReady(_) | SessionError::Closed => CardError::NotReady,
			SessionError::Timeout => CardError::Timeout,
			other => CardError::Upstream(other.to_string()),
		}),
		Protocol::A2a => {
			let adapter = ADAPTERS.for_agent(agent);
			if let Some(cached) = agent.cached_card()
				&& adapter.valid_card(cached)
			{
				return Ok(adapter.normalize_agent_card(cached.clone()));
			}
			let url = adapter.resolve_card_url(agent).ok_or(CardError::Invalid)?;
			let timeout = app.gateway.config.worker.call_timeout;
			match app
				.gateway
				.client
				.fetch_json(&url, agent.bearer.as_deref(), timeout)
				.await
			{
				Ok(card) if adapter.valid_card(&card) => Ok(adapter.normalize_agent_card(card)),
				Ok(_) => Err(CardError::Invalid),
				Err(HttpError::Timeout) => Err(CardError::Timeout),
				Err(e) => Err(CardError::Upstream(e.to_string())),
			}
		},
	}
}

fn gateway_url(headers: &HeaderMap, agent_id: &str) -> String {
	let host = headers
		.get(header::HOST)
		.and_then(|h| h.to_str().ok())
		.unwrap_or("localhost");
	format!("http://{host}/agents/{agent_id}")
}
