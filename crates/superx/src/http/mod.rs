pub mod card;
pub mod rpc;
pub mod sse;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::Gateway;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct App {
	pub gateway: Arc<Gateway>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
	Router::new()
		.route("/rpc", post(rpc::handle_rpc))
		.route("/agents/{id}", post(rpc::handle_agent_rpc))
		.route(
			"/agents/{id}/.well-known/agent-card.json",
			get(card::handle_agent_card),
		)
		.route("/health", get(health))
		.route("/cluster", get(cluster))
		.layer(CorsLayer::permissive())
		.with_state(App { gateway })
}

async fn health(State(app): State<App>) -> Json<serde_json::Value> {
	Json(json!({
		"status": "ok",
		"version": env!("CARGO_PKG_VERSION"),
		"agents": app.gateway.agents.len(),
	}))
}

/// Single-node deployment: the cluster is always just us. Workers are keyed
/// by agent id and all live here.
async fn cluster(State(app): State<App>) -> Json<serde_json::Value> {
	Json(json!({
		"nodes": [{
			"name": "local",
			"self": true,
			"agents": app.gateway.agents.ids(),
		}],
	}))
}
