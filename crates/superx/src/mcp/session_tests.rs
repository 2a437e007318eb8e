use serde_json::json;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};
use wiremock::matchers::method;

use super::*;
use crate::mcp::transport::HttpTransport;

/// A canned MCP server: answers by method, echoing the request id.
struct McpResponder;

impl Respond for McpResponder {
	fn respond(&self, req: &Request) -> ResponseTemplate {
		let msg: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
		let id = msg.get("id").cloned().unwrap_or(Value::Null);
		if id.is_null() {
			// Notifications are accepted without a body.
			return ResponseTemplate::new(202);
		}
		let result = match msg.get("method").and_then(Value::as_str).unwrap_or("") {
			"initialize" => json!({
				"protocolVersion": "2025-06-18",
				"capabilities": {"tools": {}, "prompts": {}},
				"serverInfo": {"name": "mock-server", "version": "1.2.3"},
			}),
			"tools/list" => json!({
				"tools": [{
					"name": "echo",
					"description": "echoes input",
					"inputSchema": {"type": "object"},
				}],
			}),
			"prompts/list" => json!({"prompts": []}),
			"tools/call" => json!({"content": [{"type": "text", "text": "echoed"}]}),
			"ping" => json!({}),
			other => {
				return ResponseTemplate::new(200).set_body_json(json!({
					"jsonrpc": "2.0",
					"id": id,
					"error": {"code": -32601, "message": format!("unknown method {other}")},
				}));
			},
		};
		ResponseTemplate::new(200).set_body_json(json!({
			"jsonrpc": "2.0",
			"id": id,
			"result": result,
		}))
	}
}

async fn ready_session(server: &MockServer) -> SessionHandle {
	let client = crate::client::Client::new(&crate::client::Config::default()).unwrap();
	let (transport, incoming) = HttpTransport::connect(client, server.uri(), None);
	let handle = Session::spawn(
		"mcp-1".to_string(),
		SessionConfig {
			request_timeout: Duration::from_secs(2),
		},
		transport,
		incoming,
	);
	// The handshake runs in the actor; wait for it to settle.
	for _ in 0..50 {
		if handle.state().await == SessionState::Ready {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	handle
}

#[tokio::test]
async fn initialize_handshake_reaches_ready_and_caches_lists() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(McpResponder)
		.mount(&server)
		.await;

	let handle = ready_session(&server).await;
	assert_eq!(handle.state().await, SessionState::Ready);

	// tools/list was eagerly issued during the handshake; a client listing
	// is served from cache without another upstream request.
	let upstream_lists = |reqs: &[Request]| {
		reqs
			.iter()
			.filter(|r| {
				serde_json::from_slice::<Value>(&r.body)
					.ok()
					.and_then(|m| m.get("method").and_then(Value::as_str).map(str::to_string))
					.as_deref() == Some("tools/list")
			})
			.count()
	};
	let before = upstream_lists(&server.received_requests().await.unwrap());
	assert_eq!(before, 1);

	let tools = handle.request(Method::ListTools, None).await.unwrap();
	assert_eq!(tools["tools"][0]["name"], "echo");
	let after = upstream_lists(&server.received_requests().await.unwrap());
	assert_eq!(after, 1, "cached listing must not hit the upstream again");
}

#[tokio::test]
async fn call_tool_round_trips() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(McpResponder)
		.mount(&server)
		.await;

	let handle = ready_session(&server).await;
	let result = handle
		.request(
			Method::CallTool,
			Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
		)
		.await
		.unwrap();
	assert_eq!(result["content"][0]["text"], "echoed");
}

#[tokio::test]
async fn remote_errors_surface_to_the_caller() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(McpResponder)
		.mount(&server)
		.await;

	let handle = ready_session(&server).await;
	match handle.request(Method::ReadResource, Some(json!({"uri": "x"}))).await {
		Err(SessionError::Remote(e)) => assert_eq!(e.code, -32601),
		other => panic!("expected remote error, got {other:?}"),
	}
}

#[tokio::test]
async fn card_is_synthesized_from_session_state() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(McpResponder)
		.mount(&server)
		.await;

	let handle = ready_session(&server).await;
	let card = handle.card().await.unwrap();
	assert_eq!(card["name"], "mcp-1");
	assert_eq!(card["protocol"], "mcp");
	assert_eq!(card["description"], "mock-server");
	assert_eq!(card["version"], "1.2.3");
	assert_eq!(card["skills"][0]["id"], "echo");
	assert_eq!(card["skills"][0]["inputSchema"]["type"], "object");
	assert_eq!(card["prompts"], json!([]));
}

#[tokio::test]
async fn failed_initialize_closes_the_session() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;

	let client = crate::client::Client::new(&crate::client::Config::default()).unwrap();
	let (transport, incoming) = HttpTransport::connect(client, server.uri(), None);
	let handle = Session::spawn(
		"mcp-dead".to_string(),
		SessionConfig {
			request_timeout: Duration::from_millis(500),
		},
		transport,
		incoming,
	);
	for _ in 0..50 {
		if handle.is_closed() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert_eq!(handle.state().await, SessionState::Closed);
	assert!(matches!(
		handle.request(Method::ListTools, None).await,
		Err(SessionError::Closed)
	));
}

#[cfg(unix)]
#[tokio::test]
async fn stdio_server_that_misbehaves_fails_initialize() {
	use crate::mcp::transport::StdioTransport;
	use crate::types::agent::StdioCommand;

	// `cat` echoes our own requests back: never a valid initialize response,
	// so the handshake must fail and the child must be released.
	let (transport, incoming) = StdioTransport::spawn(&StdioCommand {
		cmd: "cat".to_string(),
		args: vec![],
		env: vec![],
	})
	.unwrap();
	let handle = Session::spawn(
		"mcp-cat".to_string(),
		SessionConfig {
			request_timeout: Duration::from_millis(500),
		},
		transport,
		incoming,
	);
	for _ in 0..100 {
		if handle.is_closed() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert!(handle.is_closed());
}
