use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::{Config, Gateway};

async fn start_gateway(config: Config) -> (Arc<Gateway>, String) {
	let gateway = Gateway::new(config).unwrap();
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let router = gateway.router();
	tokio::spawn(async move {
		axum::serve(listener, router).await.unwrap();
	});
	(gateway, format!("http://{addr}"))
}

fn register(gateway: &Gateway, id: &str, url: &str) {
	gateway.agents.upsert(crate::types::agent::Agent {
		id: id.to_string(),
		url: url.to_string(),
		bearer: None,
		protocol: crate::types::agent::Protocol::A2a,
		protocol_version: None,
		metadata: json!(null),
	});
}

/// Read one SSE response to completion and return the parsed `data:` frames.
/// Keep-alive comments are skipped. Bounded by a timeout so a stream that
/// fails to terminate fails the test instead of hanging it.
async fn collect_frames(resp: reqwest::Response) -> Vec<Value> {
	assert!(
		resp
			.headers()
			.get("content-type")
			.unwrap()
			.to_str()
			.unwrap()
			.starts_with("text/event-stream")
	);
	let collect = async {
		let mut frames = Vec::new();
		let mut buf = Vec::new();
		let mut body = resp.bytes_stream();
		while let Some(chunk) = body.next().await {
			buf.extend_from_slice(&chunk.unwrap());
		}
		for line in String::from_utf8_lossy(&buf).lines() {
			if let Some(data) = line.strip_prefix("data: ") {
				frames.push(serde_json::from_str(data).unwrap());
			}
		}
		frames
	};
	tokio::time::timeout(Duration::from_secs(10), collect)
		.await
		.expect("stream must terminate")
}

#[tokio::test]
async fn stream_message_forwards_upstream_events_until_terminal() {
	let sse = concat!(
		"data: {\"jsonrpc\":\"2.0\",\"result\":{\"task\":{\"id\":\"t3\",\"status\":{\"state\":\"submitted\"}}}}\n\n",
		"data: {\"jsonrpc\":\"2.0\",\"result\":{\"statusUpdate\":{\"taskId\":\"t3\",\"status\":{\"state\":\"working\"}}}}\n\n",
		"data: {\"jsonrpc\":\"2.0\",\"result\":{\"statusUpdate\":{\"taskId\":\"t3\",\"status\":{\"state\":\"completed\"}}}}\n\n",
	);
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/stream"))
		.respond_with(
			ResponseTemplate::new(200).set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
		)
		.mount(&server)
		.await;

	let (gateway, base) = start_gateway(Config::default()).await;
	register(&gateway, "a1", &format!("{}/stream", server.uri()));

	let resp = reqwest::Client::new()
		.post(format!("{base}/rpc"))
		.json(&json!({
			"jsonrpc": "2.0",
			"id": "s1",
			"method": "message.stream",
			"params": {"agentId": "a1", "message": {"role": "user"}},
		}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status().as_u16(), 200);

	let frames = collect_frames(resp).await;
	assert!(!frames.is_empty());
	// Every frame is a JSON-RPC success envelope for our request id.
	for frame in &frames {
		assert_eq!(frame["jsonrpc"], "2.0");
		assert_eq!(frame["id"], "s1");
		assert!(frame.get("result").is_some());
	}
	assert_eq!(frames[0]["result"]["task"]["id"], "t3");
	// The stream closed because the task went terminal.
	let last = frames.last().unwrap();
	assert_eq!(last["result"]["status"]["state"], "completed");

	// The store holds the final state.
	assert_eq!(
		gateway.tasks.get("t3").unwrap().state().unwrap().as_str(),
		"completed"
	);
}

#[tokio::test]
async fn stream_error_before_init_is_a_plain_rpc_error() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(502))
		.mount(&server)
		.await;

	let (gateway, base) = start_gateway(Config::default()).await;
	register(&gateway, "a1", &server.uri());

	let resp = reqwest::Client::new()
		.post(format!("{base}/rpc"))
		.json(&json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": "message.stream",
			"params": {"agentId": "a1", "message": {}},
		}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status().as_u16(), 400);
	let body: Value = resp.json().await.unwrap();
	assert_eq!(body["error"]["code"], -32099);
}

#[tokio::test]
async fn subscribe_replays_current_state_and_follows_updates() {
	let (gateway, base) = start_gateway(Config::default()).await;
	gateway
		.tasks
		.put(json!({"id": "t5", "status": {"state": "working"}}))
		.unwrap();

	// Two subscribers, both see the same update stream in order.
	let mut readers = Vec::new();
	for _ in 0..2 {
		let resp = reqwest::Client::new()
			.post(format!("{base}/rpc"))
			.json(&json!({
				"jsonrpc": "2.0",
				"id": "sub",
				"method": "tasks.subscribe",
				"params": {"taskId": "t5"},
			}))
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status().as_u16(), 200);
		readers.push(resp);
	}
	// Let the subscriptions register before updating.
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(gateway.tasks.bus().subscriber_count("t5"), 2);

	gateway
		.tasks
		.apply_status_update(json!({"taskId": "t5", "status": {"state": "completed"}}))
		.unwrap();

	for resp in readers {
		let frames = collect_frames(resp).await;
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0]["result"]["status"]["state"], "working");
		assert_eq!(frames[1]["result"]["status"]["state"], "completed");
	}

	// Subscribers are cleaned up once their streams end.
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(gateway.tasks.bus().subscriber_count("t5"), 0);
}

#[tokio::test]
async fn subscribe_to_missing_task_is_not_found() {
	let (_, base) = start_gateway(Config::default()).await;
	let resp = reqwest::Client::new()
		.post(format!("{base}/rpc"))
		.json(&json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": "tasks.subscribe",
			"params": {"taskId": "ghost"},
		}))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status().as_u16(), 400);
	let body: Value = resp.json().await.unwrap();
	assert_eq!(body["error"]["code"], -32004);
}

#[tokio::test]
async fn subscribe_to_terminal_task_closes_after_replay() {
	let (gateway, base) = start_gateway(Config::default()).await;
	gateway
		.tasks
		.put(json!({"id": "t6", "status": {"state": "completed"}}))
		.unwrap();

	let resp = reqwest::Client::new()
		.post(format!("{base}/rpc"))
		.json(&json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": "tasks.subscribe",
			"params": {"taskId": "t6"},
		}))
		.send()
		.await
		.unwrap();
	let frames = collect_frames(resp).await;
	assert_eq!(frames.len(), 1);
	assert_eq!(frames[0]["result"]["status"]["state"], "completed");
}

#[tokio::test]
async fn task_deletion_halts_open_subscriptions() {
	let (gateway, base) = start_gateway(Config::default()).await;
	gateway
		.tasks
		.put(json!({"id": "t7", "status": {"state": "working"}}))
		.unwrap();

	let resp = reqwest::Client::new()
		.post(format!("{base}/rpc"))
		.json(&json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": "tasks.subscribe",
			"params": {"taskId": "t7"},
		}))
		.send()
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	gateway.tasks.delete("t7");
	let frames = collect_frames(resp).await;
	// Only the replay frame; the halt closes the stream without a frame.
	assert_eq!(frames.len(), 1);
}
