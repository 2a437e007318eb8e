use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::protocol::Method;
use crate::push::{Policy, PushNotifier};
use crate::store::SubscriptionBus;
use crate::types::agent::{Agent, Protocol};

fn test_config() -> Config {
	Config {
		max_in_flight: 10,
		failure_threshold: 3,
		failure_window: Duration::from_secs(30),
		cooldown: Duration::from_millis(100),
		call_timeout: Duration::from_secs(2),
	}
}

fn workers(cfg: Config) -> (Workers, Arc<AgentStore>) {
	let client = Client::new(&crate::client::Config::default()).unwrap();
	let agents = AgentStore::new();
	let tasks = TaskStore::new(
		SubscriptionBus::new(),
		PushNotifier::new(client.clone(), Policy::default()),
	);
	(Workers::new(agents.clone(), tasks, client, cfg), agents)
}

fn register(agents: &AgentStore, id: &str, url: &str) {
	agents.upsert(Agent {
		id: id.to_string(),
		url: url.to_string(),
		bearer: None,
		protocol: Protocol::A2a,
		protocol_version: None,
		metadata: json!(null),
	});
}

fn send_env(rpc_id: i32) -> Envelope {
	let mut env = Envelope::new(Protocol::A2a, "0.3.0", Method::SendMessage, json!(rpc_id));
	env.message = Some(json!({"role": "user", "parts": [{"text": "hi"}]}));
	env
}

fn ok_body(task_id: &str) -> serde_json::Value {
	json!({
		"jsonrpc": "2.0",
		"id": 1,
		"result": {"id": task_id, "status": {"state": "completed"}, "artifacts": []},
	})
}

#[tokio::test]
async fn happy_call_returns_upstream_result() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/rpc"))
		.respond_with(ResponseTemplate::new(200).set_body_json(ok_body("t1")))
		.mount(&server)
		.await;

	let (workers, agents) = workers(test_config());
	register(&agents, "a1", &format!("{}/rpc", server.uri()));

	let result = workers.call("a1", send_env(1)).await.unwrap();
	assert_eq!(result["id"], "t1");
	assert_eq!(result["status"]["state"], "completed");
}

#[tokio::test]
async fn unknown_agent_is_rejected_before_any_io() {
	let (workers, _) = workers(test_config());
	assert!(matches!(
		workers.call("ghost", send_env(1)).await,
		Err(CallError::AgentNotFound)
	));
	assert!(matches!(
		workers.health("ghost").await,
		Err(CallError::AgentNotFound)
	));
}

#[tokio::test]
async fn breaker_trips_cools_down_and_recovers() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(500))
		.up_to_n_times(3)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200).set_body_json(ok_body("t1")))
		.mount(&server)
		.await;

	let (workers, agents) = workers(test_config());
	register(&agents, "a1", &server.uri());

	// Three consecutive 5xx failures trip the breaker.
	for i in 0..3 {
		assert!(matches!(
			workers.call("a1", send_env(i)).await,
			Err(CallError::Status(500))
		));
	}
	let health = workers.health("a1").await.unwrap();
	assert_eq!(health.breaker, BreakerState::Open);
	assert_eq!(health.failure_count, 3);

	// Rejected without reaching the upstream while cooling down.
	assert!(matches!(
		workers.call("a1", send_env(3)).await,
		Err(CallError::CircuitOpen)
	));

	// After the cooldown one probe is admitted; success closes the breaker.
	tokio::time::sleep(Duration::from_millis(150)).await;
	workers.call("a1", send_env(4)).await.unwrap();
	let health = workers.health("a1").await.unwrap();
	assert_eq!(health.breaker, BreakerState::Closed);
	assert_eq!(health.failure_count, 0);

	// The breaker can trip again after recovery.
	server.reset().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;
	for i in 5..8 {
		assert!(workers.call("a1", send_env(i)).await.is_err());
	}
	assert_eq!(
		workers.health("a1").await.unwrap().breaker,
		BreakerState::Open
	);
}

#[tokio::test]
async fn remote_jsonrpc_errors_count_toward_the_breaker() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"jsonrpc": "2.0",
			"id": 1,
			"error": {"code": -32000, "message": "agent exploded"},
		})))
		.mount(&server)
		.await;

	let (workers, agents) = workers(test_config());
	register(&agents, "a1", &server.uri());

	for i in 0..3 {
		match workers.call("a1", send_env(i)).await {
			Err(CallError::Remote(e)) => assert_eq!(e.code, -32000),
			other => panic!("expected remote error, got {other:?}"),
		}
	}
	assert_eq!(
		workers.health("a1").await.unwrap().breaker,
		BreakerState::Open
	);
}

#[tokio::test]
async fn client_errors_are_reported_but_not_counted() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;

	let (workers, agents) = workers(test_config());
	register(&agents, "a1", &server.uri());

	for i in 0..5 {
		assert!(matches!(
			workers.call("a1", send_env(i)).await,
			Err(CallError::Status(404))
		));
	}
	let health = workers.health("a1").await.unwrap();
	assert_eq!(health.breaker, BreakerState::Closed);
	assert_eq!(health.failure_count, 0);
}

#[tokio::test]
async fn timeouts_count_as_failures() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(ok_body("t1"))
				.set_delay(Duration::from_secs(5)),
		)
		.mount(&server)
		.await;

	let cfg = Config {
		call_timeout: Duration::from_millis(100),
		..test_config()
	};
	let (workers, agents) = workers(cfg);
	register(&agents, "a1", &server.uri());

	assert!(matches!(
		workers.call("a1", send_env(1)).await,
		Err(CallError::Timeout)
	));
	assert_eq!(workers.health("a1").await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn in_flight_is_bounded() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(ok_body("t1"))
				.set_delay(Duration::from_millis(500)),
		)
		.mount(&server)
		.await;

	let cfg = Config {
		max_in_flight: 2,
		..test_config()
	};
	let (workers, agents) = workers(cfg);
	register(&agents, "a1", &server.uri());

	let w1 = workers.clone();
	let slow1 = tokio::spawn(async move { w1.call("a1", send_env(1)).await });
	let w2 = workers.clone();
	let slow2 = tokio::spawn(async move { w2.call("a1", send_env(2)).await });
	tokio::time::sleep(Duration::from_millis(100)).await;

	assert_eq!(workers.in_flight("a1").await.unwrap(), 2);
	assert!(matches!(
		workers.call("a1", send_env(3)).await,
		Err(CallError::Overloaded)
	));

	// The slot frees once the slow calls complete.
	slow1.await.unwrap().unwrap();
	slow2.await.unwrap().unwrap();
	assert_eq!(workers.in_flight("a1").await.unwrap(), 0);
	workers.call("a1", send_env(4)).await.unwrap();
}

#[tokio::test]
async fn streams_hold_their_slot_until_the_consumer_halts() {
	let server = MockServer::start().await;
	let sse = "data: {\"jsonrpc\":\"2.0\",\"result\":{\"task\":{\"id\":\"t1\",\"status\":{\"state\":\"working\"}}}}\n\n";
	Mock::given(method("POST"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_raw(sse.as_bytes().to_vec(), "text/event-stream")
				.set_delay(Duration::from_millis(300)),
		)
		.mount(&server)
		.await;

	let cfg = Config {
		max_in_flight: 2,
		..test_config()
	};
	let (workers, agents) = workers(cfg);
	register(&agents, "a1", &server.uri());

	let (tx, mut rx) = mpsc::channel(8);
	let mut env = send_env(1);
	env.method = Method::StreamMessage;
	workers.stream("a1", env, tx).await.unwrap();
	assert_eq!(workers.in_flight("a1").await.unwrap(), 1);

	// Init arrives once the upstream responds; afterwards the slot frees.
	match rx.recv().await.unwrap() {
		StreamEvent::Init { body, .. } => assert_eq!(body["task"]["id"], "t1"),
		other => panic!("expected init, got {other:?}"),
	}
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(workers.in_flight("a1").await.unwrap(), 0);
}

#[tokio::test]
async fn removing_a_worker_stops_it() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200).set_body_json(ok_body("t1")))
		.mount(&server)
		.await;

	let (workers, agents) = workers(test_config());
	register(&agents, "a1", &server.uri());
	workers.call("a1", send_env(1)).await.unwrap();

	agents.delete("a1");
	workers.remove("a1");
	assert!(matches!(
		workers.call("a1", send_env(2)).await,
		Err(CallError::AgentNotFound)
	));
}

#[tokio::test]
async fn health_all_reports_registered_agents() {
	let server = MockServer::start().await;
	let (workers, agents) = workers(test_config());
	register(&agents, "a1", &server.uri());
	register(&agents, "a2", &server.uri());

	let all = workers.health_all().await;
	assert_eq!(all.len(), 2);
	assert!(all.iter().all(|h| h.breaker == BreakerState::Closed));
	assert_eq!(all[0].agent_id, "a1");
	assert_eq!(all[1].agent_id, "a2");
}
