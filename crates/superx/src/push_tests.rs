use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;

fn notifier(policy: Policy) -> PushNotifier {
	let client = Client::new(&crate::client::Config::default()).unwrap();
	PushNotifier::new(client, policy)
}

fn fast_policy() -> Policy {
	Policy {
		max_attempts: 3,
		backoff_base: Duration::from_millis(5),
		..Policy::default()
	}
}

fn cfg(url: String) -> PushConfig {
	PushConfig {
		id: "cfg1".to_string(),
		task_id: "t4".to_string(),
		url,
		..Default::default()
	}
}

#[tokio::test]
async fn missing_url_is_rejected_without_io() {
	let n = notifier(fast_policy());
	let result = n.deliver(&json!({"task": {"id": "t4"}}), &cfg(String::new())).await;
	assert!(matches!(result, Err(PushError::NoUrl)));
}

#[tokio::test]
async fn delivery_wraps_payload_in_stream_response() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/hook"))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;

	let n = notifier(fast_policy());
	n.deliver(&json!({"task": {"id": "t4"}}), &cfg(format!("{}/hook", server.uri())))
		.await
		.unwrap();

	let requests = server.received_requests().await.unwrap();
	let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(body, json!({"streamResponse": {"task": {"id": "t4"}}}));
	assert_eq!(
		requests[0].headers.get("content-type").unwrap(),
		"application/json"
	);
}

#[tokio::test]
async fn token_header_is_attached() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	let mut cfg = cfg(server.uri());
	cfg.token = Some("secret-token".to_string());
	notifier(fast_policy())
		.deliver(&json!({"task": {"id": "t4"}}), &cfg)
		.await
		.unwrap();

	let requests = server.received_requests().await.unwrap();
	assert_eq!(requests[0].headers.get(HEADER_TOKEN).unwrap(), "secret-token");
}

#[tokio::test]
async fn hmac_signature_covers_timestamp_and_body() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	let mut cfg = cfg(server.uri());
	cfg.hmac_secret = Some("k".to_string());
	notifier(fast_policy())
		.deliver(&json!({"task": {"id": "t4"}}), &cfg)
		.await
		.unwrap();

	let requests = server.received_requests().await.unwrap();
	let ts: u64 = requests[0]
		.headers
		.get(HEADER_TIMESTAMP)
		.unwrap()
		.to_str()
		.unwrap()
		.parse()
		.unwrap();
	let sig = requests[0]
		.headers
		.get(HEADER_SIGNATURE)
		.unwrap()
		.to_str()
		.unwrap()
		.to_string();
	assert_eq!(sig, hmac_signature("k", ts, &requests[0].body));
	// Lowercase hex, 32 bytes.
	assert_eq!(sig.len(), 64);
	assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[tokio::test]
async fn jwt_carries_body_hash_and_claims() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	let mut cfg = cfg(server.uri());
	cfg.jwt_secret = Some("jwt-secret".to_string());
	cfg.jwt_issuer = Some("superx".to_string());
	cfg.jwt_audience = Some("hooks".to_string());
	cfg.jwt_kid = Some("kid-1".to_string());
	notifier(fast_policy())
		.deliver(&json!({"task": {"id": "t4"}}), &cfg)
		.await
		.unwrap();

	let requests = server.received_requests().await.unwrap();
	let auth = requests[0]
		.headers
		.get("authorization")
		.unwrap()
		.to_str()
		.unwrap();
	let token = auth.strip_prefix("Bearer ").unwrap();
	let [header, payload, _sig]: [&str; 3] =
		token.split('.').collect::<Vec<_>>().try_into().unwrap();

	let header: Value =
		serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header).unwrap()).unwrap();
	assert_eq!(header["alg"], "HS256");
	assert_eq!(header["kid"], "kid-1");

	let claims: Value =
		serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
	assert_eq!(claims["hash"], sha256_hex(&requests[0].body));
	assert_eq!(claims["iss"], "superx");
	assert_eq!(claims["aud"], "hooks");
	assert_eq!(claims["taskId"], "t4");
	let iat = claims["iat"].as_u64().unwrap();
	assert_eq!(claims["exp"].as_u64().unwrap(), iat + 300);
	assert_eq!(claims["nbf"].as_u64().unwrap(), iat - 120);
}

#[tokio::test]
async fn retries_on_5xx_until_success() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(500))
		.up_to_n_times(2)
		.expect(2)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;

	notifier(fast_policy())
		.deliver(&json!({"task": {"id": "t4"}}), &cfg(server.uri()))
		.await
		.unwrap();
	server.verify().await;
}

#[tokio::test]
async fn client_errors_are_terminal() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(404))
		.expect(1)
		.mount(&server)
		.await;

	let result = notifier(fast_policy())
		.deliver(&json!({"task": {"id": "t4"}}), &cfg(server.uri()))
		.await;
	assert!(matches!(result, Err(PushError::Http(404))));
	server.verify().await;
}

#[tokio::test]
async fn attempts_are_bounded_with_exponential_backoff() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(500))
		.expect(3)
		.mount(&server)
		.await;

	let policy = Policy {
		max_attempts: 3,
		backoff_base: Duration::from_millis(20),
		..Policy::default()
	};
	let start = std::time::Instant::now();
	let result = notifier(policy)
		.deliver(&json!({"task": {"id": "t4"}}), &cfg(server.uri()))
		.await;
	assert!(matches!(result, Err(PushError::MaxAttempts)));
	// Sleeps: base + 2*base = 60ms total.
	assert!(start.elapsed() >= Duration::from_millis(55));
	server.verify().await;
}
