use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{Level, event};

use crate::client::Client;

pub const HEADER_TOKEN: &str = "x-a2a-token";
pub const HEADER_SIGNATURE: &str = "x-a2a-signature";
pub const HEADER_TIMESTAMP: &str = "x-a2a-timestamp";

/// Outbound webhook registration for one task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub task_id: String,
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hmac_secret: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub jwt_secret: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub jwt_issuer: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub jwt_audience: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub jwt_kid: Option<String>,
}

impl PushConfig {
	/// A bare webhook carried on a single request, with no auth material.
	pub fn for_webhook(task_id: &str, url: &str) -> PushConfig {
		PushConfig {
			id: uuid::Uuid::new_v4().to_string(),
			task_id: task_id.to_string(),
			url: url.to_string(),
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
	pub max_attempts: u32,
	#[serde(skip)]
	pub backoff_base: Duration,
	#[serde(skip)]
	pub jwt_ttl: Duration,
	#[serde(skip)]
	pub jwt_skew: Duration,
}

impl Default for Policy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			backoff_base: Duration::from_millis(200),
			jwt_ttl: Duration::from_secs(300),
			jwt_skew: Duration::from_secs(120),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
	#[error("push config has no url")]
	NoUrl,
	#[error("webhook rejected delivery with status {0}")]
	Http(u16),
	#[error("delivery attempts exhausted")]
	MaxAttempts,
	#[error("could not sign payload: {0}")]
	Sign(String),
}

#[derive(Serialize)]
struct JwtClaims {
	iat: u64,
	exp: u64,
	nbf: u64,
	/// Lowercase hex SHA-256 of the request body, binding token to payload.
	hash: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	iss: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	aud: Option<String>,
	#[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
	task_id: Option<String>,
}

/// Delivers task updates to registered webhooks. Each delivery is an
/// independent retry loop; ordering across deliveries is not guaranteed and
/// receivers must be idempotent.
#[derive(Debug, Clone)]
pub struct PushNotifier {
	client: Client,
	policy: Policy,
}

impl PushNotifier {
	pub fn new(client: Client, policy: Policy) -> PushNotifier {
		PushNotifier { client, policy }
	}

	/// Deliver one stream payload ({task | statusUpdate | artifactUpdate})
	/// to the configured webhook, retrying on transport errors and 5xx.
	pub async fn deliver(&self, payload: &Value, cfg: &PushConfig) -> Result<(), PushError> {
		if cfg.url.is_empty() {
			return Err(PushError::NoUrl);
		}
		let body =
			serde_json::to_vec(&json!({"streamResponse": payload})).expect("payload is valid JSON");
		let headers = self.sign(&body, cfg)?;

		for attempt in 1..=self.policy.max_attempts {
			if attempt > 1 {
				let backoff = self.policy.backoff_base * (1u32 << (attempt - 2));
				tokio::time::sleep(backoff).await;
			}
			event!(
				target: "push",
				Level::DEBUG,
				event = "push_start",
				task = %cfg.task_id,
				url = %cfg.url,
				attempt = attempt,
			);
			let mut builder = self
				.client
				.raw()
				.post(&cfg.url)
				.header(reqwest::header::CONTENT_TYPE, "application/json")
				.body(body.clone());
			for (name, value) in &headers {
				builder = builder.header(*name, value.as_str());
			}
			match builder.send().await {
				Ok(resp) if resp.status().is_success() => {
					event!(
						target: "push",
						Level::DEBUG,
						event = "push_success",
						task = %cfg.task_id,
						url = %cfg.url,
						attempt = attempt,
						status = resp.status().as_u16(),
					);
					return Ok(());
				},
				Ok(resp) => {
					let status = resp.status().as_u16();
					event!(
						target: "push",
						Level::WARN,
						event = "push_failure",
						task = %cfg.task_id,
						url = %cfg.url,
						attempt = attempt,
						status = status,
					);
					// Client errors are not retryable.
					if !resp.status().is_server_error() {
						return Err(PushError::Http(status));
					}
				},
				Err(e) => {
					event!(
						target: "push",
						Level::WARN,
						event = "push_failure",
						task = %cfg.task_id,
						url = %cfg.url,
						attempt = attempt,
						reason = %e,
					);
				},
			}
		}
		Err(PushError::MaxAttempts)
	}

	/// Compute the conditional auth headers for a body. Wall clock is correct
	/// here: timestamps and JWT claims are validated by the remote peer.
	fn sign(&self, body: &[u8], cfg: &PushConfig) -> Result<Vec<(&'static str, String)>, PushError> {
		let mut headers = Vec::new();
		if let Some(token) = &cfg.token {
			headers.push((HEADER_TOKEN, token.clone()));
		}
		if let Some(secret) = &cfg.hmac_secret {
			let ts = unix_now();
			headers.push((HEADER_SIGNATURE, hmac_signature(secret, ts, body)));
			headers.push((HEADER_TIMESTAMP, ts.to_string()));
		}
		if let Some(secret) = &cfg.jwt_secret {
			let iat = unix_now();
			let claims = JwtClaims {
				iat,
				exp: iat + self.policy.jwt_ttl.as_secs(),
				nbf: iat.saturating_sub(self.policy.jwt_skew.as_secs()),
				hash: sha256_hex(body),
				iss: cfg.jwt_issuer.clone(),
				aud: cfg.jwt_audience.clone(),
				task_id: (!cfg.task_id.is_empty()).then(|| cfg.task_id.clone()),
			};
			let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
			header.kid = cfg.jwt_kid.clone();
			let jwt = jsonwebtoken::encode(
				&header,
				&claims,
				&EncodingKey::from_secret(secret.as_bytes()),
			)
			.map_err(|e| PushError::Sign(e.to_string()))?;
			headers.push(("authorization", format!("Bearer {jwt}")));
		}
		Ok(headers)
	}
}

/// Lowercase hex HMAC-SHA256 over `<ts>.<body>`.
pub fn hmac_signature(secret: &str, ts: u64, body: &[u8]) -> String {
	let mut mac =
		Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
	mac.update(ts.to_string().as_bytes());
	mac.update(b".");
	mac.update(body);
	hex_lower(&mac.finalize().into_bytes())
}

pub fn sha256_hex(body: &[u8]) -> String {
	hex_lower(&Sha256::digest(body))
}

fn hex_lower(bytes: &[u8]) -> String {
	use std::fmt::Write;
	bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
		let _ = write!(s, "{b:02x}");
		s
	})
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_secs()
}

#[cfg(test)]
#[path = "push_tests.rs"]
mod tests;
