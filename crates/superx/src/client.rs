use std::time::Duration;

use serde_json::Value;
use tracing::{Level, event};

use crate::jsonrpc;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	#[serde(skip)]
	pub connect_timeout: Duration,
	pub user_agent: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(5),
			user_agent: format!("superx/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
	#[error("request timed out")]
	Timeout,
	#[error("transport error: {0}")]
	Transport(String),
	#[error("upstream status {0}")]
	Status(u16),
	#[error("undecodable response body: {0}")]
	Decode(String),
}

impl From<reqwest::Error> for HttpError {
	fn from(e: reqwest::Error) -> Self {
		if e.is_timeout() {
			HttpError::Timeout
		} else if e.is_decode() {
			HttpError::Decode(e.to_string())
		} else {
			HttpError::Transport(e.to_string())
		}
	}
}

/// Pooled outbound HTTP client. One instance is shared by workers, the push
/// notifier, MCP transports and the card endpoint; reqwest pools connections
/// per host underneath.
#[derive(Debug, Clone)]
pub struct Client {
	inner: reqwest::Client,
}

impl Client {
	pub fn new(cfg: &Config) -> anyhow::Result<Client> {
		let inner = reqwest::Client::builder()
			.connect_timeout(cfg.connect_timeout)
			.user_agent(cfg.user_agent.clone())
			.build()?;
		Ok(Client { inner })
	}

	pub fn raw(&self) -> &reqwest::Client {
		&self.inner
	}

	/// POST a JSON-RPC request and parse the JSON-RPC response body.
	/// Non-2xx statuses surface as `HttpError::Status`.
	pub async fn post_rpc(
		&self,
		url: &str,
		bearer: Option<&str>,
		req: &jsonrpc::Request,
		timeout: Duration,
	) -> Result<jsonrpc::Response, HttpError> {
		let start = std::time::Instant::now();
		let mut builder = self.inner.post(url).json(req).timeout(timeout);
		if let Some(token) = bearer {
			builder = builder.bearer_auth(token);
		}
		let result = builder.send().await;
		let status = result.as_ref().ok().map(|r| r.status().as_u16());
		event!(
			target: "upstream request",
			Level::DEBUG,
			url = %url,
			method = %req.method,
			status = status.unwrap_or_default(),
			duration_ms = start.elapsed().as_millis() as u64,
		);
		let resp = result?;
		let status = resp.status();
		if !status.is_success() {
			return Err(HttpError::Status(status.as_u16()));
		}
		let body: jsonrpc::Response = resp.json().await?;
		Ok(body)
	}

	/// GET a JSON document, typically an agent card.
	pub async fn fetch_json(
		&self,
		url: &str,
		bearer: Option<&str>,
		timeout: Duration,
	) -> Result<Value, HttpError> {
		let mut builder = self
			.inner
			.get(url)
			.header(reqwest::header::ACCEPT, "application/json")
			.timeout(timeout);
		if let Some(token) = bearer {
			builder = builder.bearer_auth(token);
		}
		let resp = builder.send().await?;
		let status = resp.status();
		event!(
			target: "upstream request",
			Level::DEBUG,
			url = %url,
			method = "GET",
			status = status.as_u16(),
		);
		if !status.is_success() {
			return Err(HttpError::Status(status.as_u16()));
		}
		Ok(resp.json().await?)
	}

	/// POST a JSON-RPC request expecting a streaming (SSE) response. The
	/// status gate is the consumer's job, so the raw response is returned.
	pub async fn post_stream(
		&self,
		url: &str,
		bearer: Option<&str>,
		req: &jsonrpc::Request,
	) -> Result<reqwest::Response, HttpError> {
		let mut builder = self
			.inner
			.post(url)
			.json(req)
			.header(reqwest::header::ACCEPT, "text/event-stream");
		if let Some(token) = bearer {
			builder = builder.bearer_auth(token);
		}
		let resp = builder.send().await?;
		event!(
			target: "upstream request",
			Level::DEBUG,
			url = %url,
			method = %req.method,
			status = resp.status().as_u16(),
			streaming = true,
		);
		Ok(resp)
	}
}
