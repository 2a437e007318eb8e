use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

pub mod client;
pub mod http;
pub mod jsonrpc;
pub mod mcp;
pub mod protocol;
pub mod push;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod types;
pub mod worker;

use crate::client::Client;
use crate::mcp::Sessions;
use crate::push::PushNotifier;
use crate::store::{AgentStore, SubscriptionBus, TaskStore};
use crate::worker::Workers;

/// RawConfig is what users write (YAML or JSON); Config is the internal
/// representation with defaults applied and durations resolved.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	/// Listen address in the form "ip:port".
	bind: Option<String>,
	logging: Option<RawLogging>,
	client: Option<RawClient>,
	worker: Option<RawWorker>,
	push: Option<RawPush>,
	mcp: Option<RawMcp>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawLogging {
	filter: Option<String>,
	json: Option<bool>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawClient {
	connect_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawWorker {
	max_in_flight: Option<usize>,
	failure_threshold: Option<u32>,
	failure_window_ms: Option<u64>,
	cooldown_ms: Option<u64>,
	call_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawPush {
	max_attempts: Option<u32>,
	backoff_base_ms: Option<u64>,
	jwt_ttl_secs: Option<u64>,
	jwt_clock_skew_secs: Option<u64>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawMcp {
	request_timeout_ms: Option<u64>,
}

impl RawConfig {
	pub fn from_yaml(contents: &str) -> anyhow::Result<RawConfig> {
		Ok(serde_yaml::from_str(contents)?)
	}

	pub fn build(self) -> anyhow::Result<Config> {
		let mut config = Config::default();
		if let Some(bind) = self.bind {
			config.bind = bind.parse()?;
		}
		if let Some(logging) = self.logging {
			if let Some(filter) = logging.filter {
				config.logging.filter = filter;
			}
			if let Some(json) = logging.json {
				config.logging.json = json;
			}
		}
		if let Some(client) = self.client
			&& let Some(ms) = client.connect_timeout_ms
		{
			config.client.connect_timeout = Duration::from_millis(ms);
		}
		if let Some(worker) = self.worker {
			if let Some(n) = worker.max_in_flight {
				config.worker.max_in_flight = n;
			}
			if let Some(n) = worker.failure_threshold {
				config.worker.failure_threshold = n;
			}
			if let Some(ms) = worker.failure_window_ms {
				config.worker.failure_window = Duration::from_millis(ms);
			}
			if let Some(ms) = worker.cooldown_ms {
				config.worker.cooldown = Duration::from_millis(ms);
			}
			if let Some(ms) = worker.call_timeout_ms {
				config.worker.call_timeout = Duration::from_millis(ms);
			}
		}
		if let Some(push) = self.push {
			if let Some(n) = push.max_attempts {
				config.push.max_attempts = n;
			}
			if let Some(ms) = push.backoff_base_ms {
				config.push.backoff_base = Duration::from_millis(ms);
			}
			if let Some(secs) = push.jwt_ttl_secs {
				config.push.jwt_ttl = Duration::from_secs(secs);
			}
			if let Some(secs) = push.jwt_clock_skew_secs {
				config.push.jwt_skew = Duration::from_secs(secs);
			}
		}
		if let Some(mcp) = self.mcp
			&& let Some(ms) = mcp.request_timeout_ms
		{
			config.mcp.request_timeout = Duration::from_millis(ms);
		}
		Ok(config)
	}
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub bind: SocketAddr,
	pub logging: telemetry::Config,
	pub client: client::Config,
	pub worker: worker::Config,
	pub push: push::Policy,
	pub mcp: mcp::SessionConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([127, 0, 0, 1], 4000)),
			logging: telemetry::Config::default(),
			client: client::Config::default(),
			worker: worker::Config::default(),
			push: push::Policy::default(),
			mcp: mcp::SessionConfig::default(),
		}
	}
}

/// Everything a request handler needs, wired together once at startup.
#[derive(Debug)]
pub struct Gateway {
	pub config: Arc<Config>,
	pub client: Client,
	pub agents: Arc<AgentStore>,
	pub tasks: Arc<TaskStore>,
	pub workers: Workers,
	pub sessions: Sessions,
}

impl Gateway {
	pub fn new(config: Config) -> anyhow::Result<Arc<Gateway>> {
		let client = Client::new(&config.client)?;
		let agents = AgentStore::new();
		let tasks = TaskStore::new(
			SubscriptionBus::new(),
			PushNotifier::new(client.clone(), config.push.clone()),
		);
		let workers = Workers::new(
			agents.clone(),
			tasks.clone(),
			client.clone(),
			config.worker.clone(),
		);
		let sessions = Sessions::new(agents.clone(), client.clone(), config.mcp.clone());
		Ok(Arc::new(Gateway {
			config: Arc::new(config),
			client,
			agents,
			tasks,
			workers,
			sessions,
		}))
	}

	pub fn router(self: &Arc<Self>) -> axum::Router {
		http::router(self.clone())
	}
}
