use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	/// Default filter directive; `RUST_LOG` overrides it.
	pub filter: String,
	/// Emit JSON lines instead of the human format.
	pub json: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			filter: "info".to_string(),
			json: false,
		}
	}
}

pub fn setup(cfg: &Config) {
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.filter.clone()));
	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	// A second init (tests, embedding) is not an error worth failing over.
	if cfg.json {
		let _ = builder.json().try_init();
	} else {
		let _ = builder.try_init();
	}
}
