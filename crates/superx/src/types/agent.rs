use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire protocol an upstream agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	#[default]
	A2a,
	Mcp,
}

impl Protocol {
	pub fn name(&self) -> &'static str {
		match self {
			Protocol::A2a => "a2a",
			Protocol::Mcp => "mcp",
		}
	}
}

impl std::fmt::Display for Protocol {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

impl std::str::FromStr for Protocol {
	type Err = UnknownProtocol;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"a2a" => Ok(Protocol::A2a),
			"mcp" => Ok(Protocol::Mcp),
			other => Err(UnknownProtocol(other.to_string())),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

/// A registered upstream agent. Everything needed to reach it lives here;
/// workers and sessions are looked up separately by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
	pub id: String,
	pub url: String,
	/// Static token forwarded upstream as `Authorization: Bearer <token>`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub bearer: Option<String>,
	#[serde(default)]
	pub protocol: Protocol,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub protocol_version: Option<String>,
	/// Free-form pass-through. May embed a cached agent card under `agentCard`.
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub metadata: Value,
}

impl Agent {
	/// The cached agent card embedded in metadata, if any.
	pub fn cached_card(&self) -> Option<&Value> {
		match self.metadata.get("agentCard") {
			Some(Value::Null) | None => None,
			Some(card) => Some(card),
		}
	}

	/// MCP stdio agents are addressed by a `command` in metadata instead of a URL.
	pub fn stdio_command(&self) -> Option<StdioCommand> {
		let cmd = self.metadata.get("command")?.as_str()?.to_string();
		let args = self
			.metadata
			.get("args")
			.and_then(Value::as_array)
			.map(|a| {
				a.iter()
					.filter_map(Value::as_str)
					.map(str::to_string)
					.collect()
			})
			.unwrap_or_default();
		let env = self
			.metadata
			.get("env")
			.and_then(Value::as_object)
			.map(|m| {
				m.iter()
					.filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
					.collect()
			})
			.unwrap_or_default();
		Some(StdioCommand { cmd, args, env })
	}
}

#[derive(Debug, Clone)]
pub struct StdioCommand {
	pub cmd: String,
	pub args: Vec<String>,
	pub env: Vec<(String, String)>,
}
