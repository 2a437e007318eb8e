use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::agent::Agent;

/// In-memory agent directory. Workers and sessions resolve agents by id on
/// every call, so an upsert takes effect immediately.
#[derive(Debug, Default)]
pub struct AgentStore {
	agents: RwLock<HashMap<String, Arc<Agent>>>,
}

impl AgentStore {
	pub fn new() -> Arc<AgentStore> {
		Arc::new(AgentStore::default())
	}

	/// Insert or replace. Returns the stored agent.
	pub fn upsert(&self, agent: Agent) -> Arc<Agent> {
		let agent = Arc::new(agent);
		debug!(agent = %agent.id, url = %agent.url, protocol = %agent.protocol, "agent upserted");
		self
			.agents
			.write()
			.insert(agent.id.clone(), agent.clone());
		agent
	}

	pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
		self.agents.read().get(id).cloned()
	}

	/// Idempotent delete. Returns the removed agent if it existed.
	pub fn delete(&self, id: &str) -> Option<Arc<Agent>> {
		let removed = self.agents.write().remove(id);
		if removed.is_some() {
			debug!(agent = %id, "agent deleted");
		}
		removed
	}

	pub fn list(&self) -> Vec<Arc<Agent>> {
		let mut all: Vec<_> = self.agents.read().values().cloned().collect();
		all.sort_by(|a, b| a.id.cmp(&b.id));
		all
	}

	pub fn ids(&self) -> Vec<String> {
		let mut ids: Vec<_> = self.agents.read().keys().cloned().collect();
		ids.sort();
		ids
	}

	pub fn len(&self) -> usize {
		self.agents.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.agents.read().is_empty()
	}
}
