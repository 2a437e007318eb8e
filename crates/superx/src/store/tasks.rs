use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::push::{PushConfig, PushNotifier};
use crate::store::bus::{HaltReason, SubscriptionBus, Subscription, TaskEvent};
use crate::types::task::{InvalidTask, Task};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TaskError {
	#[error("invalid task: {0}")]
	Invalid(&'static str),
	#[error("task is in a terminal state")]
	Terminal,
	#[error("task not found")]
	NotFound,
}

impl From<InvalidTask> for TaskError {
	fn from(e: InvalidTask) -> Self {
		match e {
			InvalidTask::NotAnObject => TaskError::Invalid("task must be a JSON object"),
			InvalidTask::MissingId => TaskError::Invalid("task id is missing or empty"),
		}
	}
}

/// Authoritative store for task payloads. Writes are committed under the map
/// lock, where the terminal-state check runs against the value actually being
/// replaced; broadcast and webhook dispatch happen after the lock drops, in
/// accepted order.
pub struct TaskStore {
	tasks: RwLock<HashMap<String, Arc<Task>>>,
	configs: RwLock<HashMap<String, Vec<PushConfig>>>,
	bus: Arc<SubscriptionBus>,
	notifier: PushNotifier,
}

impl TaskStore {
	pub fn new(bus: Arc<SubscriptionBus>, notifier: PushNotifier) -> Arc<TaskStore> {
		Arc::new(TaskStore {
			tasks: RwLock::new(HashMap::new()),
			configs: RwLock::new(HashMap::new()),
			bus,
			notifier,
		})
	}

	pub fn bus(&self) -> &Arc<SubscriptionBus> {
		&self.bus
	}

	/// Upsert a task. Rejects payloads without an id and writes over tasks
	/// that already reached a terminal state.
	pub fn put(&self, value: Value) -> Result<Arc<Task>, TaskError> {
		let task = self.commit(Task::from_value(value)?)?;
		self
			.bus
			.broadcast(task.id(), TaskEvent::Task(task.clone()));
		self.dispatch_push(task.id(), json!({"task": task.as_value()}));
		Ok(task)
	}

	pub fn get(&self, id: &str) -> Option<Arc<Task>> {
		self.tasks.read().get(id).cloned()
	}

	/// Idempotent delete; cascades push configs and halts subscribers.
	pub fn delete(&self, id: &str) {
		self.tasks.write().remove(id);
		self.configs.write().remove(id);
		self.bus.broadcast(id, TaskEvent::Halt(HaltReason::Deleted));
	}

	/// Best-effort enumeration.
	pub fn list(&self, limit: Option<usize>) -> Vec<Arc<Task>> {
		let tasks = self.tasks.read();
		let mut all: Vec<_> = tasks.values().cloned().collect();
		all.sort_by(|a, b| a.id().cmp(b.id()));
		if let Some(limit) = limit {
			all.truncate(limit);
		}
		all
	}

	/// Overwrite the status of an existing task from a statusUpdate event.
	pub fn apply_status_update(&self, update: Value) -> Result<Arc<Task>, TaskError> {
		let task_id = update_task_id(&update).ok_or(TaskError::Invalid("missing taskId"))?;
		let status = update
			.get("status")
			.cloned()
			.ok_or(TaskError::Invalid("missing status"))?;
		let current = self.get(&task_id).ok_or(TaskError::NotFound)?;
		let merged = self.commit(current.with_status(status))?;
		self
			.bus
			.broadcast(&task_id, TaskEvent::Task(merged.clone()));
		self
			.bus
			.broadcast(&task_id, TaskEvent::Status(merged.clone()));
		self.dispatch_push(&task_id, json!({"statusUpdate": update}));
		Ok(merged)
	}

	/// Merge artifacts into an existing task from an artifactUpdate event.
	pub fn apply_artifact_update(&self, update: Value) -> Result<Arc<Task>, TaskError> {
		let task_id = update_task_id(&update).ok_or(TaskError::Invalid("missing taskId"))?;
		let artifacts = extract_artifacts(&update);
		if artifacts.is_empty() {
			return Err(TaskError::Invalid("missing artifact"));
		}
		let current = self.get(&task_id).ok_or(TaskError::NotFound)?;
		let mut merged = (*current).clone();
		for artifact in artifacts {
			merged = merged.with_artifact(artifact);
		}
		let merged = self.commit(merged)?;
		self
			.bus
			.broadcast(&task_id, TaskEvent::Task(merged.clone()));
		self
			.bus
			.broadcast(&task_id, TaskEvent::Artifact(merged.clone()));
		self.dispatch_push(&task_id, json!({"artifactUpdate": update}));
		Ok(merged)
	}

	/// Register the caller for updates; returns the current task when present.
	pub fn subscribe(&self, task_id: &str) -> (Subscription, Option<Arc<Task>>) {
		let sub = self.bus.subscribe(task_id);
		(sub, self.get(task_id))
	}

	// Push configuration registry.

	pub fn set_push_config(&self, task_id: &str, mut cfg: PushConfig) -> PushConfig {
		cfg.id = uuid::Uuid::new_v4().to_string();
		cfg.task_id = task_id.to_string();
		self
			.configs
			.write()
			.entry(task_id.to_string())
			.or_default()
			.push(cfg.clone());
		cfg
	}

	/// Register a per-request webhook unless one for the same URL exists.
	pub fn register_webhook(&self, task_id: &str, url: &str) {
		let mut configs = self.configs.write();
		let entry = configs.entry(task_id.to_string()).or_default();
		if entry.iter().any(|c| c.url == url) {
			return;
		}
		entry.push(PushConfig::for_webhook(task_id, url));
	}

	pub fn get_push_config(&self, task_id: &str, config_id: &str) -> Option<PushConfig> {
		self
			.configs
			.read()
			.get(task_id)?
			.iter()
			.find(|c| c.id == config_id)
			.cloned()
	}

	pub fn list_push_configs(&self, task_id: &str) -> Vec<PushConfig> {
		self
			.configs
			.read()
			.get(task_id)
			.cloned()
			.unwrap_or_default()
	}

	pub fn delete_push_config(&self, task_id: &str, config_id: &str) {
		let mut configs = self.configs.write();
		if let Some(entry) = configs.get_mut(task_id) {
			entry.retain(|c| c.id != config_id);
			if entry.is_empty() {
				configs.remove(task_id);
			}
		}
	}

	/// The critical section: terminal-state immutability is enforced against
	/// the stored value at the moment of the write, not at load time.
	fn commit(&self, task: Task) -> Result<Arc<Task>, TaskError> {
		let mut tasks = self.tasks.write();
		if let Some(existing) = tasks.get(task.id())
			&& existing.is_terminal()
		{
			return Err(TaskError::Terminal);
		}
		let task = Arc::new(task);
		tasks.insert(task.id().to_string(), task.clone());
		Ok(task)
	}

	/// Fire-and-forget webhook deliveries. Failures are logged by the
	/// notifier and never affect task state or client responses.
	fn dispatch_push(&self, task_id: &str, payload: Value) {
		let configs = self.list_push_configs(task_id);
		if configs.is_empty() {
			return;
		}
		debug!(task = %task_id, configs = configs.len(), "dispatching push deliveries");
		for cfg in configs {
			let notifier = self.notifier.clone();
			let payload = payload.clone();
			tokio::spawn(async move {
				if let Err(e) = notifier.deliver(&payload, &cfg).await {
					warn!(task = %cfg.task_id, url = %cfg.url, "push delivery failed: {e}");
				}
			});
		}
	}
}

impl std::fmt::Debug for TaskStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TaskStore")
			.field("tasks", &self.tasks.read().len())
			.finish()
	}
}

fn update_task_id(update: &Value) -> Option<String> {
	update
		.get("taskId")
		.and_then(Value::as_str)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
}

/// Accept the artifact spellings seen on the wire: a single `artifact`, an
/// `artifacts` array, or a nested `artifactUpdate` event.
fn extract_artifacts(update: &Value) -> Vec<Value> {
	if let Some(one) = update.get("artifact").filter(|a| a.is_object()) {
		return vec![one.clone()];
	}
	if let Some(many) = update.get("artifacts").and_then(Value::as_array) {
		return many.clone();
	}
	if let Some(nested) = update.get("artifactUpdate").filter(|a| a.is_object()) {
		return extract_artifacts(nested);
	}
	Vec::new()
}

#[cfg(test)]
#[path = "tasks_tests.rs"]
mod tests;
