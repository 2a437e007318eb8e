use serde_json::{Map, Value, json};

/// Task lifecycle states. The A2A wire spelling is dashed (`input-required`);
/// the underscore form is accepted on input for compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
	Submitted,
	Working,
	InputRequired,
	Completed,
	Failed,
	Canceled,
	Rejected,
}

impl TaskState {
	pub fn parse(s: &str) -> Option<TaskState> {
		Some(match s {
			"submitted" => TaskState::Submitted,
			"working" => TaskState::Working,
			"input-required" | "input_required" => TaskState::InputRequired,
			"completed" => TaskState::Completed,
			"failed" => TaskState::Failed,
			"canceled" => TaskState::Canceled,
			"rejected" => TaskState::Rejected,
			_ => return None,
		})
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			TaskState::Submitted => "submitted",
			TaskState::Working => "working",
			TaskState::InputRequired => "input-required",
			TaskState::Completed => "completed",
			TaskState::Failed => "failed",
			TaskState::Canceled => "canceled",
			TaskState::Rejected => "rejected",
		}
	}

	/// Terminal states reject any further write to the task.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Rejected
		)
	}
}

impl std::fmt::Display for TaskState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A task payload. Bodies are schemaless pass-through from upstream agents;
/// structure is enforced only where the gateway itself depends on it
/// (`id`, `status.state`, artifact identity).
#[derive(Debug, Clone, PartialEq)]
pub struct Task(Value);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvalidTask {
	#[error("task must be a JSON object")]
	NotAnObject,
	#[error("task id is missing or empty")]
	MissingId,
}

impl Task {
	pub fn from_value(v: Value) -> Result<Task, InvalidTask> {
		if !v.is_object() {
			return Err(InvalidTask::NotAnObject);
		}
		let id = v.get("id").and_then(Value::as_str).unwrap_or_default();
		if id.is_empty() {
			return Err(InvalidTask::MissingId);
		}
		Ok(Task(v))
	}

	/// Wrap a bare message as a synthetic completed task. Used when an upstream
	/// stream emits a `message` event instead of a task.
	pub fn from_message(msg: Value) -> Task {
		let id = msg
			.get("messageId")
			.or_else(|| msg.get("id"))
			.and_then(Value::as_str)
			.map(str::to_string)
			.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
		Task(json!({
			"id": id,
			"message": msg,
			"status": {"state": "completed"},
		}))
	}

	pub fn id(&self) -> &str {
		self.0.get("id").and_then(Value::as_str).unwrap_or_default()
	}

	pub fn status(&self) -> Option<&Value> {
		self.0.get("status")
	}

	pub fn state(&self) -> Option<TaskState> {
		self
			.status()?
			.get("state")
			.and_then(Value::as_str)
			.and_then(TaskState::parse)
	}

	pub fn is_terminal(&self) -> bool {
		self.state().is_some_and(|s| s.is_terminal())
	}

	pub fn artifacts(&self) -> Option<&Vec<Value>> {
		self.0.get("artifacts").and_then(Value::as_array)
	}

	/// Overwrite the status field, returning the updated task.
	pub fn with_status(&self, status: Value) -> Task {
		let mut obj = self.as_object().clone();
		obj.insert("status".to_string(), status);
		Task(Value::Object(obj))
	}

	/// Merge one artifact by identity: a matching key replaces in place,
	/// otherwise the artifact is appended.
	pub fn with_artifact(&self, artifact: Value) -> Task {
		let mut obj = self.as_object().clone();
		let artifacts = obj
			.entry("artifacts".to_string())
			.or_insert_with(|| Value::Array(vec![]));
		if !artifacts.is_array() {
			*artifacts = Value::Array(vec![]);
		}
		let list = artifacts.as_array_mut().expect("ensured above");
		match artifact_key(&artifact) {
			Some(key) => {
				if let Some(existing) = list
					.iter_mut()
					.find(|a| artifact_key(a).as_deref() == Some(key.as_str()))
				{
					*existing = artifact;
				} else {
					list.push(artifact);
				}
			},
			// Identity cannot be determined: append, no idempotence claimed.
			None => list.push(artifact),
		}
		Task(Value::Object(obj))
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}

	pub fn into_value(self) -> Value {
		self.0
	}

	fn as_object(&self) -> &Map<String, Value> {
		self.0.as_object().expect("validated on construction")
	}
}

/// Artifact identity key: `artifactId`, else `id`, else `name`.
pub fn artifact_key(artifact: &Value) -> Option<String> {
	for field in ["artifactId", "id", "name"] {
		if let Some(s) = artifact.get(field).and_then(Value::as_str)
			&& !s.is_empty()
		{
			return Some(s.to_string());
		}
	}
	None
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
